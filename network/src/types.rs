//! Core identity and addressing types shared across the network layer.

use {
    crate::error::NetworkError,
    serde::{Deserialize, Serialize},
    std::fmt,
    tessera_common::Address,
};

/// Length of a peer identity on the wire.
pub const PEER_ID_LEN: usize = 20;

// ── PeerID ──────────────────────────────────────────────────────────────────

/// Identity of a network peer, derived from the public key of the node's
/// wallet. Equal to an [`Address`]; persists across reconnects.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerID(Address);

impl PeerID {
    pub fn from_address(addr: Address) -> Self {
        Self(addr)
    }

    pub fn from_public_key(public_key: &[u8]) -> Self {
        Self(Address::from_public_key(public_key))
    }

    /// The all-zero identity, used as a placeholder before authentication.
    pub fn zero() -> Self {
        Self(Address::new([0u8; PEER_ID_LEN]))
    }

    pub fn is_zero(&self) -> bool {
        self.0.body() == &[0u8; PEER_ID_LEN]
    }

    pub fn address(&self) -> &Address {
        &self.0
    }

    /// The fixed 20-byte wire form.
    pub fn to_wire(&self) -> [u8; PEER_ID_LEN] {
        *self.0.body()
    }

    pub fn from_wire(bytes: [u8; PEER_ID_LEN]) -> Self {
        Self(Address::new(bytes))
    }
}

impl fmt::Display for PeerID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for PeerID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── NetAddress ──────────────────────────────────────────────────────────────

/// A `host:port` dialable address.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NetAddress(String);

impl NetAddress {
    /// Validate and wrap a `host:port` string. The port must be in
    /// `[1, 65535]`.
    pub fn new(s: impl Into<String>) -> Result<Self, NetworkError> {
        let s = s.into();
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| NetworkError::InvalidAddress(s.clone()))?;
        if host.is_empty() {
            return Err(NetworkError::InvalidAddress(s.clone()));
        }
        match port.parse::<u32>() {
            Ok(p) if (1..=65535).contains(&p) => Ok(Self(s)),
            _ => Err(NetworkError::InvalidAddress(s)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for NetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Roles ───────────────────────────────────────────────────────────────────

/// Role bitset: bit 0 = Seed, bit 1 = Root.
///
/// A node with neither bit is a citizen; a validator carries the Root bit.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct RoleFlag(u8);

impl RoleFlag {
    pub const NONE: RoleFlag = RoleFlag(0x00);
    pub const SEED: RoleFlag = RoleFlag(0x01);
    pub const ROOT: RoleFlag = RoleFlag(0x02);
    pub const ROOT_SEED: RoleFlag = RoleFlag(0x03);

    pub fn from_bits(bits: u8) -> Self {
        Self(bits & Self::ROOT_SEED.0)
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    /// True when every bit of `other` is present.
    pub fn has(&self, other: RoleFlag) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn set(&mut self, other: RoleFlag) {
        self.0 |= other.0;
    }

    pub fn unset(&mut self, other: RoleFlag) {
        self.0 &= !other.0;
    }

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for RoleFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::NONE => f.write_str("Citizen"),
            Self::SEED => f.write_str("Seed"),
            Self::ROOT => f.write_str("Root"),
            _ => f.write_str("RootSeed"),
        }
    }
}

impl fmt::Display for RoleFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

// ── Connection types ────────────────────────────────────────────────────────

/// The relationship of a peer to this node inside a channel's topology.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[repr(u8)]
pub enum ConnectionType {
    Orphanage = 0,
    Parent = 1,
    Children = 2,
    Uncle = 3,
    Nephew = 4,
    Friend = 5,
    Other = 6,
}

impl ConnectionType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Orphanage),
            1 => Some(Self::Parent),
            2 => Some(Self::Children),
            3 => Some(Self::Uncle),
            4 => Some(Self::Nephew),
            5 => Some(Self::Friend),
            6 => Some(Self::Other),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Orphanage => "Orphanage",
            Self::Parent => "Parent",
            Self::Children => "Children",
            Self::Uncle => "Uncle",
            Self::Nephew => "Nephew",
            Self::Friend => "Friend",
            Self::Other => "Other",
        };
        f.write_str(s)
    }
}

// ── Broadcast types ─────────────────────────────────────────────────────────

/// Fan-out selector for [`crate::overlay::PeerToPeer::broadcast`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[repr(u8)]
pub enum BroadcastType {
    /// Every connected peer.
    AllNeighbor = 0,
    /// Friends, parent, and children only.
    Neighbor = 1,
    /// Children only (parents propagating down).
    Children = 2,
}

impl BroadcastType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::AllNeighbor),
            1 => Some(Self::Neighbor),
            2 => Some(Self::Children),
            _ => None,
        }
    }
}

// ── Protocol tags ───────────────────────────────────────────────────────────

/// The routing key of a packet inside a channel: a top-level protocol tag
/// and a protocol-private subprotocol tag.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct ProtocolInfo {
    pub id: u16,
    pub sub: u16,
}

impl ProtocolInfo {
    pub const fn new(id: u16, sub: u16) -> Self {
        Self { id, sub }
    }
}

impl fmt::Display for ProtocolInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}/{:#06x}", self.id, self.sub)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_net_address_validation() {
        assert!(NetAddress::new("127.0.0.1:8080").is_ok());
        assert!(NetAddress::new("node.example.com:1").is_ok());
        assert!(NetAddress::new("127.0.0.1:0").is_err());
        assert!(NetAddress::new("127.0.0.1:65536").is_err());
        assert!(NetAddress::new("127.0.0.1").is_err());
        assert!(NetAddress::new(":8080").is_err());
    }

    #[test]
    fn test_role_flag_bits() {
        let mut r = RoleFlag::NONE;
        assert!(r.is_none());
        r.set(RoleFlag::SEED);
        assert!(r.has(RoleFlag::SEED));
        assert!(!r.has(RoleFlag::ROOT));
        r.set(RoleFlag::ROOT);
        assert!(r.has(RoleFlag::ROOT_SEED));
        r.unset(RoleFlag::SEED);
        assert_eq!(r, RoleFlag::ROOT);
    }

    #[test]
    fn test_role_flag_masks_unknown_bits() {
        assert_eq!(RoleFlag::from_bits(0xFF), RoleFlag::ROOT_SEED);
    }

    #[test]
    fn test_peer_id_wire_roundtrip() {
        let id = PeerID::from_public_key(&[9u8; 32]);
        assert_eq!(PeerID::from_wire(id.to_wire()), id);
        assert!(!id.is_zero());
        assert!(PeerID::zero().is_zero());
    }

    #[test]
    fn test_connection_type_tags() {
        assert_eq!(ConnectionType::from_u8(1), Some(ConnectionType::Parent));
        assert_eq!(ConnectionType::from_u8(5), Some(ConnectionType::Friend));
        assert_eq!(ConnectionType::from_u8(7), None);
        assert_eq!(ConnectionType::Children.to_string(), "Children");
    }
}
