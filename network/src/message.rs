//! Control-plane message types and serialization.
//!
//! All control messages are serialized with bincode for compact wire
//! representation and ride protocol [`PROTO_CONTROL`]. The handshake
//! messages ([`ChannelQuery`], [`ChannelResult`], [`AuthHello`],
//! [`AuthConfirm`]) are consumed by the handler chain before a peer is
//! attached; the topology messages ([`QueryMessage`],
//! [`QueryResultMessage`]) are exchanged between attached peers on the
//! overlay's maintenance tick.

use {
    crate::{
        error::Result,
        types::{ConnectionType, NetAddress, RoleFlag},
    },
    serde::{de::DeserializeOwned, Deserialize, Serialize},
};

/// Top-level protocol tag reserved for the control plane.
pub const PROTO_CONTROL: u16 = 0x0000;

// Control subprotocol tags, one per message type.
pub const SUB_CHANNEL_QUERY: u16 = 0x0001;
pub const SUB_CHANNEL_RESULT: u16 = 0x0002;
pub const SUB_AUTH_HELLO: u16 = 0x0003;
pub const SUB_AUTH_CONFIRM: u16 = 0x0004;
pub const SUB_QUERY: u16 = 0x0005;
pub const SUB_QUERY_RESULT: u16 = 0x0006;

// ── Handshake messages ──────────────────────────────────────────────────────

/// First packet of an outbound connection: the dialer names the logical
/// network it wants to join and its own dialable address.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelQuery {
    pub channel: String,
    pub addr: Option<NetAddress>,
}

/// Reply to [`ChannelQuery`]: agreement or rejection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelResult {
    pub ok: bool,
    pub reason: String,
    pub addr: Option<NetAddress>,
}

/// Identity round of the authentication handshake.
///
/// Carries the node's long-lived identity key, a fresh nonce, and an
/// ephemeral x25519 public key contributing to the session key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthHello {
    pub public_key: [u8; 32],
    pub nonce: [u8; 32],
    pub session_key: [u8; 32],
}

/// Confirmation round: a signature binding the sender's identity key to
/// the receiver's nonce and the sender's session-key contribution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthConfirm {
    #[serde(with = "serde_sig")]
    pub signature: [u8; 64],
    pub session_key: [u8; 32],
}

// serde lacks blanket impls for [u8; 64]; encode as a length-checked Vec.
mod serde_sig {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(v: &[u8; 64], s: S) -> Result<S::Ok, S::Error> {
        v.as_slice().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 64], D::Error> {
        let v = Vec::<u8>::deserialize(d)?;
        v.try_into()
            .map_err(|_| serde::de::Error::custom("expected 64-byte signature"))
    }
}

// ── Topology messages ───────────────────────────────────────────────────────

/// Periodic query a node sends to its parent: everything it knows about
/// the channel's seeds and roots, its declared role, what the replier is
/// to it (parent, uncle, friend), and how loaded its own downstream slots
/// are.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueryMessage {
    pub role: RoleFlag,
    pub conn_type: ConnectionType,
    pub seeds: Vec<NetAddress>,
    pub roots: Vec<NetAddress>,
    pub children: u16,
    pub nephews: u16,
}

/// Reply to [`QueryMessage`]: the replier's seed/root tables and its
/// assessment of the querier's role.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueryResultMessage {
    pub seeds: Vec<NetAddress>,
    pub roots: Vec<NetAddress>,
    pub observed_role: RoleFlag,
    pub message: String,
}

// ── Serialization helpers ───────────────────────────────────────────────────

/// Serialize a control message to bytes using bincode.
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(msg)?)
}

/// Deserialize a control message from bytes.
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(data)?)
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_query_roundtrip() {
        let msg = ChannelQuery {
            channel: "main".into(),
            addr: Some(NetAddress::new("10.0.0.1:9000").unwrap()),
        };
        let bytes = encode(&msg).unwrap();
        let back: ChannelQuery = decode(&bytes).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn test_auth_confirm_roundtrip() {
        let msg = AuthConfirm {
            signature: [7u8; 64],
            session_key: [9u8; 32],
        };
        let bytes = encode(&msg).unwrap();
        let back: AuthConfirm = decode(&bytes).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn test_query_roundtrip() {
        let msg = QueryMessage {
            role: RoleFlag::SEED,
            conn_type: ConnectionType::Parent,
            seeds: vec![NetAddress::new("10.0.0.1:9000").unwrap()],
            roots: vec![],
            children: 3,
            nephews: 1,
        };
        let bytes = encode(&msg).unwrap();
        let back: QueryMessage = decode(&bytes).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn test_bad_signature_length_rejected() {
        // A 63-byte "signature" must fail to decode.
        #[derive(Serialize)]
        struct Fake {
            signature: Vec<u8>,
            session_key: [u8; 32],
        }
        let bytes = encode(&Fake {
            signature: vec![0u8; 63],
            session_key: [0u8; 32],
        })
        .unwrap();
        assert!(decode::<AuthConfirm>(&bytes).is_err());
    }
}
