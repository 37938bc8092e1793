//! Account addresses.
//!
//! An address is a 20-byte identifier plus a flag distinguishing externally
//! owned accounts from contract accounts. The human-readable form prefixes
//! the hex body with `hx` (owned) or `cx` (contract); the canonical byte
//! encoding is 21 bytes — a one-byte flag followed by the body.

use {
    serde::{Deserialize, Serialize},
    sha3::{Digest, Sha3_256},
    std::fmt,
    thiserror::Error,
};

/// Length of the address body in bytes.
pub const ADDRESS_LEN: usize = 20;

/// Errors produced while parsing an address.
#[derive(Error, Debug, PartialEq)]
pub enum AddressError {
    /// The input did not have the expected length.
    #[error("invalid address length: {0}")]
    InvalidLength(usize),

    /// The human-readable form did not start with `hx` or `cx`.
    #[error("invalid address prefix: {0:?}")]
    InvalidPrefix(String),

    /// The hex body failed to decode.
    #[error("invalid address hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

/// A 20-byte account identifier with an owner-vs-contract flag.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address {
    is_contract: bool,
    body: [u8; ADDRESS_LEN],
}

impl Address {
    /// Build an externally-owned-account address from its raw body.
    pub fn new(body: [u8; ADDRESS_LEN]) -> Self {
        Self {
            is_contract: false,
            body,
        }
    }

    /// Build a contract address from its raw body.
    pub fn new_contract(body: [u8; ADDRESS_LEN]) -> Self {
        Self {
            is_contract: true,
            body,
        }
    }

    /// Derive the owned-account address of a public key: the trailing 20
    /// bytes of SHA3-256 over the raw key.
    pub fn from_public_key(public_key: &[u8]) -> Self {
        let digest = Sha3_256::digest(public_key);
        let mut body = [0u8; ADDRESS_LEN];
        body.copy_from_slice(&digest[digest.len() - ADDRESS_LEN..]);
        Self::new(body)
    }

    /// Parse the canonical 21-byte encoding (flag ‖ body).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AddressError> {
        if bytes.len() != ADDRESS_LEN + 1 {
            return Err(AddressError::InvalidLength(bytes.len()));
        }
        let mut body = [0u8; ADDRESS_LEN];
        body.copy_from_slice(&bytes[1..]);
        Ok(Self {
            is_contract: bytes[0] == 1,
            body,
        })
    }

    /// Parse the human-readable `hx…`/`cx…` form.
    pub fn from_str_form(s: &str) -> Result<Self, AddressError> {
        let (prefix, body_hex) = s.split_at(s.len().min(2));
        let is_contract = match prefix {
            "hx" => false,
            "cx" => true,
            _ => return Err(AddressError::InvalidPrefix(prefix.into())),
        };
        let decoded = hex::decode(body_hex)?;
        if decoded.len() != ADDRESS_LEN {
            return Err(AddressError::InvalidLength(decoded.len()));
        }
        let mut body = [0u8; ADDRESS_LEN];
        body.copy_from_slice(&decoded);
        Ok(Self { is_contract, body })
    }

    /// The canonical 21-byte encoding (flag ‖ body).
    pub fn to_bytes(&self) -> [u8; ADDRESS_LEN + 1] {
        let mut out = [0u8; ADDRESS_LEN + 1];
        out[0] = u8::from(self.is_contract);
        out[1..].copy_from_slice(&self.body);
        out
    }

    /// The 20-byte body without the flag.
    pub fn body(&self) -> &[u8; ADDRESS_LEN] {
        &self.body
    }

    /// Whether this address names a contract account.
    pub fn is_contract(&self) -> bool {
        self.is_contract
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = if self.is_contract { "cx" } else { "hx" };
        write!(f, "{}{}", prefix, hex::encode(self.body))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_bytes() {
        let a = Address::new([7u8; ADDRESS_LEN]);
        let b = Address::from_bytes(&a.to_bytes()).unwrap();
        assert_eq!(a, b);
        assert!(!b.is_contract());
    }

    #[test]
    fn test_roundtrip_string() {
        let a = Address::new_contract([0xAB; ADDRESS_LEN]);
        let s = a.to_string();
        assert!(s.starts_with("cx"));
        assert_eq!(Address::from_str_form(&s).unwrap(), a);
    }

    #[test]
    fn test_bad_prefix_rejected() {
        let err = Address::from_str_form("zz0000000000000000000000000000000000000000");
        assert!(matches!(err, Err(AddressError::InvalidPrefix(_))));
    }

    #[test]
    fn test_from_public_key_is_stable() {
        let pk = [3u8; 32];
        assert_eq!(Address::from_public_key(&pk), Address::from_public_key(&pk));
    }
}
