//! The node's signing identity.
//!
//! One [`Wallet`] per process. The wallet holds an ed25519 keypair and is
//! the source of the node's [`Address`]; the network layer derives its peer
//! identity from it and uses it to sign handshake material. Key storage and
//! encryption are out of scope here — the node feeds this type raw key
//! bytes from wherever it keeps them.

use {
    crate::address::Address,
    ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey},
    rand::rngs::OsRng,
    thiserror::Error,
};

/// Length of a raw ed25519 public key.
pub const PUBLIC_KEY_LEN: usize = 32;

/// Length of an ed25519 signature.
pub const SIGNATURE_LEN: usize = 64;

/// Errors produced by wallet operations.
#[derive(Error, Debug)]
pub enum WalletError {
    /// The supplied key material had the wrong length.
    #[error("invalid key length: {0}")]
    InvalidKeyLength(usize),

    /// The supplied public key bytes do not describe a valid curve point.
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Signature verification failed.
    #[error("signature verification failed")]
    BadSignature,
}

/// A signing identity backed by an ed25519 keypair.
pub struct Wallet {
    key: SigningKey,
}

impl Wallet {
    /// Generate a fresh random wallet.
    pub fn generate() -> Self {
        Self {
            key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Restore a wallet from a 32-byte secret key.
    pub fn from_secret(secret: &[u8]) -> Result<Self, WalletError> {
        let bytes: [u8; 32] = secret
            .try_into()
            .map_err(|_| WalletError::InvalidKeyLength(secret.len()))?;
        Ok(Self {
            key: SigningKey::from_bytes(&bytes),
        })
    }

    /// The raw public key.
    pub fn public_key(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.key.verifying_key().to_bytes()
    }

    /// The address derived from this wallet's public key.
    pub fn address(&self) -> Address {
        Address::from_public_key(&self.public_key())
    }

    /// Sign arbitrary bytes.
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.key.sign(message).to_bytes()
    }

    /// Verify a signature made by the holder of `public_key`.
    pub fn verify(
        public_key: &[u8],
        message: &[u8],
        signature: &[u8],
    ) -> Result<(), WalletError> {
        let pk_bytes: [u8; PUBLIC_KEY_LEN] = public_key
            .try_into()
            .map_err(|_| WalletError::InvalidKeyLength(public_key.len()))?;
        let key =
            VerifyingKey::from_bytes(&pk_bytes).map_err(|_| WalletError::InvalidPublicKey)?;
        let sig_bytes: [u8; SIGNATURE_LEN] = signature
            .try_into()
            .map_err(|_| WalletError::InvalidKeyLength(signature.len()))?;
        key.verify(message, &Signature::from_bytes(&sig_bytes))
            .map_err(|_| WalletError::BadSignature)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
