//! # Tessera Common
//!
//! Identity primitives shared by every Tessera subsystem:
//!
//! - [`Address`] — the 20-byte account identifier, with its human-readable
//!   `hx…`/`cx…` hex form and canonical byte encoding.
//! - [`Wallet`] — the node's signing identity (ed25519), from which the
//!   node's network address is derived.
//!
//! Heavier concerns (transport, consensus, storage) live in their own
//! crates and depend on this one.

pub mod address;
pub mod wallet;

pub use {
    address::{Address, AddressError, ADDRESS_LEN},
    wallet::{Wallet, WalletError, PUBLIC_KEY_LEN, SIGNATURE_LEN},
};
