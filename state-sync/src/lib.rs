//! # Tessera State Sync
//!
//! Catch-up synchronization of world state over the Tessera network. A
//! restarting or lagging node reconstructs the state trie behind a goal
//! hash tuple by probing peers for availability (`HasNode`), then pulling
//! trie nodes in bounded-concurrency batches (`RequestNodeData`), walking
//! outward through the child hashes each received node references.
//!
//! The same reactor serves the other direction at all times: any peer's
//! probe or bulk request is answered straight from the local store.
//!
//! ## Crate modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`protocol`] | Wire types, subprotocol tags, timing constants |
//! | [`store`]    | `NodeStore` trait and the in-memory test store |
//! | [`manager`]  | The registered reactor; owns pool, client, server |
//! | [`client`]   | Request dispatch with per-peer ids and expiry timers |
//! | [`server`]   | Stateless request answering |
//! | [`syncer`]   | The catch-up coordinator |
//! | [`error`]    | Crate-wide error enum |

pub mod client;
pub mod error;
pub mod manager;
pub mod pool;
pub mod protocol;
pub mod server;
pub mod store;
pub mod syncer;

pub use {
    error::{Result, SyncError},
    manager::SyncManager,
    protocol::PROTO_STATE_SYNC,
    store::{MemoryStore, NodeStore},
    syncer::{SyncGoal, Syncer},
};
