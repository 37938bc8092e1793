//! Wire protocol of the state-sync channel.
//!
//! Two request/response pairs ride one registered protocol:
//!
//! - [`HasNode`] / [`HasNodeResult`] — a client asks whether a peer can
//!   serve the goal hash tuple; the server answers with a status.
//! - [`RequestNodeData`] / [`NodeData`] — bulk transfer of trie nodes by
//!   hash. A hash the server cannot resolve yields an empty byte string
//!   in the matching slot.
//!
//! Requests carry a per-peer monotonically increasing `req_id`; replies
//! echo it, and a reply whose id does not match the peer's outstanding
//! request is discarded as stale.

use serde::{Deserialize, Serialize};

/// Protocol id the sync reactor registers under.
pub const PROTO_STATE_SYNC: u16 = 0x0A00;

/// Send-queue priority of every sync packet.
pub const SYNC_PRIORITY: u8 = 3;

/// How long a request waits for its reply before a synthetic expiry is
/// injected, in milliseconds.
pub const EXPIRE_TIME_MS: u64 = 300;

// Subprotocol tags.
pub const SUB_HAS_NODE: u16 = 0x0001;
pub const SUB_HAS_NODE_RESULT: u16 = 0x0002;
pub const SUB_REQUEST_NODE_DATA: u16 = 0x0003;
pub const SUB_NODE_DATA: u16 = 0x0004;

/// `HasNodeResult` status: the peer can serve every requested hash.
pub const STATUS_OK: u8 = 0;
/// `HasNodeResult` status: at least one requested hash is unavailable.
pub const STATUS_NO_DATA: u8 = 1;

/// Node-data request type: world-state trie nodes.
pub const DATA_TYPE_STATE: u8 = 0;

/// Availability probe for the goal hash tuple.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HasNode {
    pub req_id: u32,
    pub state_hash: Vec<u8>,
    pub votes_hash: Vec<u8>,
    pub patch_receipts_hash: Vec<u8>,
    pub normal_receipts_hash: Vec<u8>,
}

/// Reply to [`HasNode`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HasNodeResult {
    pub req_id: u32,
    pub status: u8,
}

/// Bulk request for trie nodes by hash.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestNodeData {
    pub req_id: u32,
    pub data_type: u8,
    pub hashes: Vec<Vec<u8>>,
}

/// Reply to [`RequestNodeData`]; `nodes` aligns with the requested
/// hashes, with empty slots for misses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeData {
    pub req_id: u32,
    pub nodes: Vec<Vec<u8>>,
}

/// Serialize a sync message with bincode.
pub fn encode<T: Serialize>(msg: &T) -> crate::error::Result<Vec<u8>> {
    Ok(bincode::serialize(msg)?)
}

/// Deserialize a sync message.
pub fn decode<T: serde::de::DeserializeOwned>(data: &[u8]) -> crate::error::Result<T> {
    Ok(bincode::deserialize(data)?)
}

// ── Tests ───────────────────────────────────────────────────────────────────
