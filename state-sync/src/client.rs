//! Request side of the sync protocol.
//!
//! Each call unicasts one request to one peer, bumps the peer's request
//! id, and arms a 300 ms expiry timer. When the reply arrives the caller
//! cancels the timer; when the timer wins it injects a synthetic expiry
//! carrying the same request id, so a late reply and a raced timer cannot
//! both count.

use {
    crate::{
        error::{Result, SyncError},
        pool::SharedPeer,
        protocol::{
            self, HasNode, RequestNodeData, DATA_TYPE_STATE, EXPIRE_TIME_MS, SUB_HAS_NODE,
            SUB_REQUEST_NODE_DATA,
        },
        syncer::SyncGoal,
    },
    log::debug,
    std::time::Duration,
    tessera_network::{PeerID, ProtocolHandler},
    tokio::time::sleep,
};

/// Callback invoked when a request's timer fires before its reply.
pub(crate) type ExpireFn = Box<dyn Fn(PeerID, u32) + Send + Sync>;

pub(crate) struct Client {
    ph: ProtocolHandler,
}

impl Client {
    pub fn new(ph: ProtocolHandler) -> Self {
        Self { ph }
    }

    /// Ask a peer whether it can serve the goal tuple.
    pub fn has_node(&self, peer: &SharedPeer, goal: &SyncGoal, expired: ExpireFn) -> Result<()> {
        let mut guard = peer.lock().expect("sync peer lock poisoned");
        if guard.in_flight {
            return Err(SyncError::AlreadyInFlight(guard.id));
        }
        let req_id = guard.next_req_id();
        let msg = HasNode {
            req_id,
            state_hash: goal.state_hash.clone(),
            votes_hash: goal.votes_hash.clone(),
            patch_receipts_hash: goal.patch_receipts_hash.clone(),
            normal_receipts_hash: goal.normal_receipts_hash.clone(),
        };
        let bytes = protocol::encode(&msg)?;
        let id = guard.id;
        if let Err(err) = self.ph.unicast(SUB_HAS_NODE, bytes, id) {
            debug!("has_node to {id} failed: {err}");
            return Err(err.into());
        }
        guard.arm_timer(tokio::spawn(async move {
            sleep(Duration::from_millis(EXPIRE_TIME_MS)).await;
            debug!("has_node timer expired for {id} (req {req_id})");
            expired(id, req_id);
        }));
        Ok(())
    }

    /// Request a batch of trie nodes from a peer.
    pub fn request_node_data(
        &self,
        peer: &SharedPeer,
        hashes: Vec<Vec<u8>>,
        expired: ExpireFn,
    ) -> Result<()> {
        let mut guard = peer.lock().expect("sync peer lock poisoned");
        if guard.in_flight {
            return Err(SyncError::AlreadyInFlight(guard.id));
        }
        let req_id = guard.next_req_id();
        let msg = RequestNodeData {
            req_id,
            data_type: DATA_TYPE_STATE,
            hashes,
        };
        let bytes = protocol::encode(&msg)?;
        let id = guard.id;
        if let Err(err) = self.ph.unicast(SUB_REQUEST_NODE_DATA, bytes, id) {
            debug!("request_node_data to {id} failed: {err}");
            return Err(err.into());
        }
        guard.arm_timer(tokio::spawn(async move {
            sleep(Duration::from_millis(EXPIRE_TIME_MS)).await;
            debug!("request_node_data timer expired for {id} (req {req_id})");
            expired(id, req_id);
        }));
        Ok(())
    }
}
