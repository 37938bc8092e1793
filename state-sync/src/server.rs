//! Serving side of the sync protocol. Stateless per request.

use {
    crate::{
        error::Result,
        protocol::{
            self, HasNode, HasNodeResult, NodeData, RequestNodeData, STATUS_NO_DATA, STATUS_OK,
            SUB_HAS_NODE_RESULT, SUB_NODE_DATA,
        },
        store::NodeStore,
    },
    log::debug,
    std::sync::Arc,
    tessera_network::{PeerID, ProtocolHandler},
};

pub(crate) struct Server {
    store: Arc<dyn NodeStore>,
    ph: ProtocolHandler,
}

impl Server {
    pub fn new(store: Arc<dyn NodeStore>, ph: ProtocolHandler) -> Self {
        Self { store, ph }
    }

    /// Answer an availability probe: OK only when every non-empty hash of
    /// the tuple is present.
    pub fn on_has_node(&self, payload: &[u8], from: PeerID) -> Result<()> {
        let msg: HasNode = protocol::decode(payload)?;
        let wanted = [
            &msg.state_hash,
            &msg.votes_hash,
            &msg.patch_receipts_hash,
            &msg.normal_receipts_hash,
        ];
        let status = if wanted
            .iter()
            .filter(|h| !h.is_empty())
            .all(|h| self.store.has(h))
        {
            STATUS_OK
        } else {
            STATUS_NO_DATA
        };
        debug!("has_node from {from}: req {} status {status}", msg.req_id);
        let reply = HasNodeResult {
            req_id: msg.req_id,
            status,
        };
        self.ph
            .unicast(SUB_HAS_NODE_RESULT, protocol::encode(&reply)?, from)?;
        Ok(())
    }

    /// Answer a bulk node request; misses become empty slots the client
    /// discards.
    pub fn on_request_node_data(&self, payload: &[u8], from: PeerID) -> Result<()> {
        let msg: RequestNodeData = protocol::decode(payload)?;
        let nodes: Vec<Vec<u8>> = msg
            .hashes
            .iter()
            .map(|h| self.store.get(h).unwrap_or_default())
            .collect();
        debug!(
            "request_node_data from {from}: req {} ({} hashes)",
            msg.req_id,
            msg.hashes.len()
        );
        let reply = NodeData {
            req_id: msg.req_id,
            nodes,
        };
        self.ph
            .unicast(SUB_NODE_DATA, protocol::encode(&reply)?, from)?;
        Ok(())
    }
}
