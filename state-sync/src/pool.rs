//! Per-peer request bookkeeping for the sync protocol.

use {
    std::{
        collections::HashMap,
        sync::{Arc, Mutex},
    },
    tessera_network::PeerID,
    tokio::task::JoinHandle,
};

/// One peer's request state: a monotonically increasing request id and at
/// most one armed expiry timer.
pub(crate) struct SyncPeer {
    pub id: PeerID,
    pub req_id: u32,
    pub in_flight: bool,
    timer: Option<JoinHandle<()>>,
}

impl SyncPeer {
    pub fn new(id: PeerID) -> Self {
        Self {
            id,
            req_id: 0,
            in_flight: false,
            timer: None,
        }
    }

    /// Allocate the next request id.
    pub fn next_req_id(&mut self) -> u32 {
        self.req_id = self.req_id.wrapping_add(1);
        self.req_id
    }

    /// Arm the expiry timer for the outstanding request, replacing any
    /// previous one.
    pub fn arm_timer(&mut self, handle: JoinHandle<()>) {
        self.cancel_timer();
        self.timer = Some(handle);
        self.in_flight = true;
    }

    /// Best-effort cancel; a timer that already fired is absorbed by the
    /// request-id check on the callback side.
    pub fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.in_flight = false;
    }
}

impl Drop for SyncPeer {
    fn drop(&mut self) {
        self.cancel_timer();
    }
}

pub(crate) type SharedPeer = Arc<Mutex<SyncPeer>>;

/// The set of peers available to the sync protocol on this channel.
#[derive(Default)]
pub(crate) struct PeerPool {
    peers: Mutex<HashMap<PeerID, SharedPeer>>,
}

impl PeerPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, id: PeerID) -> SharedPeer {
        let peer = Arc::new(Mutex::new(SyncPeer::new(id)));
        self.peers
            .lock()
            .expect("peer pool lock poisoned")
            .insert(id, peer.clone());
        peer
    }

    pub fn remove(&self, id: &PeerID) -> Option<SharedPeer> {
        self.peers
            .lock()
            .expect("peer pool lock poisoned")
            .remove(id)
    }

    pub fn get(&self, id: &PeerID) -> Option<SharedPeer> {
        self.peers
            .lock()
            .expect("peer pool lock poisoned")
            .get(id)
            .cloned()
    }

    pub fn ids(&self) -> Vec<PeerID> {
        self.peers
            .lock()
            .expect("peer pool lock poisoned")
            .keys()
            .copied()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.lock().expect("peer pool lock poisoned").len()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
