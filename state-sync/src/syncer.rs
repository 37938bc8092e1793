//! The sync coordinator.
//!
//! A [`Syncer`] drives one catch-up run: it probes peers for the goal
//! tuple with `HasNode`, then fans `RequestNodeData` batches out to every
//! ready peer — one outstanding request per peer — absorbing replies into
//! the store and expanding the work queue with the child hashes each new
//! node references. A timed-out peer is marked slow and its batch is
//! re-issued to the next ready worker. The run completes when the work
//! queue and every in-flight batch are empty; the completion callback
//! fires exactly once with `syncing = false`.

use {
    crate::{
        client::Client,
        pool::SharedPeer,
        protocol::{HasNodeResult, NodeData, STATUS_OK},
        store::{node_hash, NodeStore},
    },
    log::{debug, info, warn},
    std::{
        collections::{HashMap, HashSet, VecDeque},
        sync::{Arc, Mutex, Weak},
    },
    tessera_network::PeerID,
    tokio::sync::watch,
};

/// Nodes requested from one peer in one round.
const BATCH_SIZE: usize = 8;

/// The hash tuple a sync run reconstructs. Empty slots are unused.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncGoal {
    pub state_hash: Vec<u8>,
    pub votes_hash: Vec<u8>,
    pub patch_receipts_hash: Vec<u8>,
    pub normal_receipts_hash: Vec<u8>,
}

impl SyncGoal {
    /// The non-empty hashes of the tuple.
    pub fn hashes(&self) -> Vec<Vec<u8>> {
        [
            &self.state_hash,
            &self.votes_hash,
            &self.patch_receipts_hash,
            &self.normal_receipts_hash,
        ]
        .into_iter()
        .filter(|h| !h.is_empty())
        .cloned()
        .collect()
    }
}

struct SyncerState {
    want: VecDeque<Vec<u8>>,
    wanted: HashSet<Vec<u8>>,
    in_flight: HashMap<PeerID, Vec<Vec<u8>>>,
    idle: Vec<SharedPeer>,
    completed: bool,
}

/// One catch-up run.
pub struct Syncer {
    goal: SyncGoal,
    client: Arc<Client>,
    store: Arc<dyn NodeStore>,
    state: Mutex<SyncerState>,
    on_complete: Mutex<Option<Box<dyn FnOnce(bool) + Send>>>,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

impl Syncer {
    pub(crate) fn new(
        goal: SyncGoal,
        client: Arc<Client>,
        store: Arc<dyn NodeStore>,
        on_complete: Box<dyn FnOnce(bool) + Send>,
    ) -> Arc<Self> {
        let mut want = VecDeque::new();
        let mut wanted = HashSet::new();
        for hash in goal.hashes() {
            if !store.has(&hash) && wanted.insert(hash.clone()) {
                want.push_back(hash);
            }
        }
        let (done_tx, done_rx) = watch::channel(false);
        Arc::new(Self {
            goal,
            client,
            store,
            state: Mutex::new(SyncerState {
                want,
                wanted,
                in_flight: HashMap::new(),
                idle: Vec::new(),
                completed: false,
            }),
            on_complete: Mutex::new(Some(on_complete)),
            done_tx,
            done_rx,
        })
    }

    /// Probe the given peers and finish immediately when there is nothing
    /// to fetch.
    pub(crate) fn start(self: &Arc<Self>, peers: Vec<SharedPeer>) {
        info!("state sync starting ({} peers)", peers.len());
        self.check_complete();
        for peer in peers {
            self.on_join(peer);
        }
    }

    /// Whether this run has completed.
    pub fn is_complete(&self) -> bool {
        self.state.lock().expect("syncer lock poisoned").completed
    }

    /// Park until the run completes.
    pub async fn wait(&self) {
        let mut rx = self.done_rx.clone();
        if *rx.borrow() {
            return;
        }
        let _ = rx.changed().await;
    }

    // ── Event entry points (called by the manager) ──────────────────────

    /// A peer became available: probe it for the goal tuple.
    pub(crate) fn on_join(self: &Arc<Self>, peer: SharedPeer) {
        if self.is_complete() {
            return;
        }
        let expired = self.expire_fn(peer.clone());
        if let Err(err) = self.client.has_node(&peer, &self.goal, expired) {
            debug!("has_node probe failed: {err}");
        }
    }

    /// A peer left: its batch goes back to the front of the queue.
    pub(crate) fn on_leave(self: &Arc<Self>, id: PeerID) {
        let mut state = self.state.lock().expect("syncer lock poisoned");
        if let Some(batch) = state.in_flight.remove(&id) {
            for hash in batch.into_iter().rev() {
                state.want.push_front(hash);
            }
        }
        state
            .idle
            .retain(|p| p.lock().expect("sync peer lock poisoned").id != id);
        drop(state);
        self.dispatch_idle();
    }

    pub(crate) fn on_has_node_result(self: &Arc<Self>, peer: &SharedPeer, msg: HasNodeResult) {
        {
            let mut guard = peer.lock().expect("sync peer lock poisoned");
            if !guard.in_flight || guard.req_id != msg.req_id {
                debug!("stale has_node result (req {})", msg.req_id);
                return;
            }
            guard.cancel_timer();
        }
        if msg.status != STATUS_OK {
            debug!("peer cannot serve the goal (status {})", msg.status);
            return;
        }
        self.issue_next(peer);
    }

    pub(crate) fn on_node_data(self: &Arc<Self>, peer: &SharedPeer, msg: NodeData) {
        let id = {
            let mut guard = peer.lock().expect("sync peer lock poisoned");
            if !guard.in_flight || guard.req_id != msg.req_id {
                debug!("stale node data (req {})", msg.req_id);
                return;
            }
            guard.cancel_timer();
            guard.id
        };

        {
            let mut state = self.state.lock().expect("syncer lock poisoned");
            let assigned = state.in_flight.remove(&id).unwrap_or_default();
            let outcome = absorb_nodes(self.store.as_ref(), &assigned, &msg.nodes);
            for hash in outcome.satisfied {
                state.wanted.remove(&hash);
            }
            for hash in outcome.requeue {
                // Still wanted; try again, possibly from another peer.
                state.want.push_back(hash);
            }
            for hash in outcome.discovered {
                if state.wanted.insert(hash.clone()) {
                    state.want.push_back(hash);
                }
            }
        }

        self.issue_next(peer);
        self.dispatch_idle();
    }

    /// Synthetic expiry injected by the request timer. The request id
    /// absorbs races with a reply that arrived just in time.
    pub(crate) fn on_timeout(self: &Arc<Self>, peer: &SharedPeer, req_id: u32) {
        let id = {
            let mut guard = peer.lock().expect("sync peer lock poisoned");
            if !guard.in_flight || guard.req_id != req_id {
                return;
            }
            guard.cancel_timer();
            guard.id
        };
        warn!("peer {id} timed out (req {req_id}), marking slow");

        // Hand the batch to the next ready worker; the slow peer is not
        // re-admitted this run.
        let next = {
            let mut state = self.state.lock().expect("syncer lock poisoned");
            if let Some(batch) = state.in_flight.remove(&id) {
                for hash in batch.into_iter().rev() {
                    state.want.push_front(hash);
                }
            }
            state.idle.pop()
        };
        if let Some(worker) = next {
            self.issue_next(&worker);
        }
    }

    // ── Internals ───────────────────────────────────────────────────────

    fn expire_fn(self: &Arc<Self>, peer: SharedPeer) -> crate::client::ExpireFn {
        let weak: Weak<Syncer> = Arc::downgrade(self);
        Box::new(move |_id, req_id| {
            if let Some(syncer) = weak.upgrade() {
                syncer.on_timeout(&peer, req_id);
            }
        })
    }

    /// Give a ready worker its next batch, or park it idle when the queue
    /// is momentarily empty.
    fn issue_next(self: &Arc<Self>, peer: &SharedPeer) {
        let batch = {
            let mut state = self.state.lock().expect("syncer lock poisoned");
            if state.completed {
                return;
            }
            let mut batch = Vec::new();
            while batch.len() < BATCH_SIZE {
                match state.want.pop_front() {
                    Some(hash) => batch.push(hash),
                    None => break,
                }
            }
            if batch.is_empty() {
                state.idle.push(peer.clone());
                drop(state);
                self.check_complete();
                return;
            }
            let id = peer.lock().expect("sync peer lock poisoned").id;
            state.in_flight.insert(id, batch.clone());
            batch
        };

        let expired = self.expire_fn(peer.clone());
        if let Err(err) = self.client.request_node_data(peer, batch.clone(), expired) {
            debug!("request_node_data failed: {err}");
            let mut state = self.state.lock().expect("syncer lock poisoned");
            let id = peer.lock().expect("sync peer lock poisoned").id;
            state.in_flight.remove(&id);
            for hash in batch.into_iter().rev() {
                state.want.push_front(hash);
            }
        }
    }

    /// Put parked workers back to work after the queue grew.
    fn dispatch_idle(self: &Arc<Self>) {
        loop {
            let worker = {
                let mut state = self.state.lock().expect("syncer lock poisoned");
                if state.want.is_empty() {
                    break;
                }
                match state.idle.pop() {
                    Some(w) => w,
                    None => break,
                }
            };
            self.issue_next(&worker);
        }
    }

    fn check_complete(&self) {
        let fire = {
            let mut state = self.state.lock().expect("syncer lock poisoned");
            if state.completed || !state.want.is_empty() || !state.in_flight.is_empty() {
                false
            } else {
                state.completed = true;
                true
            }
        };
        if !fire {
            return;
        }
        info!("state sync complete");
        if let Some(cb) = self
            .on_complete
            .lock()
            .expect("completion lock poisoned")
            .take()
        {
            cb(false);
        }
        let _ = self.done_tx.send(true);
    }
}

/// What one `NodeData` reply did to the work set.
struct AbsorbOutcome {
    satisfied: Vec<Vec<u8>>,
    requeue: Vec<Vec<u8>>,
    discovered: Vec<Vec<u8>>,
}

/// Store verified nodes, requeue misses and mismatches, and surface the
/// child hashes the new nodes reference.
fn absorb_nodes(store: &dyn NodeStore, assigned: &[Vec<u8>], nodes: &[Vec<u8>]) -> AbsorbOutcome {
    let mut outcome = AbsorbOutcome {
        satisfied: Vec::new(),
        requeue: Vec::new(),
        discovered: Vec::new(),
    };
    for (i, hash) in assigned.iter().enumerate() {
        let node = nodes.get(i).map(Vec::as_slice).unwrap_or_default();
        if node.is_empty() {
            outcome.requeue.push(hash.clone());
            continue;
        }
        if node_hash(node) != *hash {
            warn!("node data does not match requested hash, requeueing");
            outcome.requeue.push(hash.clone());
            continue;
        }
        store.put(hash, node);
        outcome.satisfied.push(hash.clone());
        for child in store.children(node) {
            if !store.has(&child) {
                outcome.discovered.push(child);
            }
        }
    }
    outcome
}

// ── Tests ───────────────────────────────────────────────────────────────────
