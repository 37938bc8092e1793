//! The sync reactor: glue between the network channel and the
//! client/server/syncer trio.

use {
    crate::{
        client::Client,
        error::{Result, SyncError},
        pool::PeerPool,
        protocol::{
            self, PROTO_STATE_SYNC, SUB_HAS_NODE, SUB_HAS_NODE_RESULT, SUB_NODE_DATA,
            SUB_REQUEST_NODE_DATA, SYNC_PRIORITY,
        },
        server::Server,
        store::NodeStore,
        syncer::{SyncGoal, Syncer},
    },
    async_trait::async_trait,
    log::{debug, info, warn},
    std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, OnceLock,
    },
    tessera_network::{NetworkManager, Packet, PeerID, Reactor},
};

/// Owns the sync protocol on one channel: serves peers' requests at all
/// times and drives at most one catch-up run of its own.
pub struct SyncManager {
    store: Arc<dyn NodeStore>,
    pool: PeerPool,
    client: OnceLock<Arc<Client>>,
    server: OnceLock<Server>,
    syncer: Mutex<Option<Arc<Syncer>>>,
    syncing: AtomicBool,
}

impl SyncManager {
    /// Register the sync reactor on a channel.
    pub fn new(nm: &NetworkManager, store: Arc<dyn NodeStore>) -> Result<Arc<Self>> {
        let manager = Arc::new(Self {
            store: store.clone(),
            pool: PeerPool::new(),
            client: OnceLock::new(),
            server: OnceLock::new(),
            syncer: Mutex::new(None),
            syncing: AtomicBool::new(false),
        });
        let ph =
            nm.register_reactor("statesync", PROTO_STATE_SYNC, manager.clone(), SYNC_PRIORITY)?;
        let _ = manager.client.set(Arc::new(Client::new(ph.clone())));
        let _ = manager.server.set(Server::new(store, ph));
        info!("sync manager registered on channel {:?}", nm.channel());
        Ok(manager)
    }

    /// Whether a catch-up run is active.
    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    /// Start a catch-up run toward the goal tuple. Fails while another
    /// run is active.
    pub fn new_syncer(self: &Arc<Self>, goal: SyncGoal) -> Result<Arc<Syncer>> {
        if self.syncing.swap(true, Ordering::AcqRel) {
            return Err(SyncError::AlreadyRunning);
        }
        let client = self
            .client
            .get()
            .expect("client is set at construction")
            .clone();
        let weak = Arc::downgrade(self);
        let syncer = Syncer::new(
            goal,
            client,
            self.store.clone(),
            Box::new(move |syncing| {
                if let Some(manager) = weak.upgrade() {
                    manager.syncing.store(syncing, Ordering::Release);
                    if !syncing {
                        manager
                            .syncer
                            .lock()
                            .expect("syncer slot lock poisoned")
                            .take();
                    }
                }
            }),
        );
        *self.syncer.lock().expect("syncer slot lock poisoned") = Some(syncer.clone());

        let peers = self
            .pool
            .ids()
            .into_iter()
            .filter_map(|id| self.pool.get(&id))
            .collect();
        syncer.start(peers);
        Ok(syncer)
    }

    fn current_syncer(&self) -> Option<Arc<Syncer>> {
        self.syncer
            .lock()
            .expect("syncer slot lock poisoned")
            .clone()
    }
}

#[async_trait]
impl Reactor for SyncManager {
    async fn on_receive(
        &self,
        sub_protocol: u16,
        payload: &[u8],
        from: PeerID,
    ) -> tessera_network::Result<bool> {
        let Some(peer) = self.pool.get(&from) else {
            debug!("sync packet from unknown peer {from}, dropping");
            return Ok(false);
        };
        match sub_protocol {
            SUB_HAS_NODE => {
                if let Some(server) = self.server.get() {
                    if let Err(err) = server.on_has_node(payload, from) {
                        debug!("has_node from {from} failed: {err}");
                    }
                }
            }
            SUB_REQUEST_NODE_DATA => {
                if let Some(server) = self.server.get() {
                    if let Err(err) = server.on_request_node_data(payload, from) {
                        debug!("request_node_data from {from} failed: {err}");
                    }
                }
            }
            SUB_HAS_NODE_RESULT => {
                if let Some(syncer) = self.current_syncer() {
                    match protocol::decode(payload) {
                        Ok(msg) => syncer.on_has_node_result(&peer, msg),
                        Err(err) => debug!("bad has_node result from {from}: {err}"),
                    }
                }
            }
            SUB_NODE_DATA => {
                if let Some(syncer) = self.current_syncer() {
                    match protocol::decode(payload) {
                        Ok(msg) => syncer.on_node_data(&peer, msg),
                        Err(err) => debug!("bad node data from {from}: {err}"),
                    }
                }
            }
            sub => debug!("unknown sync subprotocol {sub:#06x} from {from}"),
        }
        Ok(false)
    }

    async fn on_join(&self, id: PeerID) {
        debug!("sync peer joined: {id}");
        let peer = self.pool.push(id);
        if let Some(syncer) = self.current_syncer() {
            syncer.on_join(peer);
        }
    }

    async fn on_leave(&self, id: PeerID) {
        debug!("sync peer left: {id}");
        self.pool.remove(&id);
        if let Some(syncer) = self.current_syncer() {
            syncer.on_leave(id);
        }
    }

    async fn on_failure(&self, err: tessera_network::NetworkError, pkt: &Packet) {
        warn!("sync send failed: {err} ({pkt:?})");
    }
}
