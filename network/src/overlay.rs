//! The per-channel overlay: topology, maintenance, and routing.
//!
//! One [`PeerToPeer`] per channel. It keeps the table of attached peers
//! and their connection types, heals the topology on a one-second tick,
//! and routes application packets with unicast, multicast-by-role, and
//! broadcast semantics.
//!
//! ## Topology
//!
//! The desired neighbor set depends on the node's role:
//!
//! | Node role | Friends | Parent | Children | Uncle | Nephew |
//! |-----------|---------|--------|----------|-------|--------|
//! | Root      | all other roots | — | — | — | — |
//! | Seed      | — | one seed | citizens | one seed | citizens |
//! | Citizen   | — | one seed | — | one seed | — |
//!
//! On each tick the overlay queries its parent (and uncle) with the seeds
//! and roots it knows; the reply refreshes those tables and carries the
//! replier's assessment of this node's role. A parentless node picks a
//! parent from the known seed/root addresses under a per-address redial
//! backoff, and connection types over their slot limit close oldest-first.

use {
    crate::{
        config::NetworkConfig,
        error::{NetworkError, Result},
        manager::{Reactor, RegisteredProtocol},
        message::{
            self, QueryMessage, QueryResultMessage, PROTO_CONTROL, SUB_QUERY, SUB_QUERY_RESULT,
        },
        packet::{Packet, PacketDest},
        peer::{Peer, PeerSink},
        pool::TimestampPool,
        transport::Dialer,
        types::{BroadcastType, ConnectionType, NetAddress, PeerID, RoleFlag},
    },
    async_trait::async_trait,
    log::{debug, trace, warn},
    std::{
        collections::{HashMap, HashSet},
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc, Mutex, RwLock,
        },
        time::Instant,
    },
    tessera_monitoring::NetworkMetrics,
    tokio::{
        sync::watch,
        time::{interval, MissedTickBehavior},
    },
};

/// Per-channel overlay and router.
pub struct PeerToPeer {
    channel: String,
    self_id: PeerID,
    self_addr: Option<NetAddress>,
    dialer: Dialer,
    config: Arc<NetworkConfig>,
    metrics: Arc<NetworkMetrics>,

    declared_role: RwLock<RoleFlag>,
    effective_role: RwLock<RoleFlag>,

    peers: RwLock<HashMap<PeerID, Arc<Peer>>>,
    seeds: RwLock<HashSet<NetAddress>>,
    roots: RwLock<HashSet<NetAddress>>,

    registry: RwLock<HashMap<u16, RegisteredProtocol>>,

    /// Hashes of multicast/broadcast packets already delivered upward.
    /// Two copies arriving over different links yield one upcall.
    packet_pool: TimestampPool,

    dial_backoff: Mutex<HashMap<NetAddress, Instant>>,
    pending_dial: Mutex<HashMap<NetAddress, ConnectionType>>,
    disputes: Mutex<HashMap<PeerID, u32>>,

    started: AtomicBool,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
}

impl PeerToPeer {
    pub fn new(
        channel: &str,
        self_id: PeerID,
        self_addr: Option<NetAddress>,
        dialer: Dialer,
        config: Arc<NetworkConfig>,
        metrics: Arc<NetworkMetrics>,
    ) -> Arc<Self> {
        let mut seeds: HashSet<NetAddress> = config.seeds.iter().cloned().collect();
        let mut roots: HashSet<NetAddress> = config.trusted_roots.iter().cloned().collect();
        if let Some(me) = &self_addr {
            // Own address belongs in the tables we advertise, but never in
            // the dial candidates; excluded at selection time instead.
            seeds.remove(me);
            roots.remove(me);
        }
        let role = config.role;
        let (stop_tx, stop_rx) = watch::channel(false);
        Arc::new(Self {
            channel: channel.to_string(),
            self_id,
            self_addr,
            dialer,
            config,
            metrics,
            declared_role: RwLock::new(role),
            effective_role: RwLock::new(role),
            peers: RwLock::new(HashMap::new()),
            seeds: RwLock::new(seeds),
            roots: RwLock::new(roots),
            registry: RwLock::new(HashMap::new()),
            packet_pool: TimestampPool::new(),
            dial_backoff: Mutex::new(HashMap::new()),
            pending_dial: Mutex::new(HashMap::new()),
            disputes: Mutex::new(HashMap::new()),
            started: AtomicBool::new(false),
            stop_tx,
            stop_rx,
        })
    }

    /// Start the maintenance tick. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let p2p = self.clone();
        tokio::spawn(async move {
            p2p.tick_loop().await;
        });
    }

    /// Stop the tick task and close every attached peer.
    pub fn close(&self) {
        let _ = self.stop_tx.send(true);
        let peers: Vec<Arc<Peer>> = self
            .peers
            .read()
            .expect("peer table lock poisoned")
            .values()
            .cloned()
            .collect();
        for peer in peers {
            peer.close("overlay closed");
        }
    }

    // ── Accessors ───────────────────────────────────────────────────────

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn self_id(&self) -> PeerID {
        self.self_id
    }

    pub fn config(&self) -> &Arc<NetworkConfig> {
        &self.config
    }

    /// The application-declared role.
    pub fn declared_role(&self) -> RoleFlag {
        *self.declared_role.read().expect("role lock poisoned")
    }

    /// The role in force after query disputes.
    pub fn effective_role(&self) -> RoleFlag {
        *self.effective_role.read().expect("role lock poisoned")
    }

    pub fn set_role(&self, role: RoleFlag) {
        *self.declared_role.write().expect("role lock poisoned") = role;
        *self.effective_role.write().expect("role lock poisoned") = role;
    }

    pub fn peer_ids(&self) -> Vec<PeerID> {
        self.peers
            .read()
            .expect("peer table lock poisoned")
            .keys()
            .copied()
            .collect()
    }

    pub fn peer(&self, id: &PeerID) -> Option<Arc<Peer>> {
        self.peers
            .read()
            .expect("peer table lock poisoned")
            .get(id)
            .cloned()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().expect("peer table lock poisoned").len()
    }

    pub fn seeds(&self) -> Vec<NetAddress> {
        let mut v: Vec<NetAddress> = self
            .seeds
            .read()
            .expect("seed table lock poisoned")
            .iter()
            .cloned()
            .collect();
        v.sort();
        v
    }

    pub fn roots(&self) -> Vec<NetAddress> {
        let mut v: Vec<NetAddress> = self
            .roots
            .read()
            .expect("root table lock poisoned")
            .iter()
            .cloned()
            .collect();
        v.sort();
        v
    }

    fn peers_of_type(&self, ct: ConnectionType) -> Vec<Arc<Peer>> {
        self.peers
            .read()
            .expect("peer table lock poisoned")
            .values()
            .filter(|p| p.conn_type() == ct)
            .cloned()
            .collect()
    }

    fn peer_of_type(&self, ct: ConnectionType) -> Option<Arc<Peer>> {
        self.peers
            .read()
            .expect("peer table lock poisoned")
            .values()
            .find(|p| p.conn_type() == ct)
            .cloned()
    }

    pub fn parent(&self) -> Option<Arc<Peer>> {
        self.peer_of_type(ConnectionType::Parent)
    }

    fn count_conn_type(&self, ct: ConnectionType) -> usize {
        self.peers
            .read()
            .expect("peer table lock poisoned")
            .values()
            .filter(|p| p.conn_type() == ct)
            .count()
    }

    fn connected_addresses(&self) -> HashSet<NetAddress> {
        self.peers
            .read()
            .expect("peer table lock poisoned")
            .values()
            .filter_map(|p| p.net_address())
            .collect()
    }

    // ── Registry ────────────────────────────────────────────────────────

    pub(crate) fn register(
        &self,
        name: &str,
        protocol: u16,
        reactor: Arc<dyn Reactor>,
        priority: u8,
    ) -> Result<()> {
        if usize::from(priority) >= self.config.send_queue_max_priority {
            return Err(NetworkError::InvalidPriority(priority));
        }
        let mut registry = self.registry.write().expect("registry lock poisoned");
        if protocol == PROTO_CONTROL || registry.contains_key(&protocol) {
            return Err(NetworkError::ProtocolRegistered(protocol));
        }
        registry.insert(
            protocol,
            RegisteredProtocol {
                name: name.to_string(),
                priority,
                reactor,
            },
        );
        debug!(
            "channel {:?}: registered protocol {protocol:#06x} ({name})",
            self.channel
        );
        Ok(())
    }

    pub(crate) fn unregister(&self, protocol: u16) -> bool {
        self.registry
            .write()
            .expect("registry lock poisoned")
            .remove(&protocol)
            .is_some()
    }

    fn registered(&self, protocol: u16) -> Option<RegisteredProtocol> {
        self.registry
            .read()
            .expect("registry lock poisoned")
            .get(&protocol)
            .cloned()
    }

    fn registered_ids(&self) -> HashSet<u16> {
        self.registry
            .read()
            .expect("registry lock poisoned")
            .keys()
            .copied()
            .collect()
    }

    fn reactors(&self) -> Vec<Arc<dyn Reactor>> {
        self.registry
            .read()
            .expect("registry lock poisoned")
            .values()
            .map(|r| r.reactor.clone())
            .collect()
    }

    // ── Attachment ──────────────────────────────────────────────────────

    /// Take ownership of a fully authenticated peer.
    pub async fn on_peer(&self, peer: Arc<Peer>) {
        let Some(id) = peer.id() else {
            peer.close("unauthenticated peer at attach");
            return;
        };
        if id == self.self_id {
            peer.close("self connection");
            return;
        }

        let intent = peer
            .dial_address()
            .and_then(|addr| {
                self.pending_dial
                    .lock()
                    .expect("pending dial lock poisoned")
                    .remove(addr)
            })
            .unwrap_or(ConnectionType::Orphanage);
        peer.set_conn_type(intent);
        peer.set_protocols(self.registered_ids());

        let displaced = {
            let mut peers = self.peers.write().expect("peer table lock poisoned");
            peers.insert(id, peer.clone())
        };
        if let Some(old) = displaced {
            old.close("duplicated peer");
        } else {
            self.metrics.peers_connected.inc();
        }
        debug!("channel {:?}: attached {peer}", self.channel);

        for reactor in self.reactors() {
            reactor.on_join(id).await;
        }
    }

    fn detach(&self, peer: &Arc<Peer>) -> Option<PeerID> {
        let id = peer.id()?;
        {
            let mut peers = self.peers.write().expect("peer table lock poisoned");
            let is_current = peers.get(&id).is_some_and(|p| Arc::ptr_eq(p, peer));
            if !is_current {
                return None;
            }
            peers.remove(&id);
        }
        self.metrics.peers_connected.dec();
        self.disputes
            .lock()
            .expect("dispute lock poisoned")
            .remove(&id);
        if let Some(addr) = peer.net_address() {
            self.dial_backoff
                .lock()
                .expect("backoff lock poisoned")
                .insert(addr, Instant::now());
        }
        Some(id)
    }

    // ── Outbound API ────────────────────────────────────────────────────

    /// Deliver exactly to one connected peer.
    pub fn unicast(
        &self,
        protocol: u16,
        sub_protocol: u16,
        payload: Vec<u8>,
        dest: PeerID,
        priority: u8,
    ) -> Result<()> {
        let peer = self.peer(&dest).ok_or(NetworkError::UnknownPeer(dest))?;
        if !peer.supports_protocol(protocol) {
            debug!(
                "channel {:?}: {dest} joined before protocol {protocol:#06x} registered",
                self.channel
            );
        }
        let pkt = Packet::new(
            self.self_id,
            PacketDest::Peer(dest),
            protocol,
            sub_protocol,
            payload,
            1,
            priority,
            false,
        );
        peer.send(pkt)
    }

    /// Deliver to every connected peer whose observed role satisfies the
    /// mask.
    pub fn multicast(
        &self,
        protocol: u16,
        sub_protocol: u16,
        payload: Vec<u8>,
        role: RoleFlag,
        priority: u8,
    ) -> Result<()> {
        let targets: Vec<Arc<Peer>> = self
            .peers
            .read()
            .expect("peer table lock poisoned")
            .values()
            .filter(|p| p.has_recv_role(role))
            .cloned()
            .collect();
        if targets.is_empty() {
            return Err(NetworkError::NoMatchingPeer(role.bits()));
        }
        let pkt = Packet::new(
            self.self_id,
            PacketDest::Role(role),
            protocol,
            sub_protocol,
            payload,
            0,
            priority,
            false,
        );
        self.fanout(&pkt, targets, None);
        Ok(())
    }

    /// Flood with AllNeighbor / Neighbor / Children semantics.
    pub fn broadcast(
        &self,
        protocol: u16,
        sub_protocol: u16,
        payload: Vec<u8>,
        btype: BroadcastType,
        priority: u8,
    ) -> Result<()> {
        let pkt = Packet::new(
            self.self_id,
            PacketDest::Broadcast(btype),
            protocol,
            sub_protocol,
            payload,
            0,
            priority,
            false,
        );
        let targets = self.broadcast_targets(btype);
        self.fanout(&pkt, targets, None);
        Ok(())
    }

    fn broadcast_targets(&self, btype: BroadcastType) -> Vec<Arc<Peer>> {
        let peers = self.peers.read().expect("peer table lock poisoned");
        peers
            .values()
            .filter(|p| match btype {
                BroadcastType::AllNeighbor => true,
                BroadcastType::Neighbor => matches!(
                    p.conn_type(),
                    ConnectionType::Friend | ConnectionType::Parent | ConnectionType::Children
                ),
                BroadcastType::Children => p.conn_type() == ConnectionType::Children,
            })
            .cloned()
            .collect()
    }

    /// Enqueue a packet to many peers, skipping the one it came from.
    /// Duplicate and overflow rejections are expected here and only
    /// traced.
    fn fanout(&self, pkt: &Packet, targets: Vec<Arc<Peer>>, exclude: Option<&Arc<Peer>>) {
        for peer in targets {
            if let Some(skip) = exclude {
                if Arc::ptr_eq(skip, &peer) {
                    continue;
                }
            }
            match peer.send(pkt.clone()) {
                Ok(())
                | Err(NetworkError::DuplicatedPacket)
                | Err(NetworkError::NotAvailable) => {}
                Err(err) => {
                    trace!("channel {:?}: fanout to {peer} failed: {err}", self.channel);
                }
            }
        }
    }

    // ── Inbound routing ─────────────────────────────────────────────────

    async fn route_inbound(&self, pkt: Packet, peer: Arc<Peer>) {
        let Some(reg) = self.registered(pkt.protocol) else {
            debug!(
                "channel {:?}: no reactor for protocol {:#06x}, dropping",
                self.channel, pkt.protocol
            );
            return;
        };
        let from = pkt.sender.unwrap_or(pkt.src);

        match pkt.dest {
            PacketDest::Peer(dest) => {
                if dest != self.self_id {
                    debug!(
                        "channel {:?}: misrouted unicast for {dest}, dropping",
                        self.channel
                    );
                    return;
                }
                let _ = self.deliver(&reg, &pkt, from).await;
            }
            PacketDest::Role(role) => {
                if self.packet_pool.contains(pkt.hash()) {
                    trace!("channel {:?}: duplicate multicast, dropping", self.channel);
                    return;
                }
                self.packet_pool.put(*pkt.hash());
                let rebroadcast = self.deliver(&reg, &pkt, from).await;
                if rebroadcast && pkt.forwardable() {
                    let mut fwd = pkt.clone();
                    fwd.decrement_ttl();
                    let targets: Vec<Arc<Peer>> = self
                        .peers
                        .read()
                        .expect("peer table lock poisoned")
                        .values()
                        .filter(|p| p.has_recv_role(role))
                        .cloned()
                        .collect();
                    self.fanout(&fwd, targets, Some(&peer));
                }
            }
            PacketDest::Broadcast(btype) => {
                if self.packet_pool.contains(pkt.hash()) {
                    trace!("channel {:?}: duplicate broadcast, dropping", self.channel);
                    return;
                }
                self.packet_pool.put(*pkt.hash());
                let rebroadcast = self.deliver(&reg, &pkt, from).await;
                if rebroadcast && pkt.forwardable() {
                    let mut fwd = pkt.clone();
                    fwd.decrement_ttl();
                    let targets = self.broadcast_targets(btype);
                    self.fanout(&fwd, targets, Some(&peer));
                }
            }
        }
    }

    async fn deliver(&self, reg: &RegisteredProtocol, pkt: &Packet, from: PeerID) -> bool {
        match reg
            .reactor
            .on_receive(pkt.sub_protocol, &pkt.payload, from)
            .await
        {
            Ok(rebroadcast) => rebroadcast,
            Err(err) => {
                debug!(
                    "channel {:?}: reactor {} rejected {pkt:?}: {err}",
                    self.channel, reg.name
                );
                false
            }
        }
    }

    // ── Topology maintenance ────────────────────────────────────────────

    async fn tick_loop(self: Arc<Self>) {
        let mut ticker = interval(self.config.query_tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut stop_rx = self.stop_rx.clone();
        loop {
            tokio::select! {
                _ = stop_rx.changed() => break,
                _ = ticker.tick() => self.on_tick().await,
            }
        }
    }

    async fn on_tick(&self) {
        self.sweep_backoff();
        self.packet_pool
            .remove_before(self.config.peer_pool_expire_secs);
        self.evict_stale_peers();
        self.evict_over_limit();

        let role = self.effective_role();
        if role.has(RoleFlag::ROOT) {
            // Roots keep the friend mesh complete and query friends to
            // refresh the tables.
            self.befriend_roots().await;
            for friend in self.peers_of_type(ConnectionType::Friend) {
                self.send_query(&friend).await;
            }
            return;
        }

        match self.parent() {
            Some(parent) => self.send_query(&parent).await,
            // The uncle is the standby parent; promote it before dialing
            // anyone new.
            None => match self.peer_of_type(ConnectionType::Uncle) {
                Some(uncle) => {
                    debug!("channel {:?}: promoting uncle {uncle} to parent", self.channel);
                    uncle.set_conn_type(ConnectionType::Parent);
                    self.send_query(&uncle).await;
                }
                None => self.discover(ConnectionType::Parent).await,
            },
        }
        match self.peer_of_type(ConnectionType::Uncle) {
            Some(uncle) => self.send_query(&uncle).await,
            None => self.discover(ConnectionType::Uncle).await,
        }
    }

    fn sweep_backoff(&self) {
        let ttl = self.config.redial_backoff;
        self.dial_backoff
            .lock()
            .expect("backoff lock poisoned")
            .retain(|_, at| at.elapsed() < ttl);
    }

    /// Reads carry no deadline; the query exchange is the keep-alive and
    /// peers silent past the timeout are closed here.
    fn evict_stale_peers(&self) {
        let timeout = self.config.peer_timeout_secs;
        let stale: Vec<Arc<Peer>> = self
            .peers
            .read()
            .expect("peer table lock poisoned")
            .values()
            .filter(|p| p.silence_secs() > timeout)
            .cloned()
            .collect();
        for peer in stale {
            warn!(
                "channel {:?}: closing {peer} (silent >{timeout}s)",
                self.channel
            );
            peer.close("idle timeout");
        }
    }

    fn evict_over_limit(&self) {
        for (ct, limit) in [
            (ConnectionType::Parent, 1),
            (ConnectionType::Uncle, 1),
            (ConnectionType::Children, self.config.children_limit),
            (ConnectionType::Nephew, self.config.nephews_limit),
        ] {
            let mut peers = self.peers_of_type(ct);
            if peers.len() <= limit {
                continue;
            }
            peers.sort_by_key(|p| p.created_at());
            let excess = peers.len() - limit;
            for peer in peers.into_iter().take(excess) {
                warn!(
                    "channel {:?}: closing {peer} over {ct} limit {limit}",
                    self.channel
                );
                peer.close("connection limit");
            }
        }
    }

    /// Pick a dial candidate for an empty slot and dial it.
    async fn discover(&self, slot: ConnectionType) {
        let role = self.effective_role();
        let table = if role.has(RoleFlag::ROOT) {
            self.roots()
        } else {
            self.seeds()
        };
        let connected = self.connected_addresses();
        let candidate = {
            let backoff = self.dial_backoff.lock().expect("backoff lock poisoned");
            let pending = self.pending_dial.lock().expect("pending dial lock poisoned");
            table.into_iter().find(|addr| {
                Some(addr) != self.self_addr.as_ref()
                    && !connected.contains(addr)
                    && !backoff.contains_key(addr)
                    && !pending.contains_key(addr)
            })
        };
        let Some(addr) = candidate else {
            return;
        };
        self.pending_dial
            .lock()
            .expect("pending dial lock poisoned")
            .insert(addr.clone(), slot);
        self.dial_backoff
            .lock()
            .expect("backoff lock poisoned")
            .insert(addr.clone(), Instant::now());
        debug!("channel {:?}: dialing {addr} as {slot}", self.channel);
        if let Err(err) = self.dialer.dial(&addr).await {
            debug!("channel {:?}: dial {addr} failed: {err}", self.channel);
            self.pending_dial
                .lock()
                .expect("pending dial lock poisoned")
                .remove(&addr);
        }
    }

    /// Dial every known root this node is not yet connected to.
    async fn befriend_roots(&self) {
        let connected = self.connected_addresses();
        let candidates: Vec<NetAddress> = {
            let backoff = self.dial_backoff.lock().expect("backoff lock poisoned");
            let pending = self.pending_dial.lock().expect("pending dial lock poisoned");
            self.roots()
                .into_iter()
                .filter(|addr| {
                    Some(addr) != self.self_addr.as_ref()
                        && !connected.contains(addr)
                        && !backoff.contains_key(addr)
                        && !pending.contains_key(addr)
                })
                .collect()
        };
        for addr in candidates {
            self.pending_dial
                .lock()
                .expect("pending dial lock poisoned")
                .insert(addr.clone(), ConnectionType::Friend);
            self.dial_backoff
                .lock()
                .expect("backoff lock poisoned")
                .insert(addr.clone(), Instant::now());
            if let Err(err) = self.dialer.dial(&addr).await {
                debug!("channel {:?}: dial {addr} failed: {err}", self.channel);
                self.pending_dial
                    .lock()
                    .expect("pending dial lock poisoned")
                    .remove(&addr);
            }
        }
    }

    async fn send_query(&self, peer: &Arc<Peer>) {
        let msg = QueryMessage {
            role: self.declared_role(),
            conn_type: peer.conn_type(),
            seeds: self.seeds(),
            roots: self.roots(),
            children: self.count_conn_type(ConnectionType::Children) as u16,
            nephews: self.count_conn_type(ConnectionType::Nephew) as u16,
        };
        match self.control_packet(SUB_QUERY, &msg, peer) {
            Ok(pkt) => {
                peer.rtt.start();
                if let Err(err) = peer.send(pkt) {
                    debug!("channel {:?}: query to {peer} failed: {err}", self.channel);
                }
            }
            Err(err) => warn!("channel {:?}: query encode failed: {err}", self.channel),
        }
    }

    fn control_packet<T: serde::Serialize>(
        &self,
        sub: u16,
        msg: &T,
        peer: &Arc<Peer>,
    ) -> Result<Packet> {
        let payload = message::encode(msg)?;
        Ok(Packet::new(
            self.self_id,
            PacketDest::Peer(peer.id().unwrap_or_else(PeerID::zero)),
            PROTO_CONTROL,
            sub,
            payload,
            1,
            0,
            true,
        ))
    }

    fn merge_tables(&self, seeds: &[NetAddress], roots: &[NetAddress]) {
        {
            let mut table = self.seeds.write().expect("seed table lock poisoned");
            for addr in seeds {
                table.insert(addr.clone());
            }
            if let Some(me) = &self.self_addr {
                table.remove(me);
            }
        }
        {
            let mut table = self.roots.write().expect("root table lock poisoned");
            for addr in roots {
                table.insert(addr.clone());
            }
            if let Some(me) = &self.self_addr {
                table.remove(me);
            }
        }
    }

    /// The replier's view of a querier's role claim: a claim only stands
    /// when the address is present in the corresponding table.
    fn assess_role(&self, claimed: RoleFlag, addr: Option<&NetAddress>) -> RoleFlag {
        let mut observed = claimed;
        match addr {
            Some(addr) => {
                if claimed.has(RoleFlag::ROOT)
                    && !self
                        .roots
                        .read()
                        .expect("root table lock poisoned")
                        .contains(addr)
                {
                    observed.unset(RoleFlag::ROOT);
                }
                if claimed.has(RoleFlag::SEED)
                    && !self
                        .seeds
                        .read()
                        .expect("seed table lock poisoned")
                        .contains(addr)
                {
                    observed.unset(RoleFlag::SEED);
                }
            }
            None => observed = RoleFlag::NONE,
        }
        observed
    }

    /// Pick the slot a querier belongs in, given its observed role and
    /// what it says this node is to it (parent or uncle).
    fn classify_querier(
        &self,
        observed: RoleFlag,
        viewed_as: ConnectionType,
    ) -> (ConnectionType, &'static str) {
        let my_role = self.effective_role();
        if my_role.has(RoleFlag::ROOT) {
            if observed.has(RoleFlag::ROOT) {
                (ConnectionType::Friend, "")
            } else {
                (ConnectionType::Other, "not a parent")
            }
        } else if my_role.has(RoleFlag::SEED) {
            if observed.has(RoleFlag::ROOT) {
                (ConnectionType::Other, "not a parent")
            } else if viewed_as == ConnectionType::Uncle {
                if self.count_conn_type(ConnectionType::Nephew) < self.config.nephews_limit {
                    (ConnectionType::Nephew, "")
                } else {
                    (ConnectionType::Other, "full")
                }
            } else if self.count_conn_type(ConnectionType::Children) < self.config.children_limit
            {
                (ConnectionType::Children, "")
            } else if self.count_conn_type(ConnectionType::Nephew) < self.config.nephews_limit {
                (ConnectionType::Nephew, "")
            } else {
                (ConnectionType::Other, "full")
            }
        } else {
            (ConnectionType::Other, "not a parent")
        }
    }

    async fn handle_query(&self, pkt: &Packet, peer: Arc<Peer>) {
        let msg: QueryMessage = match message::decode(&pkt.payload) {
            Ok(m) => m,
            Err(err) => {
                peer.close_by_error(err);
                return;
            }
        };
        peer.set_recv_role(msg.role);
        peer.set_recv_conn_type(msg.conn_type);
        peer.set_children(msg.children);
        peer.set_nephews(msg.nephews);
        self.merge_tables(&msg.seeds, &msg.roots);

        let addr = peer.net_address();
        let observed = self.assess_role(msg.role, addr.as_ref());
        // A peer already holding a slot keeps it; only unassigned peers
        // are (re)classified.
        let current = peer.conn_type();
        let (ct, note) = if matches!(current, ConnectionType::Orphanage | ConnectionType::Other) {
            self.classify_querier(observed, msg.conn_type)
        } else {
            (current, "")
        };
        if current != ct {
            debug!("channel {:?}: {peer} classified as {ct}", self.channel);
        }
        peer.set_conn_type(ct);

        let reply = QueryResultMessage {
            seeds: self.seeds(),
            roots: self.roots(),
            observed_role: observed,
            message: note.to_string(),
        };
        match self.control_packet(SUB_QUERY_RESULT, &reply, &peer) {
            Ok(out) => {
                if let Err(err) = peer.send(out) {
                    debug!(
                        "channel {:?}: query result to {peer} failed: {err}",
                        self.channel
                    );
                }
            }
            Err(err) => warn!(
                "channel {:?}: query result encode failed: {err}",
                self.channel
            ),
        }
    }

    async fn handle_query_result(&self, pkt: &Packet, peer: Arc<Peer>) {
        let msg: QueryResultMessage = match message::decode(&pkt.payload) {
            Ok(m) => m,
            Err(err) => {
                peer.close_by_error(err);
                return;
            }
        };
        peer.rtt.stop();
        self.merge_tables(&msg.seeds, &msg.roots);

        let declared = self.declared_role();
        if msg.observed_role != declared {
            let disputed = {
                let Some(id) = peer.id() else { return };
                let mut disputes = self.disputes.lock().expect("dispute lock poisoned");
                let count = disputes.entry(id).or_insert(0);
                *count += 1;
                *count
            };
            if disputed >= 2 {
                warn!(
                    "channel {:?}: {peer} still disputes role {declared} (observed {})",
                    self.channel, msg.observed_role
                );
                peer.close("role mismatch");
                return;
            }
            // Accept the observed role and vacate slots the demoted role
            // cannot hold.
            debug!(
                "channel {:?}: adopting observed role {} (declared {declared})",
                self.channel, msg.observed_role
            );
            *self.effective_role.write().expect("role lock poisoned") = msg.observed_role;
            self.vacate_incompatible_slots(msg.observed_role);
        } else if let Some(id) = peer.id() {
            self.disputes
                .lock()
                .expect("dispute lock poisoned")
                .remove(&id);
            *self.effective_role.write().expect("role lock poisoned") = declared;
        }

        // A replier that refuses to be a parent frees the slot for the
        // next candidate.
        if !msg.message.is_empty() && peer.conn_type() == ConnectionType::Parent {
            debug!(
                "channel {:?}: {peer} refused parent slot: {}",
                self.channel, msg.message
            );
            peer.set_conn_type(ConnectionType::Other);
        }
    }

    fn vacate_incompatible_slots(&self, role: RoleFlag) {
        if !role.has(RoleFlag::ROOT) {
            for peer in self.peers_of_type(ConnectionType::Friend) {
                peer.set_conn_type(ConnectionType::Other);
            }
        }
        if !role.has(RoleFlag::SEED) {
            for peer in self.peers_of_type(ConnectionType::Children) {
                peer.set_conn_type(ConnectionType::Other);
            }
            for peer in self.peers_of_type(ConnectionType::Nephew) {
                peer.set_conn_type(ConnectionType::Other);
            }
        }
    }
}

// ── Sink wiring ─────────────────────────────────────────────────────────────

#[async_trait]
impl PeerSink for PeerToPeer {
    async fn on_packet(&self, pkt: Packet, peer: Arc<Peer>) {
        if pkt.protocol == PROTO_CONTROL {
            match pkt.sub_protocol {
                SUB_QUERY => self.handle_query(&pkt, peer).await,
                SUB_QUERY_RESULT => self.handle_query_result(&pkt, peer).await,
                sub => {
                    peer.close_by_error(NetworkError::ProtocolViolation(format!(
                        "unexpected control subprotocol {sub:#06x} after attach"
                    )));
                }
            }
            return;
        }
        self.route_inbound(pkt, peer).await;
    }

    async fn on_error(&self, err: NetworkError, peer: Arc<Peer>, pkt: Option<Packet>) {
        debug!(
            "channel {:?}: transient error from {peer}: {err} ({pkt:?})",
            self.channel
        );
    }

    async fn on_close(&self, peer: Arc<Peer>) {
        if let Some(id) = self.detach(&peer) {
            debug!("channel {:?}: detached {peer}", self.channel);
            for reactor in self.reactors() {
                reactor.on_leave(id).await;
            }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::transport::Transport,
        tessera_common::Wallet,
        tokio::net::{TcpListener, TcpStream},
    };

    async fn test_overlay(config: NetworkConfig) -> Arc<PeerToPeer> {
        let transport = Transport::new(config.clone(), Arc::new(Wallet::generate()));
        PeerToPeer::new(
            "main",
            transport.peer_id(),
            None,
            transport.dialer("main"),
            Arc::new(config),
            Arc::new(NetworkMetrics::new()),
        )
    }

    async fn fake_peer(tag: u8, ct: ConnectionType, overlay: &Arc<PeerToPeer>) -> Arc<Peer> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (dialed, _accepted) =
            tokio::join!(TcpStream::connect(addr), async { listener.accept().await });
        let peer = Peer::new(
            dialed.unwrap(),
            true,
            None,
            overlay.config().clone(),
            Arc::new(NetworkMetrics::new()),
        );
        peer.set_id(PeerID::from_public_key(&[tag; 32]));
        peer.set_conn_type(ct);
        overlay
            .peers
            .write()
            .unwrap()
            .insert(peer.id().unwrap(), peer.clone());
        peer
    }

    fn seeded_config() -> NetworkConfig {
        let mut cfg = NetworkConfig::dev_default();
        cfg.seeds = vec![NetAddress::new("10.0.0.1:7100").unwrap()];
        cfg.trusted_roots = vec![NetAddress::new("10.0.0.2:7100").unwrap()];
        cfg
    }

    #[tokio::test]
    async fn test_assess_role_strips_unverified_claims() {
        let overlay = test_overlay(seeded_config()).await;
        let seed_addr = NetAddress::new("10.0.0.1:7100").unwrap();
        let root_addr = NetAddress::new("10.0.0.2:7100").unwrap();
        let unknown = NetAddress::new("10.9.9.9:7100").unwrap();

        assert_eq!(
            overlay.assess_role(RoleFlag::SEED, Some(&seed_addr)),
            RoleFlag::SEED
        );
        assert_eq!(
            overlay.assess_role(RoleFlag::ROOT, Some(&root_addr)),
            RoleFlag::ROOT
        );
        assert_eq!(
            overlay.assess_role(RoleFlag::ROOT, Some(&unknown)),
            RoleFlag::NONE
        );
        assert_eq!(overlay.assess_role(RoleFlag::ROOT_SEED, None), RoleFlag::NONE);
    }

    #[tokio::test]
    async fn test_seed_classifies_citizens_as_children_until_full() {
        let mut cfg = seeded_config();
        cfg.role = RoleFlag::SEED;
        cfg.children_limit = 1;
        cfg.nephews_limit = 1;
        let overlay = test_overlay(cfg).await;

        assert_eq!(
            overlay.classify_querier(RoleFlag::NONE, ConnectionType::Parent),
            (ConnectionType::Children, "")
        );
        let _child = fake_peer(1, ConnectionType::Children, &overlay).await;
        assert_eq!(
            overlay.classify_querier(RoleFlag::NONE, ConnectionType::Parent),
            (ConnectionType::Nephew, "")
        );
        let _nephew = fake_peer(2, ConnectionType::Nephew, &overlay).await;
        assert_eq!(
            overlay.classify_querier(RoleFlag::NONE, ConnectionType::Parent),
            (ConnectionType::Other, "full")
        );
    }

    #[tokio::test]
    async fn test_uncle_view_lands_in_nephew_slot() {
        let mut cfg = seeded_config();
        cfg.role = RoleFlag::SEED;
        let overlay = test_overlay(cfg).await;
        assert_eq!(
            overlay.classify_querier(RoleFlag::NONE, ConnectionType::Uncle),
            (ConnectionType::Nephew, "")
        );
    }

    #[tokio::test]
    async fn test_root_befriends_roots_only() {
        let mut cfg = seeded_config();
        cfg.role = RoleFlag::ROOT;
        let overlay = test_overlay(cfg).await;
        assert_eq!(
            overlay.classify_querier(RoleFlag::ROOT, ConnectionType::Friend),
            (ConnectionType::Friend, "")
        );
        assert_eq!(
            overlay.classify_querier(RoleFlag::NONE, ConnectionType::Parent),
            (ConnectionType::Other, "not a parent")
        );
    }

    #[tokio::test]
    async fn test_citizen_refuses_children() {
        let overlay = test_overlay(seeded_config()).await;
        assert_eq!(
            overlay.classify_querier(RoleFlag::NONE, ConnectionType::Parent),
            (ConnectionType::Other, "not a parent")
        );
    }

    #[tokio::test]
    async fn test_broadcast_target_sets() {
        let overlay = test_overlay(seeded_config()).await;
        let _parent = fake_peer(1, ConnectionType::Parent, &overlay).await;
        let _child = fake_peer(2, ConnectionType::Children, &overlay).await;
        let _uncle = fake_peer(3, ConnectionType::Uncle, &overlay).await;
        let _friend = fake_peer(4, ConnectionType::Friend, &overlay).await;

        assert_eq!(overlay.broadcast_targets(BroadcastType::AllNeighbor).len(), 4);
        assert_eq!(overlay.broadcast_targets(BroadcastType::Neighbor).len(), 3);
        let children = overlay.broadcast_targets(BroadcastType::Children);
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].conn_type(), ConnectionType::Children);
    }

    #[tokio::test]
    async fn test_evict_over_limit_closes_oldest_first() {
        let mut cfg = seeded_config();
        cfg.children_limit = 2;
        let overlay = test_overlay(cfg).await;
        let oldest = fake_peer(1, ConnectionType::Children, &overlay).await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let middle = fake_peer(2, ConnectionType::Children, &overlay).await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let newest = fake_peer(3, ConnectionType::Children, &overlay).await;

        overlay.evict_over_limit();
        assert!(oldest.is_closed());
        assert!(!middle.is_closed());
        assert!(!newest.is_closed());
    }

    #[tokio::test]
    async fn test_unicast_to_unknown_peer_errors() {
        let overlay = test_overlay(seeded_config()).await;
        let ghost = PeerID::from_public_key(&[9u8; 32]);
        assert!(matches!(
            overlay.unicast(0x0101, 1, vec![1], ghost, 3),
            Err(NetworkError::UnknownPeer(_))
        ));
    }

    #[tokio::test]
    async fn test_multicast_requires_matching_role() {
        let overlay = test_overlay(seeded_config()).await;
        let citizen = fake_peer(1, ConnectionType::Children, &overlay).await;
        assert!(matches!(
            overlay.multicast(0x0101, 1, vec![1], RoleFlag::ROOT, 3),
            Err(NetworkError::NoMatchingPeer(_))
        ));
        citizen.set_recv_role(RoleFlag::ROOT);
        overlay
            .multicast(0x0101, 1, vec![1], RoleFlag::ROOT, 3)
            .unwrap();
        assert_eq!(citizen.queue_len(), 1);
    }

    #[tokio::test]
    async fn test_vacate_incompatible_slots() {
        let mut cfg = seeded_config();
        cfg.role = RoleFlag::ROOT;
        let overlay = test_overlay(cfg).await;
        let friend = fake_peer(1, ConnectionType::Friend, &overlay).await;
        overlay.vacate_incompatible_slots(RoleFlag::NONE);
        assert_eq!(friend.conn_type(), ConnectionType::Other);
    }
}
