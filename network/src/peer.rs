//! One live connection to a remote node.
//!
//! A [`Peer`] owns the framed reader/writer halves of its socket, a
//! bounded priority send queue, and a sliding-window duplicate pool. Two
//! tasks run per peer once a sink is attached:
//!
//! - the **receive task** reads packets, stamps the delivering neighbor,
//!   records the hash, and hands the packet to the current sink;
//! - the **send task** drains the queue (most urgent level first), writes
//!   under the send mutex with a deadline, and sweeps the duplicate pool
//!   once per second.
//!
//! Handshake stages talk to the wire through [`Peer::send_direct`], which
//! serializes on the same mutex without touching the queue. Closing is
//! idempotent: whichever of `close` / `close_by_error` wins the CAS closes
//! the socket signal, and the close callback fires exactly once.

use {
    crate::{
        config::NetworkConfig,
        error::{NetworkError, Result},
        packet::{Packet, PacketReader, PacketWriter},
        pool::TimestampPool,
        queue::PriorityQueue,
        types::{ConnectionType, NetAddress, PeerID, RoleFlag},
    },
    async_trait::async_trait,
    log::{debug, trace, warn},
    std::{
        collections::{HashMap, HashSet},
        fmt,
        net::SocketAddr,
        sync::{
            atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering},
            Arc, Mutex, RwLock,
        },
        time::{Duration, Instant},
    },
    tokio::{
        net::{
            tcp::{OwnedReadHalf, OwnedWriteHalf},
            TcpStream,
        },
        sync::watch,
        time::{interval, timeout, MissedTickBehavior},
    },
};

static PEER_SEQ: AtomicU64 = AtomicU64::new(1);

// ── Callbacks ───────────────────────────────────────────────────────────────

/// The callbacks a peer delivers its events to. Handshake stages and the
/// overlay each implement this; the handler chain rewires a peer's sink as
/// it advances.
#[async_trait]
pub trait PeerSink: Send + Sync {
    async fn on_packet(&self, pkt: Packet, peer: Arc<Peer>);
    async fn on_error(&self, err: NetworkError, peer: Arc<Peer>, pkt: Option<Packet>);
    async fn on_close(&self, peer: Arc<Peer>);
}

// ── Attributes ──────────────────────────────────────────────────────────────

/// A value in the peer's generic attribute map.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Bool(bool),
    U64(u64),
    Str(String),
}

// ── RTT tracking ────────────────────────────────────────────────────────────

/// Round-trip tracker fed by the overlay's query/query-result exchange.
pub struct PeerRtt {
    inner: Mutex<RttInner>,
}

#[derive(Default)]
struct RttInner {
    started: Option<Instant>,
    last: Duration,
    avg: Duration,
}

impl PeerRtt {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RttInner::default()),
        }
    }

    /// Mark the start of a measured exchange.
    pub fn start(&self) {
        let mut inner = self.inner.lock().expect("rtt lock poisoned");
        inner.started = Some(Instant::now());
    }

    /// Mark the end of a measured exchange and fold the sample into the
    /// exponentially weighted moving average (α = 0.125).
    pub fn stop(&self) {
        let mut inner = self.inner.lock().expect("rtt lock poisoned");
        let Some(st) = inner.started.take() else {
            return;
        };
        const ALPHA: f64 = 0.125;
        inner.last = st.elapsed();
        if inner.avg.is_zero() {
            inner.avg = inner.last;
        } else {
            let fv = (1.0 - ALPHA) * inner.avg.as_secs_f64() + ALPHA * inner.last.as_secs_f64();
            inner.avg = Duration::from_secs_f64(fv);
        }
    }

    pub fn last(&self) -> Duration {
        self.inner.lock().expect("rtt lock poisoned").last
    }

    pub fn avg(&self) -> Duration {
        self.inner.lock().expect("rtt lock poisoned").avg
    }
}

impl Default for PeerRtt {
    fn default() -> Self {
        Self::new()
    }
}

// ── Peer ────────────────────────────────────────────────────────────────────

/// A long-lived authenticated connection to one remote node.
pub struct Peer {
    // I/O
    reader: Mutex<Option<PacketReader<OwnedReadHalf>>>,
    writer: tokio::sync::Mutex<PacketWriter<OwnedWriteHalf>>,
    queue: PriorityQueue,
    pool: TimestampPool,
    sink: RwLock<Option<Arc<dyn PeerSink>>>,
    started: AtomicBool,
    closed: AtomicBool,
    close_tx: watch::Sender<bool>,
    close_rx: watch::Receiver<bool>,
    close_reasons: Mutex<Vec<String>>,
    close_errors: Mutex<Vec<NetworkError>>,

    // Identity and topology state
    seq: u64,
    incoming: bool,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    dial_address: Option<NetAddress>,
    id: RwLock<Option<PeerID>>,
    channel: RwLock<String>,
    net_address: RwLock<Option<NetAddress>>,
    role: RwLock<RoleFlag>,
    recv_role: RwLock<RoleFlag>,
    conn_type: RwLock<ConnectionType>,
    recv_conn_type: RwLock<ConnectionType>,
    children: AtomicU16,
    nephews: AtomicU16,
    protocols: RwLock<HashSet<u16>>,
    attrs: RwLock<HashMap<String, AttrValue>>,
    session_key: RwLock<Option<[u8; 32]>>,
    last_seen: Mutex<Instant>,
    created_at: Instant,

    pub(crate) rtt: PeerRtt,
    config: Arc<NetworkConfig>,
    metrics: Arc<tessera_monitoring::NetworkMetrics>,
}

impl Peer {
    /// Wrap an accepted or dialed TCP stream. Tasks do not start until the
    /// first sink is attached.
    pub fn new(
        stream: TcpStream,
        incoming: bool,
        dial_address: Option<NetAddress>,
        config: Arc<NetworkConfig>,
        metrics: Arc<tessera_monitoring::NetworkMetrics>,
    ) -> Arc<Self> {
        let local_addr = stream
            .local_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
        let remote_addr = stream
            .peer_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
        let (read_half, write_half) = stream.into_split();
        let (close_tx, close_rx) = watch::channel(false);
        Arc::new(Self {
            reader: Mutex::new(Some(PacketReader::new(read_half, config.max_payload_size))),
            writer: tokio::sync::Mutex::new(PacketWriter::new(write_half)),
            queue: PriorityQueue::new(config.send_queue_size, config.send_queue_max_priority),
            pool: TimestampPool::new(),
            sink: RwLock::new(None),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            close_tx,
            close_rx,
            close_reasons: Mutex::new(Vec::new()),
            close_errors: Mutex::new(Vec::new()),
            seq: PEER_SEQ.fetch_add(1, Ordering::Relaxed),
            incoming,
            local_addr,
            remote_addr,
            dial_address,
            id: RwLock::new(None),
            channel: RwLock::new(String::new()),
            net_address: RwLock::new(None),
            role: RwLock::new(RoleFlag::NONE),
            recv_role: RwLock::new(RoleFlag::NONE),
            conn_type: RwLock::new(ConnectionType::Orphanage),
            recv_conn_type: RwLock::new(ConnectionType::Orphanage),
            children: AtomicU16::new(0),
            nephews: AtomicU16::new(0),
            protocols: RwLock::new(HashSet::new()),
            attrs: RwLock::new(HashMap::new()),
            session_key: RwLock::new(None),
            last_seen: Mutex::new(Instant::now()),
            created_at: Instant::now(),
            rtt: PeerRtt::new(),
            config,
            metrics,
        })
    }

    // ── Sink wiring ─────────────────────────────────────────────────────

    /// Attach the callbacks for this peer's events, starting the I/O
    /// tasks on the first attach.
    pub fn set_sink(self: &Arc<Self>, sink: Arc<dyn PeerSink>) {
        *self.sink.write().expect("sink lock poisoned") = Some(sink);
        if !self.started.swap(true, Ordering::AcqRel) {
            self.spawn_guarded("receive", Self::receive_loop(self.clone()));
            self.spawn_guarded("send", Self::send_loop(self.clone()));
        }
    }

    fn sink_ref(&self) -> Option<Arc<dyn PeerSink>> {
        self.sink.read().expect("sink lock poisoned").clone()
    }

    /// Run a peer task under a supervisor that converts a panic into a
    /// logged `close_by_error`.
    fn spawn_guarded(
        self: &Arc<Self>,
        name: &'static str,
        fut: impl std::future::Future<Output = ()> + Send + 'static,
    ) {
        let peer = self.clone();
        tokio::spawn(async move {
            let handle = tokio::spawn(fut);
            if let Err(err) = handle.await {
                if err.is_panic() {
                    warn!("peer[{peer}] {name} task panicked: {err}");
                    peer.close_by_error(NetworkError::TaskPanicked(name));
                }
            }
        });
    }

    // ── I/O tasks ───────────────────────────────────────────────────────

    async fn receive_loop(self: Arc<Self>) {
        let Some(mut reader) = self
            .reader
            .lock()
            .expect("reader lock poisoned")
            .take()
        else {
            return;
        };
        let mut close_rx = self.close_rx.clone();
        loop {
            tokio::select! {
                _ = close_rx.changed() => break,
                res = reader.read_packet() => match res {
                    Ok(mut pkt) => {
                        pkt.sender = self.id();
                        *self.last_seen.lock().expect("last seen lock poisoned") =
                            Instant::now();
                        self.pool.put(*pkt.hash());
                        self.metrics.on_recv(pkt.payload.len());
                        trace!("peer[{self}] recv {pkt:?}");
                        if let Some(sink) = self.sink_ref() {
                            sink.on_packet(pkt, self.clone()).await;
                        } else {
                            debug!("peer[{self}] no sink, dropping {pkt:?}");
                        }
                    }
                    Err(err) if err.is_temporary() => {
                        trace!("peer[{self}] transient read error: {err}");
                        if let Some(sink) = self.sink_ref() {
                            sink.on_error(err, self.clone(), None).await;
                        }
                    }
                    Err(err) => {
                        self.close_by_error(err);
                        break;
                    }
                },
            }
        }
    }

    async fn send_loop(self: Arc<Self>) {
        let mut tick = interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut close_rx = self.close_rx.clone();
        loop {
            tokio::select! {
                _ = close_rx.changed() => break,
                _ = self.queue.wait() => {
                    while let Some(pkt) = self.queue.pop() {
                        // Re-check the pool at dequeue; a packet sent via
                        // send_direct while this one sat queued would
                        // otherwise slip past the enqueue-time check.
                        if !pkt.force_send && self.pool.contains(pkt.hash()) {
                            self.metrics.duplicates_dropped.inc();
                            continue;
                        }
                        match self.send_direct(&pkt).await {
                            Ok(()) => {
                                self.pool.put(*pkt.hash());
                                trace!("peer[{self}] sent {pkt:?}");
                            }
                            Err(err) if err.is_temporary() => {
                                trace!("peer[{self}] transient send error: {err}");
                                if let Some(sink) = self.sink_ref() {
                                    sink.on_error(err, self.clone(), Some(pkt)).await;
                                }
                            }
                            Err(err) => {
                                self.close_by_error(err);
                                return;
                            }
                        }
                    }
                }
                _ = tick.tick() => {
                    self.pool.remove_before(self.config.peer_pool_expire_secs);
                }
            }
        }
    }

    // ── Sending ─────────────────────────────────────────────────────────

    /// Write one packet immediately under the send mutex, with the
    /// configured deadline. Used by handshake stages before the queue is
    /// live and by any path that must not interleave.
    pub async fn send_direct(&self, pkt: &Packet) -> Result<()> {
        if self.is_closed() {
            return Err(NetworkError::NotAvailable);
        }
        let mut writer = self.writer.lock().await;
        if self.is_closed() {
            return Err(NetworkError::NotAvailable);
        }
        let deadline = self.config.send_timeout;
        match timeout(deadline, async {
            writer.write_packet(pkt).await?;
            writer.flush().await
        })
        .await
        {
            Ok(res) => {
                if res.is_ok() {
                    self.metrics.on_send(pkt.payload.len());
                }
                res
            }
            Err(_) => Err(NetworkError::SendTimeout(deadline.as_millis() as u64)),
        }
    }

    /// Whether the duplicate-suppression rules forbid sending this packet
    /// to this peer.
    pub fn is_duplicated_to_send(&self, pkt: &Packet) -> bool {
        if self.id() == Some(pkt.src) {
            return true;
        }
        if !pkt.force_send {
            if pkt.sender.is_some() && pkt.sender == self.id() {
                return true;
            }
            if self.pool.contains(pkt.hash()) {
                return true;
            }
        }
        false
    }

    /// Enqueue a packet for the send task.
    ///
    /// Fails with [`NetworkError::DuplicatedPacket`] when suppressed,
    /// [`NetworkError::QueueOverflow`] when the priority level is full,
    /// and [`NetworkError::NotAvailable`] when the peer is closed.
    pub fn send(&self, pkt: Packet) -> Result<()> {
        if self.is_closed() {
            return Err(NetworkError::NotAvailable);
        }
        let priority = pkt.priority;
        if usize::from(priority) >= self.config.send_queue_max_priority {
            return Err(NetworkError::InvalidPriority(priority));
        }
        if self.is_duplicated_to_send(&pkt) {
            self.metrics.duplicates_dropped.inc();
            return Err(NetworkError::DuplicatedPacket);
        }
        if !self.queue.push(pkt, usize::from(priority)) {
            self.metrics.queue_overflows.inc();
            return Err(NetworkError::QueueOverflow(priority));
        }
        Ok(())
    }

    // ── Closing ─────────────────────────────────────────────────────────

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close with a human-readable reason. Idempotent; reasons accumulate.
    pub fn close(self: &Arc<Self>, reason: &str) {
        self.close_reasons
            .lock()
            .expect("close info lock poisoned")
            .push(reason.to_string());
        self.do_close();
    }

    /// Close because of an error. Idempotent; errors accumulate.
    pub fn close_by_error(self: &Arc<Self>, err: NetworkError) {
        self.close_errors
            .lock()
            .expect("close info lock poisoned")
            .push(err);
        self.do_close();
    }

    fn do_close(self: &Arc<Self>) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        debug!("peer[{self}] closed: {}", self.close_info());
        let _ = self.close_tx.send(true);
        if let Some(sink) = self.sink_ref() {
            let peer = self.clone();
            tokio::spawn(async move {
                sink.on_close(peer).await;
            });
        }
    }

    /// Park until the peer is closed.
    pub async fn wait_close(&self) {
        let mut rx = self.close_rx.clone();
        if *rx.borrow() {
            return;
        }
        let _ = rx.changed().await;
    }

    /// Render the accumulated close reasons and errors.
    pub fn close_info(&self) -> String {
        let reasons = self.close_reasons.lock().expect("close info lock poisoned");
        let errors = self.close_errors.lock().expect("close info lock poisoned");
        let errs: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        format!("reason:{:?}, closeErr:{:?}", *reasons, errs)
    }

    /// Whether an error with the same rendering was recorded at close.
    pub fn has_close_error(&self, err: &NetworkError) -> bool {
        let needle = err.to_string();
        self.close_errors
            .lock()
            .expect("close info lock poisoned")
            .iter()
            .any(|e| e.to_string() == needle)
    }

    // ── Identity accessors ──────────────────────────────────────────────

    pub fn id(&self) -> Option<PeerID> {
        *self.id.read().expect("id lock poisoned")
    }

    /// Set the authenticated identity. Write-once: later calls are ignored.
    pub(crate) fn set_id(&self, id: PeerID) {
        let mut guard = self.id.write().expect("id lock poisoned");
        if guard.is_none() {
            *guard = Some(id);
        }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn is_incoming(&self) -> bool {
        self.incoming
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Seconds since the last packet arrived from this peer.
    pub fn silence_secs(&self) -> u64 {
        self.last_seen
            .lock()
            .expect("last seen lock poisoned")
            .elapsed()
            .as_secs()
    }

    pub fn channel(&self) -> String {
        self.channel.read().expect("channel lock poisoned").clone()
    }

    pub(crate) fn set_channel(&self, channel: &str) {
        *self.channel.write().expect("channel lock poisoned") = channel.to_string();
    }

    pub fn net_address(&self) -> Option<NetAddress> {
        self.net_address
            .read()
            .expect("net address lock poisoned")
            .clone()
    }

    pub(crate) fn set_net_address(&self, addr: NetAddress) {
        *self.net_address.write().expect("net address lock poisoned") = Some(addr);
    }

    pub fn dial_address(&self) -> Option<&NetAddress> {
        self.dial_address.as_ref()
    }

    pub fn role(&self) -> RoleFlag {
        *self.role.read().expect("role lock poisoned")
    }

    pub(crate) fn set_role(&self, role: RoleFlag) {
        *self.role.write().expect("role lock poisoned") = role;
    }

    pub fn recv_role(&self) -> RoleFlag {
        *self.recv_role.read().expect("role lock poisoned")
    }

    pub(crate) fn set_recv_role(&self, role: RoleFlag) {
        *self.recv_role.write().expect("role lock poisoned") = role;
    }

    pub fn has_recv_role(&self, role: RoleFlag) -> bool {
        self.recv_role().has(role)
    }

    pub fn conn_type(&self) -> ConnectionType {
        *self.conn_type.read().expect("conn type lock poisoned")
    }

    pub(crate) fn set_conn_type(&self, ct: ConnectionType) {
        *self.conn_type.write().expect("conn type lock poisoned") = ct;
    }

    pub fn recv_conn_type(&self) -> ConnectionType {
        *self.recv_conn_type.read().expect("conn type lock poisoned")
    }

    pub(crate) fn set_recv_conn_type(&self, ct: ConnectionType) {
        *self.recv_conn_type.write().expect("conn type lock poisoned") = ct;
    }

    pub fn children(&self) -> u16 {
        self.children.load(Ordering::Relaxed)
    }

    pub(crate) fn set_children(&self, n: u16) {
        self.children.store(n, Ordering::Relaxed);
    }

    pub fn nephews(&self) -> u16 {
        self.nephews.load(Ordering::Relaxed)
    }

    pub(crate) fn set_nephews(&self, n: u16) {
        self.nephews.store(n, Ordering::Relaxed);
    }

    pub fn supports_protocol(&self, id: u16) -> bool {
        self.protocols
            .read()
            .expect("protocols lock poisoned")
            .contains(&id)
    }

    pub(crate) fn set_protocols(&self, ids: HashSet<u16>) {
        *self.protocols.write().expect("protocols lock poisoned") = ids;
    }

    pub fn session_key(&self) -> Option<[u8; 32]> {
        *self.session_key.read().expect("session key lock poisoned")
    }

    pub(crate) fn set_session_key(&self, key: [u8; 32]) {
        *self.session_key.write().expect("session key lock poisoned") = Some(key);
    }

    // ── Attributes ──────────────────────────────────────────────────────

    pub fn get_attr(&self, key: &str) -> Option<AttrValue> {
        self.attrs
            .read()
            .expect("attrs lock poisoned")
            .get(key)
            .cloned()
    }

    pub fn put_attr(&self, key: &str, value: AttrValue) {
        self.attrs
            .write()
            .expect("attrs lock poisoned")
            .insert(key.to_string(), value);
    }

    pub fn remove_attr(&self, key: &str) {
        self.attrs.write().expect("attrs lock poisoned").remove(key);
    }

    pub fn equals_attr(&self, key: &str, value: &AttrValue) -> bool {
        self.get_attr(key).as_ref() == Some(value)
    }

    // ── Diagnostics ─────────────────────────────────────────────────────

    pub fn conn_string(&self) -> String {
        if self.incoming {
            format!("{}<-{}", self.local_addr, self.remote_addr)
        } else {
            format!("{}->{}", self.local_addr, self.remote_addr)
        }
    }

    pub(crate) fn pool(&self) -> &TimestampPool {
        &self.pool
    }

    #[cfg(test)]
    pub(crate) fn queue_len(&self) -> usize {
        self.queue.len()
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{id:{}, conn:{}, addr:{}, in:{}, channel:{}, role:{}, rrole:{}, type:{}, rtype:{}}}",
            self.id().map(|i| i.to_string()).unwrap_or_default(),
            self.conn_string(),
            self.net_address().map(|a| a.to_string()).unwrap_or_default(),
            self.incoming,
            self.channel(),
            self.role(),
            self.recv_role(),
            self.conn_type(),
            self.recv_conn_type(),
        )
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::packet::PacketDest,
        std::sync::atomic::AtomicUsize,
        tokio::net::TcpListener,
    };

    struct CountingSink {
        packets: AtomicUsize,
        closes: AtomicUsize,
    }

    impl CountingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                packets: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl PeerSink for CountingSink {
        async fn on_packet(&self, _pkt: Packet, _peer: Arc<Peer>) {
            self.packets.fetch_add(1, Ordering::SeqCst);
        }
        async fn on_error(&self, _err: NetworkError, _peer: Arc<Peer>, _pkt: Option<Packet>) {}
        async fn on_close(&self, _peer: Arc<Peer>) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (dialed, accepted) =
            tokio::join!(TcpStream::connect(addr), async { listener.accept().await });
        (dialed.unwrap(), accepted.unwrap().0)
    }

    fn peer_pair_config() -> Arc<NetworkConfig> {
        Arc::new(NetworkConfig::dev_default())
    }

    fn packet(tag: u8, priority: u8) -> Packet {
        Packet::new(
            PeerID::from_public_key(&[tag; 32]),
            PacketDest::Peer(PeerID::zero()),
            0x0101,
            u16::from(tag),
            vec![tag; 4],
            0,
            priority,
            false,
        )
    }

    #[tokio::test]
    async fn test_close_callback_fires_exactly_once() {
        let (a, _b) = socket_pair().await;
        let cfg = peer_pair_config();
        let metrics = Arc::new(tessera_monitoring::NetworkMetrics::new());
        let peer = Peer::new(a, false, None, cfg, metrics);
        let sink = CountingSink::new();
        peer.set_sink(sink.clone());

        for _ in 0..4 {
            peer.close("test");
            peer.close_by_error(NetworkError::NotAvailable);
        }
        peer.wait_close().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sink.closes.load(Ordering::SeqCst), 1);
        assert!(peer.is_closed());
        assert!(peer.has_close_error(&NetworkError::NotAvailable));
        assert!(peer.close_info().contains("test"));
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (a, _b) = socket_pair().await;
        let peer = Peer::new(
            a,
            false,
            None,
            peer_pair_config(),
            Arc::new(tessera_monitoring::NetworkMetrics::new()),
        );
        peer.close("done");
        assert!(matches!(
            peer.send(packet(1, 0)),
            Err(NetworkError::NotAvailable)
        ));
    }

    #[tokio::test]
    async fn test_queue_overflow_is_per_priority() {
        let (a, _b) = socket_pair().await;
        let peer = Peer::new(
            a,
            false,
            None,
            peer_pair_config(),
            Arc::new(tessera_monitoring::NetworkMetrics::new()),
        );
        // No sink attached: the send task is not draining.
        let cap = NetworkConfig::dev_default().send_queue_size;
        for tag in 0..cap as u8 {
            peer.send(packet(tag + 1, 3)).unwrap();
        }
        assert!(matches!(
            peer.send(packet(200, 3)),
            Err(NetworkError::QueueOverflow(3))
        ));
        peer.send(packet(201, 0)).unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_suppression_on_enqueue() {
        let (a, _b) = socket_pair().await;
        let peer = Peer::new(
            a,
            false,
            None,
            peer_pair_config(),
            Arc::new(tessera_monitoring::NetworkMetrics::new()),
        );
        let pkt = packet(7, 1);
        peer.pool().put(*pkt.hash());
        assert!(matches!(
            peer.send(pkt.clone()),
            Err(NetworkError::DuplicatedPacket)
        ));

        // force_send bypasses the pool.
        let mut forced = pkt;
        forced.force_send = true;
        peer.send(forced).unwrap();
    }

    #[tokio::test]
    async fn test_own_packet_never_echoed_back_to_origin() {
        let (a, _b) = socket_pair().await;
        let peer = Peer::new(
            a,
            false,
            None,
            peer_pair_config(),
            Arc::new(tessera_monitoring::NetworkMetrics::new()),
        );
        let origin = PeerID::from_public_key(&[7u8; 32]);
        peer.set_id(origin);
        let pkt = Packet::new(
            origin,
            PacketDest::Broadcast(crate::types::BroadcastType::AllNeighbor),
            1,
            1,
            vec![1],
            0,
            0,
            true,
        );
        // Even force_send cannot return a packet to its source.
        assert!(peer.is_duplicated_to_send(&pkt));
    }

    #[tokio::test]
    async fn test_send_order_within_priority() {
        let (a, b) = socket_pair().await;
        let cfg = peer_pair_config();
        let metrics = Arc::new(tessera_monitoring::NetworkMetrics::new());
        let sender = Peer::new(a, false, None, cfg.clone(), metrics.clone());
        let receiver = Peer::new(b, true, None, cfg, metrics);

        let sender_sink = CountingSink::new();
        sender.set_sink(sender_sink);

        for tag in 1..=5 {
            sender.send(packet(tag, 2)).unwrap();
        }

        // Read raw frames from the receiving side without starting its tasks.
        let mut reader = receiver
            .reader
            .lock()
            .unwrap()
            .take()
            .expect("reader present");
        for expected in 1..=5u16 {
            let pkt = tokio::time::timeout(Duration::from_secs(2), reader.read_packet())
                .await
                .expect("read timed out")
                .unwrap();
            assert_eq!(pkt.sub_protocol, expected);
        }
    }

    #[tokio::test]
    async fn test_receive_task_delivers_and_records_hash() {
        let (a, b) = socket_pair().await;
        let cfg = peer_pair_config();
        let metrics = Arc::new(tessera_monitoring::NetworkMetrics::new());
        let sender = Peer::new(a, false, None, cfg.clone(), metrics.clone());
        let receiver = Peer::new(b, true, None, cfg, metrics);

        let recv_sink = CountingSink::new();
        receiver.set_sink(recv_sink.clone());

        let pkt = packet(9, 0);
        let hash = *pkt.hash();
        sender.send_direct(&pkt).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while recv_sink.packets.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("packet not delivered");
        assert!(receiver.pool().contains(&hash));
    }

    #[tokio::test]
    async fn test_attribute_map() {
        let (a, _b) = socket_pair().await;
        let peer = Peer::new(
            a,
            false,
            None,
            peer_pair_config(),
            Arc::new(tessera_monitoring::NetworkMetrics::new()),
        );
        peer.put_attr("client-version", AttrValue::Str("2.1.0".into()));
        peer.put_attr("height", AttrValue::U64(42));
        assert!(peer.equals_attr("height", &AttrValue::U64(42)));
        assert!(!peer.equals_attr("height", &AttrValue::U64(43)));
        peer.remove_attr("height");
        assert!(peer.get_attr("height").is_none());
        assert_eq!(
            peer.get_attr("client-version"),
            Some(AttrValue::Str("2.1.0".into()))
        );
    }

    #[test]
    fn test_rtt_ewma_folds_samples() {
        let rtt = PeerRtt::new();
        rtt.start();
        rtt.stop();
        let first = rtt.avg();
        assert_eq!(first, rtt.last());
        rtt.start();
        rtt.stop();
        // A second sample moves the average by at most the α weight.
        assert!(rtt.avg() <= first.max(rtt.last()));
    }

    #[tokio::test]
    async fn test_eof_closes_peer() {
        let (a, b) = socket_pair().await;
        let cfg = peer_pair_config();
        let metrics = Arc::new(tessera_monitoring::NetworkMetrics::new());
        let peer = Peer::new(a, true, None, cfg, metrics);
        let sink = CountingSink::new();
        peer.set_sink(sink.clone());

        drop(b);
        tokio::time::timeout(Duration::from_secs(2), peer.wait_close())
            .await
            .expect("peer did not close on EOF");
        assert!(peer.is_closed());
    }
}
