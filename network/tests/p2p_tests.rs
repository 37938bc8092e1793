//! End-to-end tests over live localhost TCP: handshake, routing,
//! duplicate suppression, topology healing, and channel isolation.

use {
    async_trait::async_trait,
    rand::RngCore,
    std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Mutex,
        },
        time::Duration,
    },
    tessera_common::Wallet,
    tessera_network::{
        message::{
            self, AuthConfirm, AuthHello, ChannelQuery, ChannelResult, PROTO_CONTROL,
            SUB_AUTH_CONFIRM, SUB_AUTH_HELLO, SUB_CHANNEL_QUERY, SUB_CHANNEL_RESULT,
        },
        packet::{Packet, PacketDest, PacketReader, PacketWriter},
        BroadcastType, ConnectionType, NetAddress, NetworkConfig, NetworkManager, PeerID,
        Reactor, Result, RoleFlag, Transport,
    },
    tokio::{
        net::TcpStream,
        time::{sleep, timeout},
    },
};

const PROTO_TEST: u16 = 0x0101;

struct Node {
    transport: Arc<Transport>,
    manager: Arc<NetworkManager>,
    addr: NetAddress,
}

async fn spawn_node(channel: &str, cfg: NetworkConfig) -> Node {
    let transport = Transport::new(cfg, Arc::new(Wallet::generate()));
    let addr = transport.listen().await.unwrap();
    let manager = NetworkManager::new(&transport, channel);
    Node {
        transport,
        manager,
        addr,
    }
}

struct TestReactor {
    received: Mutex<Vec<(u16, Vec<u8>, PeerID)>>,
    joins: AtomicUsize,
    leaves: AtomicUsize,
    rebroadcast: bool,
}

impl TestReactor {
    fn new(rebroadcast: bool) -> Arc<Self> {
        Arc::new(Self {
            received: Mutex::new(Vec::new()),
            joins: AtomicUsize::new(0),
            leaves: AtomicUsize::new(0),
            rebroadcast,
        })
    }

    fn received_count(&self) -> usize {
        self.received.lock().unwrap().len()
    }
}

#[async_trait]
impl Reactor for TestReactor {
    async fn on_receive(&self, sub: u16, payload: &[u8], from: PeerID) -> Result<bool> {
        self.received
            .lock()
            .unwrap()
            .push((sub, payload.to_vec(), from));
        Ok(self.rebroadcast)
    }

    async fn on_join(&self, _id: PeerID) {
        self.joins.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_leave(&self, _id: PeerID) {
        self.leaves.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_failure(&self, _err: tessera_network::NetworkError, _pkt: &Packet) {}
}

async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    timeout(Duration::from_secs(10), async {
        while !cond() {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

// ── Handshake ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_handshake_attaches_both_sides() {
    let a = spawn_node("main", NetworkConfig::dev_default()).await;
    let b = spawn_node("main", NetworkConfig::dev_default()).await;

    a.transport.dial(&b.addr, "main").await.unwrap();
    wait_until("both sides attached", || {
        a.manager.peer_ids().len() == 1 && b.manager.peer_ids().len() == 1
    })
    .await;

    assert_eq!(a.manager.peer_ids()[0], b.transport.peer_id());
    assert_eq!(b.manager.peer_ids()[0], a.transport.peer_id());
}

#[tokio::test]
async fn test_unknown_channel_is_rejected() {
    let a = spawn_node("main", NetworkConfig::dev_default()).await;
    let b = spawn_node("main", NetworkConfig::dev_default()).await;

    a.transport.dial(&b.addr, "aux").await.unwrap();
    sleep(Duration::from_millis(500)).await;
    assert!(a.manager.peer_ids().is_empty());
    assert!(b.manager.peer_ids().is_empty());
}

#[tokio::test]
async fn test_reactor_join_and_leave() {
    let a = spawn_node("main", NetworkConfig::dev_default()).await;
    let b = spawn_node("main", NetworkConfig::dev_default()).await;
    let reactor = TestReactor::new(false);
    b.manager
        .register_reactor("test", PROTO_TEST, reactor.clone(), 3)
        .unwrap();

    a.transport.dial(&b.addr, "main").await.unwrap();
    wait_until("join seen", || reactor.joins.load(Ordering::SeqCst) == 1).await;

    a.manager.term();
    wait_until("leave seen", || reactor.leaves.load(Ordering::SeqCst) == 1).await;
}

// ── Routing ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_unicast_delivers_payload() {
    let a = spawn_node("main", NetworkConfig::dev_default()).await;
    let b = spawn_node("main", NetworkConfig::dev_default()).await;
    let reactor_a = TestReactor::new(false);
    let reactor_b = TestReactor::new(false);
    let handler_a = a
        .manager
        .register_reactor("test", PROTO_TEST, reactor_a, 3)
        .unwrap();
    b.manager
        .register_reactor("test", PROTO_TEST, reactor_b.clone(), 3)
        .unwrap();

    a.transport.dial(&b.addr, "main").await.unwrap();
    wait_until("attached", || !a.manager.peer_ids().is_empty()).await;

    handler_a
        .unicast(0x0007, vec![1, 2, 3], b.transport.peer_id())
        .unwrap();
    wait_until("unicast delivered", || reactor_b.received_count() == 1).await;

    let received = reactor_b.received.lock().unwrap();
    let (sub, payload, from) = &received[0];
    assert_eq!(*sub, 0x0007);
    assert_eq!(payload, &vec![1, 2, 3]);
    assert_eq!(*from, a.transport.peer_id());
}

#[tokio::test]
async fn test_broadcast_delivers_exactly_once_per_node() {
    // A, B, C fully meshed; everyone rebroadcasts. Every node other than
    // the origin must see exactly one upcall.
    let a = spawn_node("main", NetworkConfig::dev_default()).await;
    let b = spawn_node("main", NetworkConfig::dev_default()).await;
    let c = spawn_node("main", NetworkConfig::dev_default()).await;

    let ra = TestReactor::new(true);
    let rb = TestReactor::new(true);
    let rc = TestReactor::new(true);
    let ha = a
        .manager
        .register_reactor("test", PROTO_TEST, ra.clone(), 3)
        .unwrap();
    b.manager
        .register_reactor("test", PROTO_TEST, rb.clone(), 3)
        .unwrap();
    c.manager
        .register_reactor("test", PROTO_TEST, rc.clone(), 3)
        .unwrap();

    a.transport.dial(&b.addr, "main").await.unwrap();
    a.transport.dial(&c.addr, "main").await.unwrap();
    b.transport.dial(&c.addr, "main").await.unwrap();
    wait_until("mesh attached", || {
        a.manager.peer_ids().len() == 2
            && b.manager.peer_ids().len() == 2
            && c.manager.peer_ids().len() == 2
    })
    .await;

    ha.broadcast(0x0009, vec![0xAA], BroadcastType::AllNeighbor)
        .unwrap();

    wait_until("broadcast reached B and C", || {
        rb.received_count() >= 1 && rc.received_count() >= 1
    })
    .await;
    // Give the rebroadcast wave time to loop back if dedup were broken.
    sleep(Duration::from_millis(500)).await;

    assert_eq!(rb.received_count(), 1, "B saw duplicate upcalls");
    assert_eq!(rc.received_count(), 1, "C saw duplicate upcalls");
    assert_eq!(ra.received_count(), 0, "origin saw its own broadcast");
}

#[tokio::test]
async fn test_channel_isolation() {
    let cfg = NetworkConfig::dev_default;
    let a_transport = Transport::new(cfg(), Arc::new(Wallet::generate()));
    a_transport.listen().await.unwrap();
    let a_main = NetworkManager::new(&a_transport, "main");
    let _a_aux = NetworkManager::new(&a_transport, "aux");

    let b_transport = Transport::new(cfg(), Arc::new(Wallet::generate()));
    let b_addr = b_transport.listen().await.unwrap();
    let b_main = NetworkManager::new(&b_transport, "main");
    let b_aux = NetworkManager::new(&b_transport, "aux");

    let main_reactor = TestReactor::new(false);
    let aux_reactor = TestReactor::new(false);
    let a_handler = a_main
        .register_reactor("test", PROTO_TEST, TestReactor::new(false), 3)
        .unwrap();
    b_main
        .register_reactor("test", PROTO_TEST, main_reactor.clone(), 3)
        .unwrap();
    b_aux
        .register_reactor("test", PROTO_TEST, aux_reactor.clone(), 3)
        .unwrap();

    a_transport.dial(&b_addr, "main").await.unwrap();
    a_transport.dial(&b_addr, "aux").await.unwrap();
    wait_until("both channels attached", || {
        b_main.peer_ids().len() == 1 && b_aux.peer_ids().len() == 1
    })
    .await;

    a_handler
        .broadcast(0x0001, vec![0x11], BroadcastType::AllNeighbor)
        .unwrap();
    wait_until("main reactor got it", || main_reactor.received_count() == 1).await;
    sleep(Duration::from_millis(300)).await;
    assert_eq!(
        aux_reactor.received_count(),
        0,
        "aux reactor saw a main-channel packet"
    );
}

// ── Authentication failure ──────────────────────────────────────────────────

#[tokio::test]
async fn test_bad_signature_closes_connection() {
    let b = spawn_node("main", NetworkConfig::dev_default()).await;
    let reactor = TestReactor::new(false);
    b.manager
        .register_reactor("test", PROTO_TEST, reactor.clone(), 3)
        .unwrap();

    let stream = TcpStream::connect(b.addr.as_str()).await.unwrap();
    let (read_half, write_half) = stream.into_split();
    let mut reader = PacketReader::new(read_half, 1024 * 1024);
    let mut writer = PacketWriter::new(write_half);
    let fake_id = PeerID::from_public_key(&[0x42; 32]);

    let send = |sub: u16, payload: Vec<u8>| {
        Packet::new(
            fake_id,
            PacketDest::Peer(PeerID::zero()),
            PROTO_CONTROL,
            sub,
            payload,
            1,
            0,
            true,
        )
    };

    // Channel round.
    let query = ChannelQuery {
        channel: "main".into(),
        addr: None,
    };
    writer
        .write_packet(&send(SUB_CHANNEL_QUERY, message::encode(&query).unwrap()))
        .await
        .unwrap();
    writer.flush().await.unwrap();
    let result_pkt = timeout(Duration::from_secs(5), reader.read_packet())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result_pkt.sub_protocol, SUB_CHANNEL_RESULT);
    let result: ChannelResult = message::decode(&result_pkt.payload).unwrap();
    assert!(result.ok);

    // Identity round with a garbage signature.
    let wallet = Wallet::generate();
    let mut nonce = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    let hello = AuthHello {
        public_key: wallet.public_key(),
        nonce,
        session_key: [7u8; 32],
    };
    writer
        .write_packet(&send(SUB_AUTH_HELLO, message::encode(&hello).unwrap()))
        .await
        .unwrap();
    writer.flush().await.unwrap();

    // The remote answers with its own hello and confirm.
    let hello_pkt = timeout(Duration::from_secs(5), reader.read_packet())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(hello_pkt.sub_protocol, SUB_AUTH_HELLO);
    let confirm_pkt = timeout(Duration::from_secs(5), reader.read_packet())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(confirm_pkt.sub_protocol, SUB_AUTH_CONFIRM);

    let bad_confirm = AuthConfirm {
        signature: [0u8; 64],
        session_key: [7u8; 32],
    };
    writer
        .write_packet(&send(SUB_AUTH_CONFIRM, message::encode(&bad_confirm).unwrap()))
        .await
        .unwrap();
    writer.flush().await.unwrap();

    // The remote must drop the connection without attaching us.
    let end = timeout(Duration::from_secs(5), reader.read_packet()).await;
    assert!(matches!(end, Ok(Err(_))), "expected connection close");
    assert!(b.manager.peer_ids().is_empty());
    assert_eq!(reactor.joins.load(Ordering::SeqCst), 0);
}

// ── Topology ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_citizen_adopts_seed_parent_and_fails_over() {
    let mut seed_cfg = NetworkConfig::dev_default();
    seed_cfg.role = RoleFlag::SEED;
    let s1 = spawn_node("main", seed_cfg.clone()).await;
    let s2 = spawn_node("main", seed_cfg).await;

    let mut citizen_cfg = NetworkConfig::dev_default();
    citizen_cfg.seeds = vec![s1.addr.clone(), s2.addr.clone()];
    let x = spawn_node("main", citizen_cfg).await;

    wait_until("citizen found a parent", || {
        x.manager.parent_address().is_some()
    })
    .await;
    let first = x.manager.parent_address().unwrap();
    let (downed, standby) = if first == s1.addr { (&s1, &s2) } else { (&s2, &s1) };

    // The chosen seed must come to see the citizen as a child.
    wait_until("seed classified citizen as child", || {
        downed.manager.count_of(ConnectionType::Children) == 1
    })
    .await;

    // Take the parent down; the citizen must fail over to the other seed.
    downed.manager.term();
    downed.transport.close().unwrap();
    wait_until("citizen failed over", || {
        x.manager.parent_address().as_ref() == Some(&standby.addr)
    })
    .await;
}
