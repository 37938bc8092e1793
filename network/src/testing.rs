//! In-process test doubles for protocol-level tests.
//!
//! A pair of [`TestPeer`]s is a loopback link: packets cross a bounded
//! channel instead of a socket, so reactor wiring and payload codecs can
//! be exercised without a transport, a handshake, or a running overlay.
//! `connect` wires two peers both ways, `join` registers a handler for
//! one protocol, and the handler carries the same unicast / multicast /
//! broadcast surface the real [`crate::ProtocolHandler`] exposes, plus
//! receive-side assertion helpers.
//!
//! Available to other crates under the `dev-context-only-utils` feature.

use {
    crate::{
        packet::PacketDest,
        types::{BroadcastType, PeerID, RoleFlag},
    },
    std::sync::{Arc, Mutex, Weak},
    tessera_common::Wallet,
    tokio::sync::mpsc,
};

const HANDLER_QUEUE: usize = 1024;

/// One in-process message, as a joined handler sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestPacket {
    pub src: PeerID,
    pub dest: PacketDest,
    pub protocol: u16,
    pub sub_protocol: u16,
    pub payload: Vec<u8>,
}

/// A socketless peer with a fresh wallet-derived identity.
pub struct TestPeer {
    id: PeerID,
    counterpart: Mutex<Option<Arc<TestPeer>>>,
    handlers: Mutex<Vec<Arc<TestPeerHandler>>>,
}

impl TestPeer {
    pub fn new() -> Arc<Self> {
        Self::with_id(PeerID::from_public_key(&Wallet::generate().public_key()))
    }

    pub fn with_id(id: PeerID) -> Arc<Self> {
        Arc::new(Self {
            id,
            counterpart: Mutex::new(None),
            handlers: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> PeerID {
        self.id
    }

    /// Wire two peers both ways.
    pub fn connect(self: &Arc<Self>, other: &Arc<Self>) {
        self.attach(other.clone());
        other.attach(self.clone());
    }

    fn attach(&self, other: Arc<Self>) {
        *self.counterpart.lock().expect("test peer lock poisoned") = Some(other);
    }

    /// Drop the link to `other` when it is the current counterpart.
    pub fn detach(&self, other: &Arc<Self>) {
        let mut counterpart = self.counterpart.lock().expect("test peer lock poisoned");
        if counterpart.as_ref().is_some_and(|p| Arc::ptr_eq(p, other)) {
            *counterpart = None;
        }
    }

    fn counterpart(&self) -> Option<Arc<TestPeer>> {
        self.counterpart
            .lock()
            .expect("test peer lock poisoned")
            .clone()
    }

    /// Deliver a packet to every handler joined to its protocol.
    pub fn notify_packet(&self, pkt: &TestPacket) {
        for handler in self.handlers.lock().expect("test peer lock poisoned").iter() {
            if handler.protocol == pkt.protocol {
                handler
                    .tx
                    .try_send(pkt.clone())
                    .expect("test handler queue full");
            }
        }
    }

    /// Protocols this peer has joined.
    pub fn joined_protocols(&self) -> Vec<u16> {
        self.handlers
            .lock()
            .expect("test peer lock poisoned")
            .iter()
            .map(|h| h.protocol)
            .collect()
    }

    /// Register a handler for one protocol and return its send/receive
    /// surface.
    pub fn join(self: &Arc<Self>, protocol: u16) -> Arc<TestPeerHandler> {
        let (tx, rx) = mpsc::channel(HANDLER_QUEUE);
        let handler = Arc::new(TestPeerHandler {
            peer: Arc::downgrade(self),
            protocol,
            tx,
            rx: tokio::sync::Mutex::new(rx),
        });
        self.handlers
            .lock()
            .expect("test peer lock poisoned")
            .push(handler.clone());
        handler
    }
}

/// The send/receive surface of one joined protocol on a [`TestPeer`].
pub struct TestPeerHandler {
    peer: Weak<TestPeer>,
    protocol: u16,
    tx: mpsc::Sender<TestPacket>,
    rx: tokio::sync::Mutex<mpsc::Receiver<TestPacket>>,
}

impl TestPeerHandler {
    pub fn protocol(&self) -> u16 {
        self.protocol
    }

    fn send(&self, dest: PacketDest, sub_protocol: u16, payload: Vec<u8>) {
        let peer = self.peer.upgrade().expect("test peer dropped");
        let pkt = TestPacket {
            src: peer.id(),
            dest,
            protocol: self.protocol,
            sub_protocol,
            payload,
        };
        if let Some(other) = peer.counterpart() {
            other.notify_packet(&pkt);
        }
    }

    /// Send to the connected counterpart as a unicast.
    pub fn unicast(&self, sub_protocol: u16, payload: Vec<u8>) {
        let peer = self.peer.upgrade().expect("test peer dropped");
        let dest = peer
            .counterpart()
            .map(|p| p.id())
            .unwrap_or_else(PeerID::zero);
        self.send(PacketDest::Peer(dest), sub_protocol, payload);
    }

    /// Send to the connected counterpart tagged as a role multicast.
    pub fn multicast(&self, sub_protocol: u16, payload: Vec<u8>, role: RoleFlag) {
        self.send(PacketDest::Role(role), sub_protocol, payload);
    }

    /// Send to the connected counterpart tagged as a broadcast.
    pub fn broadcast(&self, sub_protocol: u16, payload: Vec<u8>, btype: BroadcastType) {
        self.send(PacketDest::Broadcast(btype), sub_protocol, payload);
    }

    /// Next delivered packet; parks until one arrives.
    pub async fn receive(&self) -> TestPacket {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .expect("all test peer senders dropped")
    }

    /// Next delivered packet, without waiting.
    pub fn try_receive(&self) -> Option<TestPacket> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }

    /// Assert the next packet is a unicast carrying this subprotocol and
    /// payload, and return it.
    pub async fn receive_unicast(&self, sub_protocol: u16, payload: &[u8]) -> TestPacket {
        let pkt = self.receive().await;
        assert!(
            matches!(pkt.dest, PacketDest::Peer(_)),
            "expected unicast, got {:?}",
            pkt.dest
        );
        assert_eq!(pkt.sub_protocol, sub_protocol);
        assert_eq!(pkt.payload, payload);
        pkt
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unicast_over_loopback() {
        let a = TestPeer::new();
        let b = TestPeer::new();
        a.connect(&b);
        let ha = a.join(0x0101);
        let hb = b.join(0x0101);

        ha.unicast(7, vec![1, 2, 3]);
        let pkt = hb.receive_unicast(7, &[1, 2, 3]).await;
        assert_eq!(pkt.src, a.id());
        assert_eq!(pkt.dest, PacketDest::Peer(b.id()));

        hb.unicast(8, vec![9]);
        ha.receive_unicast(8, &[9]).await;
    }

    #[tokio::test]
    async fn test_multicast_and_broadcast_tagging() {
        let a = TestPeer::new();
        let b = TestPeer::new();
        a.connect(&b);
        let ha = a.join(0x0101);
        let hb = b.join(0x0101);

        ha.multicast(1, vec![0xAA], RoleFlag::ROOT);
        let pkt = hb.receive().await;
        assert_eq!(pkt.dest, PacketDest::Role(RoleFlag::ROOT));

        ha.broadcast(2, vec![0xBB], BroadcastType::Neighbor);
        let pkt = hb.receive().await;
        assert_eq!(pkt.dest, PacketDest::Broadcast(BroadcastType::Neighbor));
    }

    #[tokio::test]
    async fn test_join_filters_by_protocol() {
        let a = TestPeer::new();
        let b = TestPeer::new();
        a.connect(&b);
        let ha = a.join(0x0101);
        let hb_main = b.join(0x0101);
        let hb_other = b.join(0x0202);
        assert_eq!(b.joined_protocols(), vec![0x0101, 0x0202]);

        ha.unicast(1, vec![1]);
        hb_main.receive_unicast(1, &[1]).await;
        assert!(hb_other.try_receive().is_none());
    }

    #[tokio::test]
    async fn test_detach_stops_delivery() {
        let a = TestPeer::new();
        let b = TestPeer::new();
        a.connect(&b);
        let ha = a.join(0x0101);
        let hb = b.join(0x0101);

        a.detach(&b);
        ha.unicast(1, vec![1]);
        assert!(hb.try_receive().is_none());

        // Detaching one side leaves the other's link intact.
        hb.unicast(2, vec![2]);
        ha.receive_unicast(2, &[2]).await;
    }
}
