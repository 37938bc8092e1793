//! The per-connection handshake pipeline.
//!
//! A new connection walks an ordered chain of handlers — channel
//! negotiator, authenticator, peer dispatcher — each consuming the control
//! packets of its own stage. A stage that succeeds rewires the peer's sink
//! to the next handler and hands the peer over; a stage that fails closes
//! the connection. Stages never retry: a failed handshake closes, and the
//! overlay may redial the address later.

use {
    crate::{
        error::Result,
        message::{self, PROTO_CONTROL},
        packet::{Packet, PacketDest},
        peer::{Peer, PeerSink},
        types::PeerID,
    },
    async_trait::async_trait,
    log::debug,
    serde::Serialize,
    std::sync::{Arc, RwLock},
};

/// A stage of the handshake pipeline. Every handler is also the peer's
/// [`PeerSink`] while the peer sits at its stage.
#[async_trait]
pub trait PeerHandler: PeerSink {
    /// Called when a peer reaches this stage.
    async fn on_peer(&self, peer: Arc<Peer>);
}

/// The next stage of the chain, kept under both of its trait facets so a
/// transition can rewire the peer's sink without trait upcasting.
struct NextHandler {
    sink: Arc<dyn PeerSink>,
    handler: Arc<dyn PeerHandler>,
}

/// Shared wiring owned by every handler: the local identity and the link
/// to the next stage.
pub struct HandlerCore {
    self_id: PeerID,
    next: RwLock<Option<NextHandler>>,
}

impl HandlerCore {
    pub fn new(self_id: PeerID) -> Self {
        Self {
            self_id,
            next: RwLock::new(None),
        }
    }

    /// The local node's peer identity.
    pub fn self_id(&self) -> PeerID {
        self.self_id
    }

    /// Wire the following stage.
    pub fn set_next<H: PeerHandler + 'static>(&self, handler: Arc<H>) {
        *self.next.write().expect("handler chain lock poisoned") = Some(NextHandler {
            sink: handler.clone(),
            handler,
        });
    }

    /// Advance a peer to the next stage: rewire its callbacks and invoke
    /// the next handler's `on_peer`.
    pub async fn next_on_peer(&self, peer: Arc<Peer>) {
        let next = {
            let guard = self.next.read().expect("handler chain lock poisoned");
            guard.as_ref().map(|n| (n.sink.clone(), n.handler.clone()))
        };
        match next {
            Some((sink, handler)) => {
                peer.set_sink(sink);
                handler.on_peer(peer).await;
            }
            None => {
                debug!("handler chain ends before peer[{peer}] attached");
                peer.close("incomplete handler chain");
            }
        }
    }

    /// Serialize and immediately write a control message to a peer,
    /// bypassing the send queue.
    pub async fn send_message<T: Serialize>(
        &self,
        sub_protocol: u16,
        msg: &T,
        peer: &Peer,
    ) -> Result<()> {
        let payload = message::encode(msg)?;
        let pkt = Packet::new(
            self.self_id,
            PacketDest::Peer(peer.id().unwrap_or_else(PeerID::zero)),
            PROTO_CONTROL,
            sub_protocol,
            payload,
            1,
            0,
            true,
        );
        peer.send_direct(&pkt).await
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
