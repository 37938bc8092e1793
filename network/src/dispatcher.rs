//! Final handshake stage: handing an authenticated peer to its channel's
//! overlay.

use {
    crate::{
        error::NetworkError,
        handler::{HandlerCore, PeerHandler},
        overlay::PeerToPeer,
        packet::Packet,
        peer::{Peer, PeerSink},
        types::PeerID,
    },
    async_trait::async_trait,
    log::{debug, warn},
    std::{
        collections::{HashMap, HashSet},
        sync::{Arc, RwLock},
    },
};

/// Demultiplexes fully initialized peers to the per-channel overlay.
pub struct PeerDispatcher {
    core: HandlerCore,
    channels: Arc<RwLock<HashSet<String>>>,
    p2ps: RwLock<HashMap<String, Arc<PeerToPeer>>>,
}

impl PeerDispatcher {
    pub fn new(self_id: PeerID, channels: Arc<RwLock<HashSet<String>>>) -> Arc<Self> {
        Arc::new(Self {
            core: HandlerCore::new(self_id),
            channels,
            p2ps: RwLock::new(HashMap::new()),
        })
    }

    pub fn core(&self) -> &HandlerCore {
        &self.core
    }

    /// Register a channel's overlay. Future peers negotiating that channel
    /// are handed to it.
    pub fn register_p2p(&self, channel: &str, p2p: Arc<PeerToPeer>) {
        self.p2ps
            .write()
            .expect("p2p map lock poisoned")
            .insert(channel.to_string(), p2p);
        self.channels
            .write()
            .expect("channel set lock poisoned")
            .insert(channel.to_string());
    }

    pub fn p2p(&self, channel: &str) -> Option<Arc<PeerToPeer>> {
        self.p2ps
            .read()
            .expect("p2p map lock poisoned")
            .get(channel)
            .cloned()
    }
}

#[async_trait]
impl PeerSink for PeerDispatcher {
    async fn on_packet(&self, pkt: Packet, peer: Arc<Peer>) {
        // Nothing should arrive while a peer sits between authentication
        // and attachment.
        debug!("peer[{peer}] packet before attach: {pkt:?}");
    }

    async fn on_error(&self, err: NetworkError, peer: Arc<Peer>, _pkt: Option<Packet>) {
        peer.close_by_error(err);
    }

    async fn on_close(&self, peer: Arc<Peer>) {
        debug!("peer[{peer}] closed at dispatch");
    }
}

#[async_trait]
impl PeerHandler for PeerDispatcher {
    async fn on_peer(&self, peer: Arc<Peer>) {
        let channel = peer.channel();
        match self.p2p(&channel) {
            Some(p2p) => {
                peer.set_sink(p2p.clone());
                p2p.on_peer(peer).await;
            }
            None => {
                warn!("peer[{peer}] negotiated unknown channel {channel:?}");
                peer.close("no p2p for channel");
            }
        }
    }
}
