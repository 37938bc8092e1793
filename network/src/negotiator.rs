//! First handshake stage: agreeing on a channel.
//!
//! The dialing side opens with a [`ChannelQuery`] naming the logical
//! network it wants and its own dialable address; the accepting side
//! answers with a [`ChannelResult`] that either echoes the channel or
//! rejects it. Agreement sets the peer's channel and advances the
//! connection; anything else closes it with reason `"channel mismatch"`.

use {
    crate::{
        error::NetworkError,
        handler::{HandlerCore, PeerHandler},
        message::{
            self, ChannelQuery, ChannelResult, PROTO_CONTROL, SUB_CHANNEL_QUERY,
            SUB_CHANNEL_RESULT,
        },
        packet::Packet,
        peer::{Peer, PeerSink},
        types::{NetAddress, PeerID},
    },
    async_trait::async_trait,
    log::{debug, warn},
    std::{
        collections::HashSet,
        sync::{Arc, RwLock},
    },
    tessera_monitoring::NetworkMetrics,
};

/// The channel-negotiation stage.
pub struct ChannelNegotiator {
    core: HandlerCore,
    self_addr: RwLock<Option<NetAddress>>,
    channels: Arc<RwLock<HashSet<String>>>,
    metrics: Arc<NetworkMetrics>,
}

impl ChannelNegotiator {
    pub fn new(
        self_id: PeerID,
        channels: Arc<RwLock<HashSet<String>>>,
        metrics: Arc<NetworkMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            core: HandlerCore::new(self_id),
            self_addr: RwLock::new(None),
            channels,
            metrics,
        })
    }

    pub fn core(&self) -> &HandlerCore {
        &self.core
    }

    /// Record the address this node advertises, once the listener is bound.
    pub fn set_self_addr(&self, addr: NetAddress) {
        *self.self_addr.write().expect("self addr lock poisoned") = Some(addr);
    }

    fn self_addr(&self) -> Option<NetAddress> {
        self.self_addr
            .read()
            .expect("self addr lock poisoned")
            .clone()
    }

    fn channel_known(&self, channel: &str) -> bool {
        self.channels
            .read()
            .expect("channel set lock poisoned")
            .contains(channel)
    }

    async fn reject(&self, peer: &Arc<Peer>, reason: &str) {
        let result = ChannelResult {
            ok: false,
            reason: reason.to_string(),
            addr: self.self_addr(),
        };
        if let Err(err) = self
            .core
            .send_message(SUB_CHANNEL_RESULT, &result, peer)
            .await
        {
            debug!("peer[{peer}] reject send failed: {err}");
        }
        self.metrics.handshake_failures.inc();
        peer.close(reason);
    }

    async fn handle_query(&self, pkt: &Packet, peer: Arc<Peer>) {
        let query: ChannelQuery = match message::decode(&pkt.payload) {
            Ok(q) => q,
            Err(err) => {
                peer.close_by_error(err);
                return;
            }
        };
        if !self.channel_known(&query.channel) {
            warn!("peer[{peer}] asked for unknown channel {:?}", query.channel);
            self.reject(&peer, "channel mismatch").await;
            return;
        }
        peer.set_channel(&query.channel);
        if let Some(addr) = query.addr {
            peer.set_net_address(addr);
        }
        let result = ChannelResult {
            ok: true,
            reason: String::new(),
            addr: self.self_addr(),
        };
        if let Err(err) = self
            .core
            .send_message(SUB_CHANNEL_RESULT, &result, &peer)
            .await
        {
            peer.close_by_error(err);
            return;
        }
        debug!("peer[{peer}] joined channel {:?}", query.channel);
        self.core.next_on_peer(peer).await;
    }

    async fn handle_result(&self, pkt: &Packet, peer: Arc<Peer>) {
        let result: ChannelResult = match message::decode(&pkt.payload) {
            Ok(r) => r,
            Err(err) => {
                peer.close_by_error(err);
                return;
            }
        };
        if !result.ok {
            warn!(
                "peer[{peer}] rejected channel {:?}: {}",
                peer.channel(),
                result.reason
            );
            self.metrics.handshake_failures.inc();
            peer.close("channel mismatch");
            return;
        }
        // Prefer the address we actually dialed; fall back to the
        // advertised one.
        if peer.net_address().is_none() {
            if let Some(addr) = peer.dial_address().cloned().or(result.addr) {
                peer.set_net_address(addr);
            }
        }
        self.core.next_on_peer(peer).await;
    }
}

#[async_trait]
impl PeerSink for ChannelNegotiator {
    async fn on_packet(&self, pkt: Packet, peer: Arc<Peer>) {
        if pkt.protocol != PROTO_CONTROL {
            peer.close_by_error(NetworkError::ProtocolViolation(format!(
                "non-control packet {:#06x} during channel negotiation",
                pkt.protocol
            )));
            return;
        }
        match pkt.sub_protocol {
            SUB_CHANNEL_QUERY if peer.is_incoming() => self.handle_query(&pkt, peer).await,
            SUB_CHANNEL_RESULT if !peer.is_incoming() => self.handle_result(&pkt, peer).await,
            sub => {
                peer.close_by_error(NetworkError::ProtocolViolation(format!(
                    "unexpected subprotocol {sub:#06x} during channel negotiation"
                )));
            }
        }
    }

    async fn on_error(&self, err: NetworkError, peer: Arc<Peer>, _pkt: Option<Packet>) {
        debug!("peer[{peer}] negotiator error: {err}");
        peer.close_by_error(err);
    }

    async fn on_close(&self, peer: Arc<Peer>) {
        debug!("peer[{peer}] closed during channel negotiation");
    }
}

#[async_trait]
impl PeerHandler for ChannelNegotiator {
    async fn on_peer(&self, peer: Arc<Peer>) {
        if peer.is_incoming() {
            // Wait for the dialer's query.
            return;
        }
        let query = ChannelQuery {
            channel: peer.channel(),
            addr: self.self_addr(),
        };
        if let Err(err) = self.core.send_message(SUB_CHANNEL_QUERY, &query, &peer).await {
            peer.close_by_error(err);
        }
    }
}
