//! Protocol handler registry and the per-channel network manager.
//!
//! Application protocols register a [`Reactor`] under a `(name, protocol
//! id, priority)` triple and get back a [`ProtocolHandler`] carrying the
//! send API. Registrations live as long as the transport; register and
//! unregister are serialized by the overlay's registry lock.

use {
    crate::{
        config::NetworkConfig,
        error::{NetworkError, Result},
        overlay::PeerToPeer,
        packet::Packet,
        transport::Transport,
        types::{BroadcastType, NetAddress, PeerID, RoleFlag},
    },
    async_trait::async_trait,
    log::info,
    std::sync::Arc,
};

/// Application-level handler registered for one protocol.
#[async_trait]
pub trait Reactor: Send + Sync {
    /// Called for every inbound packet of the protocol. Returns whether
    /// the overlay should re-broadcast the packet to the rest of the
    /// topology.
    async fn on_receive(&self, sub_protocol: u16, payload: &[u8], from: PeerID) -> Result<bool>;

    /// A peer joined the channel.
    async fn on_join(&self, id: PeerID);

    /// A peer left the channel.
    async fn on_leave(&self, id: PeerID);

    /// A packet of this protocol failed to send.
    async fn on_failure(&self, err: NetworkError, pkt: &Packet);
}

/// One registry entry.
#[derive(Clone)]
pub(crate) struct RegisteredProtocol {
    pub name: String,
    pub priority: u8,
    pub reactor: Arc<dyn Reactor>,
}

/// The send API handed to a registered protocol.
#[derive(Clone)]
pub struct ProtocolHandler {
    p2p: Arc<PeerToPeer>,
    protocol: u16,
    priority: u8,
}

impl ProtocolHandler {
    pub(crate) fn new(p2p: Arc<PeerToPeer>, protocol: u16, priority: u8) -> Self {
        Self {
            p2p,
            protocol,
            priority,
        }
    }

    pub fn protocol(&self) -> u16 {
        self.protocol
    }

    /// Deliver to exactly one connected peer.
    pub fn unicast(&self, sub_protocol: u16, payload: Vec<u8>, dest: PeerID) -> Result<()> {
        self.p2p
            .unicast(self.protocol, sub_protocol, payload, dest, self.priority)
    }

    /// Deliver to every connected peer whose observed role satisfies the
    /// mask.
    pub fn multicast(&self, sub_protocol: u16, payload: Vec<u8>, role: RoleFlag) -> Result<()> {
        self.p2p
            .multicast(self.protocol, sub_protocol, payload, role, self.priority)
    }

    /// Flood with the given semantics.
    pub fn broadcast(
        &self,
        sub_protocol: u16,
        payload: Vec<u8>,
        btype: BroadcastType,
    ) -> Result<()> {
        self.p2p
            .broadcast(self.protocol, sub_protocol, payload, btype, self.priority)
    }
}

/// Per-channel front door for applications: creates the overlay, attaches
/// it to the transport, and owns reactor registration.
pub struct NetworkManager {
    channel: String,
    p2p: Arc<PeerToPeer>,
}

impl NetworkManager {
    /// Create the channel's overlay and start its maintenance tick. The
    /// transport should already be listening so the overlay knows its own
    /// advertised address.
    pub fn new(transport: &Arc<Transport>, channel: &str) -> Arc<Self> {
        let p2p = PeerToPeer::new(
            channel,
            transport.peer_id(),
            transport.address(),
            transport.dialer(channel),
            transport.config().clone(),
            transport.metrics().clone(),
        );
        transport.attach_overlay(channel, p2p.clone());
        p2p.start();
        info!("network manager up for channel {channel:?}");
        Arc::new(Self {
            channel: channel.to_string(),
            p2p,
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn peer_id(&self) -> PeerID {
        self.p2p.self_id()
    }

    /// Register a reactor for a protocol id. The returned handler carries
    /// the send API; packets of the protocol are queued at `priority`.
    pub fn register_reactor(
        &self,
        name: &str,
        protocol: u16,
        reactor: Arc<dyn Reactor>,
        priority: u8,
    ) -> Result<ProtocolHandler> {
        self.p2p.register(name, protocol, reactor, priority)?;
        Ok(ProtocolHandler::new(self.p2p.clone(), protocol, priority))
    }

    /// Remove a protocol registration. Returns whether it existed.
    pub fn unregister_reactor(&self, protocol: u16) -> bool {
        self.p2p.unregister(protocol)
    }

    /// Set the node's declared role on this channel.
    pub fn set_role(&self, role: RoleFlag) {
        self.p2p.set_role(role);
    }

    /// Identities of every attached peer.
    pub fn peer_ids(&self) -> Vec<PeerID> {
        self.p2p.peer_ids()
    }

    /// Identity of the current parent, if any.
    pub fn parent_id(&self) -> Option<PeerID> {
        self.p2p.parent().and_then(|p| p.id())
    }

    /// Dialable address of the current parent, if any.
    pub fn parent_address(&self) -> Option<NetAddress> {
        self.p2p.parent().and_then(|p| p.net_address())
    }

    /// How many attached peers hold the given connection type.
    pub fn count_of(&self, ct: crate::types::ConnectionType) -> usize {
        self.p2p
            .peer_ids()
            .iter()
            .filter_map(|id| self.p2p.peer(id))
            .filter(|p| p.conn_type() == ct)
            .count()
    }

    /// Seed addresses currently known on this channel.
    pub fn seeds(&self) -> Vec<NetAddress> {
        self.p2p.seeds()
    }

    /// Stop the overlay: end the tick task and close every peer.
    pub fn term(&self) {
        self.p2p.close();
    }

    /// Convenience accessor for tests and callers that tune the overlay.
    pub fn config(&self) -> Arc<NetworkConfig> {
        self.p2p.config().clone()
    }
}
