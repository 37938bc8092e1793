//! TCP transport: listener, dialers, and the handshake chain entry.
//!
//! One [`Transport`] per process. It owns the TCP listener, the three-stage
//! handler chain, and the dispatcher's channel table. Both accepted and
//! dialed connections enter the chain at the channel negotiator; only
//! after negotiation, authentication, and dispatch does a peer reach an
//! overlay.

use {
    crate::{
        auth::Authenticator,
        config::NetworkConfig,
        dispatcher::PeerDispatcher,
        error::{NetworkError, Result},
        handler::PeerHandler,
        negotiator::ChannelNegotiator,
        overlay::PeerToPeer,
        peer::Peer,
        types::{NetAddress, PeerID},
    },
    log::{debug, info, warn},
    std::{
        collections::HashSet,
        net::SocketAddr,
        sync::{Arc, Mutex, RwLock, Weak},
    },
    tessera_common::Wallet,
    tessera_monitoring::NetworkMetrics,
    tokio::{net::TcpListener, net::TcpStream, task::JoinHandle},
};

struct ListenerHandle {
    task: JoinHandle<()>,
    local_addr: SocketAddr,
}

/// The process-wide transport.
pub struct Transport {
    config: Arc<NetworkConfig>,
    metrics: Arc<NetworkMetrics>,
    self_id: PeerID,
    negotiator: Arc<ChannelNegotiator>,
    dispatcher: Arc<PeerDispatcher>,
    listener: Mutex<Option<ListenerHandle>>,
    listen_addr: RwLock<Option<NetAddress>>,
}

impl Transport {
    /// Build the transport and its handler chain from the node's wallet.
    pub fn new(config: NetworkConfig, wallet: Arc<Wallet>) -> Arc<Self> {
        let config = Arc::new(config);
        let metrics = Arc::new(NetworkMetrics::new());
        let self_id = PeerID::from_public_key(&wallet.public_key());
        let channels: Arc<RwLock<HashSet<String>>> = Arc::new(RwLock::new(HashSet::new()));

        let negotiator = ChannelNegotiator::new(self_id, channels.clone(), metrics.clone());
        let authenticator = Authenticator::new(wallet, metrics.clone());
        let dispatcher = PeerDispatcher::new(self_id, channels);
        negotiator.core().set_next(authenticator.clone());
        authenticator.core().set_next(dispatcher.clone());

        Arc::new(Self {
            config,
            metrics,
            self_id,
            negotiator,
            dispatcher,
            listener: Mutex::new(None),
            listen_addr: RwLock::new(None),
        })
    }

    /// The local node's peer identity.
    pub fn peer_id(&self) -> PeerID {
        self.self_id
    }

    /// The advertised address, known once `listen` has bound.
    pub fn address(&self) -> Option<NetAddress> {
        self.listen_addr
            .read()
            .expect("listen addr lock poisoned")
            .clone()
    }

    pub fn config(&self) -> &Arc<NetworkConfig> {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<NetworkMetrics> {
        &self.metrics
    }

    /// Bind the configured address and start accepting connections.
    pub async fn listen(self: &Arc<Self>) -> Result<NetAddress> {
        {
            let guard = self.listener.lock().expect("listener lock poisoned");
            if guard.is_some() {
                return Err(NetworkError::AlreadyListening);
            }
        }
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let advertised = NetAddress::new(local_addr.to_string())?;
        info!("transport listening on {advertised}");

        self.negotiator.set_self_addr(advertised.clone());
        *self.listen_addr.write().expect("listen addr lock poisoned") = Some(advertised.clone());

        let transport = self.clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        debug!("accepted connection from {addr}");
                        let peer = Peer::new(
                            stream,
                            true,
                            None,
                            transport.config.clone(),
                            transport.metrics.clone(),
                        );
                        transport.dispatch(peer).await;
                    }
                    Err(err) => {
                        warn!("accept error: {err}");
                    }
                }
            }
        });

        let mut guard = self.listener.lock().expect("listener lock poisoned");
        *guard = Some(ListenerHandle { task, local_addr });
        Ok(advertised)
    }

    /// Stop accepting connections. Errors if the transport is not
    /// listening.
    pub fn close(&self) -> Result<()> {
        let handle = self
            .listener
            .lock()
            .expect("listener lock poisoned")
            .take()
            .ok_or(NetworkError::NotListening)?;
        handle.task.abort();
        debug!("transport stopped listening on {}", handle.local_addr);
        Ok(())
    }

    /// Dial a remote address on the given channel and run the handshake.
    pub async fn dial(self: &Arc<Self>, addr: &NetAddress, channel: &str) -> Result<()> {
        let stream = TcpStream::connect(addr.as_str()).await?;
        debug!("dialed {addr} for channel {channel:?}");
        let peer = Peer::new(
            stream,
            false,
            Some(addr.clone()),
            self.config.clone(),
            self.metrics.clone(),
        );
        peer.set_channel(channel);
        peer.set_net_address(addr.clone());
        self.dispatch(peer).await;
        Ok(())
    }

    /// A dial handle bound to one channel, for the overlay's use.
    pub fn dialer(self: &Arc<Self>, channel: &str) -> Dialer {
        Dialer {
            channel: channel.to_string(),
            transport: Arc::downgrade(self),
        }
    }

    /// Register a channel's overlay with the dispatcher and the channel
    /// table consulted during negotiation.
    pub fn attach_overlay(&self, channel: &str, p2p: Arc<PeerToPeer>) {
        self.dispatcher.register_p2p(channel, p2p);
    }

    async fn dispatch(&self, peer: Arc<Peer>) {
        peer.set_sink(self.negotiator.clone());
        self.negotiator.on_peer(peer).await;
    }
}

/// Dials remote addresses into one channel's handshake.
///
/// Holds only a weak reference to the transport so overlays do not keep
/// it alive.
#[derive(Clone)]
pub struct Dialer {
    channel: String,
    transport: Weak<Transport>,
}

impl Dialer {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub async fn dial(&self, addr: &NetAddress) -> Result<()> {
        let transport = self
            .transport
            .upgrade()
            .ok_or(NetworkError::NotAvailable)?;
        transport.dial(addr, &self.channel).await
    }
}
