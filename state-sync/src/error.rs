//! Error types for the state-sync layer.

use {tessera_network::PeerID, thiserror::Error};

/// Errors that can occur while serving or driving a state sync.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The underlying network rejected a send.
    #[error("network error: {0}")]
    Network(#[from] tessera_network::NetworkError),

    /// Failed to encode or decode a sync message.
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    /// A request was issued to a peer that already has one in flight.
    #[error("request already in flight for peer {0}")]
    AlreadyInFlight(PeerID),

    /// No peer is ready to take a request.
    #[error("no ready peers")]
    NoPeers,

    /// The sync was asked to start while another run is active.
    #[error("sync already running")]
    AlreadyRunning,
}

/// Convenience result type for state-sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
