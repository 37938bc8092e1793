//! Error types for the networking layer.

use {crate::types::PeerID, thiserror::Error};

/// Errors that can occur in the networking layer.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Transport-level I/O error.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to encode or decode a structured payload.
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    /// The wire framing was violated (bad magic, version, length, or hash).
    #[error("framing error: {0}")]
    Framing(String),

    /// A packet payload exceeds the maximum allowed size.
    #[error("payload too large: {size} bytes (max {max} bytes)")]
    PayloadTooLarge {
        /// Actual payload size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// The peer is closed or was never connected.
    #[error("peer not available")]
    NotAvailable,

    /// The send queue is full at the requested priority level.
    #[error("send queue overflow at priority {0}")]
    QueueOverflow(u8),

    /// The packet was suppressed by duplicate detection.
    #[error("duplicated packet")]
    DuplicatedPacket,

    /// A write did not complete within the send deadline.
    #[error("send timed out after {0}ms")]
    SendTimeout(u64),

    /// The remote violated the protocol state machine.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The requested priority exceeds the configured level count.
    #[error("invalid priority {0}")]
    InvalidPriority(u8),

    /// No attached peer carries the requested identity.
    #[error("unknown peer: {0}")]
    UnknownPeer(PeerID),

    /// No attached peer matched a multicast role mask.
    #[error("no peer matched role mask {0:#04x}")]
    NoMatchingPeer(u8),

    /// The transport is already listening.
    #[error("already listening")]
    AlreadyListening,

    /// The transport is not listening.
    #[error("not listening")]
    NotListening,

    /// A protocol id was registered twice on one channel.
    #[error("protocol {0:#06x} already registered")]
    ProtocolRegistered(u16),

    /// A peer task died from a panic.
    #[error("peer task panicked: {0}")]
    TaskPanicked(&'static str),

    /// A malformed network address.
    #[error("invalid net address: {0}")]
    InvalidAddress(String),
}

impl NetworkError {
    /// Whether this error is a recognized transient network condition.
    ///
    /// Only permanent errors close the peer; temporary ones are reported
    /// through the error callback and the connection stays open.
    pub fn is_temporary(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}

/// Convenience result type for networking operations.
pub type Result<T> = std::result::Result<T, NetworkError>;

// ── Tests ───────────────────────────────────────────────────────────────────
