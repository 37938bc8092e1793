//! Configuration for the networking layer.

use {
    crate::types::{NetAddress, RoleFlag},
    std::time::Duration,
};

/// Write deadline applied to every packet write.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-priority-level capacity of a peer's send queue.
pub const DEFAULT_SEND_QUEUE_SIZE: usize = 1000;

/// Number of send-queue priority levels (priorities `0..7`, 0 most urgent).
pub const DEFAULT_SEND_QUEUE_MAX_PRIORITY: usize = 7;

/// Seconds a packet hash stays in a peer's duplicate pool.
pub const DEFAULT_PEER_POOL_EXPIRE_SECS: u64 = 60;

/// Interval of the overlay's topology-maintenance tick.
pub const DEFAULT_QUERY_TICK: Duration = Duration::from_secs(1);

/// Minimum delay before redialing a network address that failed or closed.
pub const DEFAULT_REDIAL_BACKOFF: Duration = Duration::from_secs(8);

/// Maximum payload carried by one packet (a block part fits with room).
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 8 * 1024 * 1024;

/// Configuration for the transport and every per-channel overlay.
///
/// Controls connection limits, timeouts, and topology behavior for
/// peer-to-peer message propagation.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Local address to bind the listener on. Port 0 asks the OS for an
    /// ephemeral port; the advertised address is taken from the actual
    /// binding after `listen`.
    pub bind_addr: String,

    /// Seed relay addresses known at startup.
    pub seeds: Vec<NetAddress>,

    /// Validator (root) addresses trusted at startup. Used to assess role
    /// claims during query exchanges.
    pub trusted_roots: Vec<NetAddress>,

    /// The declared role of this node.
    pub role: RoleFlag,

    /// Maximum size of a single packet payload in bytes.
    pub max_payload_size: usize,

    /// Write deadline for a single packet.
    pub send_timeout: Duration,

    /// Per-priority-level send queue capacity.
    pub send_queue_size: usize,

    /// Number of send-queue priority levels.
    pub send_queue_max_priority: usize,

    /// Duplicate-pool expiry window in seconds.
    pub peer_pool_expire_secs: u64,

    /// Seconds a peer can be silent before the overlay closes it. The
    /// query exchange is the keep-alive; reads carry no deadline of
    /// their own.
    pub peer_timeout_secs: u64,

    /// Topology-maintenance tick interval.
    pub query_tick: Duration,

    /// Redial backoff per network address.
    pub redial_backoff: Duration,

    /// Maximum child connections (seed nodes fanning out to citizens).
    pub children_limit: usize,

    /// Maximum nephew connections (backup children).
    pub nephews_limit: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            seeds: Vec::new(),
            trusted_roots: Vec::new(),
            role: RoleFlag::NONE,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            send_queue_size: DEFAULT_SEND_QUEUE_SIZE,
            send_queue_max_priority: DEFAULT_SEND_QUEUE_MAX_PRIORITY,
            peer_pool_expire_secs: DEFAULT_PEER_POOL_EXPIRE_SECS,
            peer_timeout_secs: 30,
            query_tick: DEFAULT_QUERY_TICK,
            redial_backoff: DEFAULT_REDIAL_BACKOFF,
            children_limit: 10,
            nephews_limit: 10,
        }
    }
}

impl NetworkConfig {
    /// Create a config suitable for local testing: ephemeral port, short
    /// timers, and tiny queues so overflow paths are reachable.
    #[cfg(any(test, feature = "dev-context-only-utils"))]
    pub fn dev_default() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            send_timeout: Duration::from_secs(1),
            send_queue_size: 8,
            peer_pool_expire_secs: 2,
            query_tick: Duration::from_millis(100),
            redial_backoff: Duration::from_millis(300),
            children_limit: 4,
            nephews_limit: 4,
            ..Self::default()
        }
    }
}
