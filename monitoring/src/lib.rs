//! # Tessera Monitoring
//!
//! Metrics collection for the Tessera node's network layer.
//!
//! Provides two metric types matching Prometheus conventions:
//! - **Counter**: monotonically increasing value (e.g., packets sent)
//! - **Gauge**: value that can go up or down (e.g., connected peers)
//!
//! ## Usage
//!
//! ```rust
//! use tessera_monitoring::NetworkMetrics;
//!
//! let metrics = NetworkMetrics::new();
//!
//! // Record traffic events
//! metrics.packets_sent.inc();
//! metrics.bytes_sent.add(58);
//! metrics.peers_connected.inc();
//!
//! // Export as Prometheus text format
//! let snapshot = metrics.snapshot();
//! let prom_text = tessera_monitoring::prometheus::encode(&snapshot);
//! ```

pub mod prometheus;

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

// ---------------------------------------------------------------------------
// Metric primitives
// ---------------------------------------------------------------------------

/// A monotonically increasing counter.
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub const fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    /// Increment the counter by 1.
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Add a value to the counter.
    pub fn add(&self, v: u64) {
        self.value.fetch_add(v, Ordering::Relaxed);
    }

    /// Get the current counter value.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

/// A gauge that can go up or down.
pub struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    pub const fn new() -> Self {
        Self {
            value: AtomicI64::new(0),
        }
    }

    /// Set the gauge to an absolute value.
    pub fn set(&self, v: i64) {
        self.value.store(v, Ordering::Relaxed);
    }

    /// Increment the gauge by 1.
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement the gauge by 1.
    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    /// Get the current gauge value.
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl Default for Gauge {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Network metrics
// ---------------------------------------------------------------------------

/// All metrics emitted by the network layer.
///
/// One instance is shared (behind an `Arc`) between the transport, every
/// peer's I/O tasks, and each per-channel overlay.
#[derive(Default)]
pub struct NetworkMetrics {
    /// Packets written to the wire.
    pub packets_sent: Counter,
    /// Packets successfully read and delivered upward.
    pub packets_received: Counter,
    /// Payload bytes written to the wire.
    pub bytes_sent: Counter,
    /// Payload bytes read from the wire.
    pub bytes_received: Counter,
    /// Sends dropped by duplicate suppression.
    pub duplicates_dropped: Counter,
    /// Sends rejected because a priority level was full.
    pub queue_overflows: Counter,
    /// Connections that failed channel negotiation or authentication.
    pub handshake_failures: Counter,
    /// Peers currently attached to an overlay.
    pub peers_connected: Gauge,
}

/// A point-in-time copy of [`NetworkMetrics`], safe to encode off-thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub duplicates_dropped: u64,
    pub queue_overflows: u64,
    pub handshake_failures: u64,
    pub peers_connected: i64,
}

impl NetworkMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture the current values of every metric.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            packets_sent: self.packets_sent.get(),
            packets_received: self.packets_received.get(),
            bytes_sent: self.bytes_sent.get(),
            bytes_received: self.bytes_received.get(),
            duplicates_dropped: self.duplicates_dropped.get(),
            queue_overflows: self.queue_overflows.get(),
            handshake_failures: self.handshake_failures.get(),
            peers_connected: self.peers_connected.get(),
        }
    }

    /// Record one outbound packet with its payload size.
    pub fn on_send(&self, payload_len: usize) {
        self.packets_sent.inc();
        self.bytes_sent.add(payload_len as u64);
    }

    /// Record one inbound packet with its payload size.
    pub fn on_recv(&self, payload_len: usize) {
        self.packets_received.inc();
        self.bytes_received.add(payload_len as u64);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_and_gauge() {
        let m = NetworkMetrics::new();
        m.packets_sent.inc();
        m.packets_sent.add(2);
        m.peers_connected.inc();
        m.peers_connected.inc();
        m.peers_connected.dec();
        assert_eq!(m.packets_sent.get(), 3);
        assert_eq!(m.peers_connected.get(), 1);
    }

    #[test]
    fn test_snapshot_is_point_in_time() {
        let m = NetworkMetrics::new();
        m.on_send(100);
        let snap = m.snapshot();
        m.on_send(100);
        assert_eq!(snap.packets_sent, 1);
        assert_eq!(snap.bytes_sent, 100);
        assert_eq!(m.snapshot().packets_sent, 2);
    }
}
