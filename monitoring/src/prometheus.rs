//! Prometheus text format exporter for Tessera network metrics.
//!
//! Encodes a [`MetricsSnapshot`] into the [Prometheus exposition format](https://prometheus.io/docs/instrumenting/exposition_formats/)
//! (text/plain; version=0.0.4). The node's HTTP layer serves the result on
//! its `/metrics` endpoint; this crate only produces the text.

use crate::MetricsSnapshot;

/// Encode a metrics snapshot into Prometheus text exposition format.
pub fn encode(snap: &MetricsSnapshot) -> String {
    let mut out = String::with_capacity(2048);

    write_counter(&mut out, "tessera_net_packets_sent_total",
        "Total packets written to the wire",
        snap.packets_sent);

    write_counter(&mut out, "tessera_net_packets_received_total",
        "Total packets read from the wire and delivered upward",
        snap.packets_received);

    write_counter(&mut out, "tessera_net_bytes_sent_total",
        "Total payload bytes written to the wire",
        snap.bytes_sent);

    write_counter(&mut out, "tessera_net_bytes_received_total",
        "Total payload bytes read from the wire",
        snap.bytes_received);

    write_counter(&mut out, "tessera_net_duplicates_dropped_total",
        "Total sends dropped by duplicate suppression",
        snap.duplicates_dropped);

    write_counter(&mut out, "tessera_net_queue_overflows_total",
        "Total sends rejected because a send-queue priority level was full",
        snap.queue_overflows);

    write_counter(&mut out, "tessera_net_handshake_failures_total",
        "Total connections dropped during channel negotiation or authentication",
        snap.handshake_failures);

    write_gauge(&mut out, "tessera_net_peers_connected",
        "Peers currently attached to an overlay",
        snap.peers_connected);

    out
}

// ---------------------------------------------------------------------------
// Helper writers
// ---------------------------------------------------------------------------

fn write_counter(out: &mut String, name: &str, help: &str, value: u64) {
    out.push_str(&format!("# HELP {name} {help}\n"));
    out.push_str(&format!("# TYPE {name} counter\n"));
    out.push_str(&format!("{name} {value}\n\n"));
}

fn write_gauge(out: &mut String, name: &str, help: &str, value: i64) {
    out.push_str(&format!("# HELP {name} {help}\n"));
    out.push_str(&format!("# TYPE {name} gauge\n"));
    out.push_str(&format!("{name} {value}\n\n"));
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use {super::*, crate::NetworkMetrics};

    #[test]
    fn test_encode_contains_all_series() {
        let m = NetworkMetrics::new();
        m.on_send(10);
        m.peers_connected.set(3);
        let text = encode(&m.snapshot());
        assert!(text.contains("tessera_net_packets_sent_total 1"));
        assert!(text.contains("tessera_net_bytes_sent_total 10"));
        assert!(text.contains("tessera_net_peers_connected 3"));
        assert!(text.contains("# TYPE tessera_net_peers_connected gauge"));
    }

    #[test]
    fn test_counter_and_gauge_types_tagged() {
        let m = NetworkMetrics::new();
        let text = encode(&m.snapshot());
        assert!(text.contains("# TYPE tessera_net_packets_sent_total counter"));
        assert!(text.contains("tessera_net_queue_overflows_total 0"));
    }
}
