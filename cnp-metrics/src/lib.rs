#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

// Membership
pub static JOINS_ACCEPTED: AtomicU64 = AtomicU64::new(0);
pub static JOINS_FORWARDED: AtomicU64 = AtomicU64::new(0);
pub static CLUSTER_SPLITS: AtomicU64 = AtomicU64::new(0);
pub static LEADER_CONVERSIONS: AtomicU64 = AtomicU64::new(0);
pub static MEMBERS_REMOVED: AtomicU64 = AtomicU64::new(0);
pub static DISCONNECTS: AtomicU64 = AtomicU64::new(0);
pub static FAULTS: AtomicU64 = AtomicU64::new(0);

// Reliable forwarding
pub static MESSAGES_ORIGINATED: AtomicU64 = AtomicU64::new(0);
pub static MESSAGES_DELIVERED: AtomicU64 = AtomicU64::new(0);
pub static DUPLICATES_SUPPRESSED: AtomicU64 = AtomicU64::new(0);
pub static FORWARD_RETRIES: AtomicU64 = AtomicU64::new(0);
pub static ROUTING_BOUNCES: AtomicU64 = AtomicU64::new(0);
pub static FAILOVER_REPLAYS: AtomicU64 = AtomicU64::new(0);

// Failure detection
pub static PROBES_SENT: AtomicU64 = AtomicU64::new(0);
pub static PROBE_TIMEOUTS: AtomicU64 = AtomicU64::new(0);

// Transport
pub static FRAMES_SENT: AtomicU64 = AtomicU64::new(0);
pub static FRAMES_RECEIVED: AtomicU64 = AtomicU64::new(0);
pub static SEND_FAILURES: AtomicU64 = AtomicU64::new(0);
pub static CRC_FAILURES: AtomicU64 = AtomicU64::new(0);
pub static CONNECTIONS_ACTIVE: AtomicU64 = AtomicU64::new(0);

#[inline]
pub fn increment_joins_accepted() {
    JOINS_ACCEPTED.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn increment_joins_forwarded() {
    JOINS_FORWARDED.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn increment_cluster_splits() {
    CLUSTER_SPLITS.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn increment_leader_conversions() {
    LEADER_CONVERSIONS.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn increment_members_removed() {
    MEMBERS_REMOVED.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn increment_disconnects() {
    DISCONNECTS.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn increment_faults() {
    FAULTS.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn increment_messages_originated() {
    MESSAGES_ORIGINATED.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn increment_messages_delivered() {
    MESSAGES_DELIVERED.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn increment_duplicates_suppressed() {
    DUPLICATES_SUPPRESSED.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn increment_forward_retries(count: u64) {
    FORWARD_RETRIES.fetch_add(count, Ordering::Relaxed);
}

#[inline]
pub fn increment_routing_bounces() {
    ROUTING_BOUNCES.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn increment_failover_replays(count: u64) {
    FAILOVER_REPLAYS.fetch_add(count, Ordering::Relaxed);
}

#[inline]
pub fn increment_probes_sent(count: u64) {
    PROBES_SENT.fetch_add(count, Ordering::Relaxed);
}

#[inline]
pub fn increment_probe_timeouts() {
    PROBE_TIMEOUTS.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn increment_frames_sent() {
    FRAMES_SENT.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn increment_frames_received() {
    FRAMES_RECEIVED.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn increment_send_failures() {
    SEND_FAILURES.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn increment_crc_failures() {
    CRC_FAILURES.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn increment_connections() {
    CONNECTIONS_ACTIVE.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn decrement_connections() {
    // Saturating: a racing close must never wrap the gauge.
    let _ = CONNECTIONS_ACTIVE.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
        Some(v.saturating_sub(1))
    });
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub joins_accepted: u64,
    pub joins_forwarded: u64,
    pub cluster_splits: u64,
    pub leader_conversions: u64,
    pub members_removed: u64,
    pub disconnects: u64,
    pub faults: u64,
    pub messages_originated: u64,
    pub messages_delivered: u64,
    pub duplicates_suppressed: u64,
    pub forward_retries: u64,
    pub routing_bounces: u64,
    pub failover_replays: u64,
    pub probes_sent: u64,
    pub probe_timeouts: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub send_failures: u64,
    pub crc_failures: u64,
    pub connections_active: u64,
}

impl MetricsSnapshot {
    #[must_use]
    pub fn capture() -> Self {
        Self {
            joins_accepted: JOINS_ACCEPTED.load(Ordering::Relaxed),
            joins_forwarded: JOINS_FORWARDED.load(Ordering::Relaxed),
            cluster_splits: CLUSTER_SPLITS.load(Ordering::Relaxed),
            leader_conversions: LEADER_CONVERSIONS.load(Ordering::Relaxed),
            members_removed: MEMBERS_REMOVED.load(Ordering::Relaxed),
            disconnects: DISCONNECTS.load(Ordering::Relaxed),
            faults: FAULTS.load(Ordering::Relaxed),
            messages_originated: MESSAGES_ORIGINATED.load(Ordering::Relaxed),
            messages_delivered: MESSAGES_DELIVERED.load(Ordering::Relaxed),
            duplicates_suppressed: DUPLICATES_SUPPRESSED.load(Ordering::Relaxed),
            forward_retries: FORWARD_RETRIES.load(Ordering::Relaxed),
            routing_bounces: ROUTING_BOUNCES.load(Ordering::Relaxed),
            failover_replays: FAILOVER_REPLAYS.load(Ordering::Relaxed),
            probes_sent: PROBES_SENT.load(Ordering::Relaxed),
            probe_timeouts: PROBE_TIMEOUTS.load(Ordering::Relaxed),
            frames_sent: FRAMES_SENT.load(Ordering::Relaxed),
            frames_received: FRAMES_RECEIVED.load(Ordering::Relaxed),
            send_failures: SEND_FAILURES.load(Ordering::Relaxed),
            crc_failures: CRC_FAILURES.load(Ordering::Relaxed),
            connections_active: CONNECTIONS_ACTIVE.load(Ordering::Relaxed),
        }
    }
}

pub fn init_prometheus_exporter(
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    builder.with_http_listener(addr).install()?;

    metrics::describe_counter!("canopy_joins_accepted_total", "Joins absorbed by this node's cluster");
    metrics::describe_counter!(
        "canopy_joins_forwarded_total",
        "Join requests pushed to a leader or child cluster"
    );
    metrics::describe_counter!("canopy_cluster_splits_total", "Cluster splits performed");
    metrics::describe_counter!(
        "canopy_leader_conversions_total",
        "Times this node converted to cluster leader"
    );
    metrics::describe_counter!(
        "canopy_members_removed_total",
        "Members removed after crash detection"
    );
    metrics::describe_counter!("canopy_disconnects_total", "Terminal disconnections");
    metrics::describe_counter!("canopy_faults_total", "Protocol faults propagated to neighbors");
    metrics::describe_counter!("canopy_messages_originated_total", "Messages injected by callers");
    metrics::describe_counter!(
        "canopy_messages_delivered_total",
        "Messages surfaced to the application"
    );
    metrics::describe_counter!(
        "canopy_duplicates_suppressed_total",
        "Re-deliveries absorbed by stage caches"
    );
    metrics::describe_counter!("canopy_forward_retries_total", "Forwarding resends after timeout");
    metrics::describe_counter!("canopy_routing_bounces_total", "Routing-error replies received");
    metrics::describe_counter!(
        "canopy_failover_replays_total",
        "Messages replayed after a leader change"
    );
    metrics::describe_counter!("canopy_probes_sent_total", "Liveness probes sent");
    metrics::describe_counter!("canopy_probe_timeouts_total", "Peers declared unreachable by probes");
    metrics::describe_counter!("canopy_frames_sent_total", "Transport frames written");
    metrics::describe_counter!("canopy_frames_received_total", "Transport frames read");
    metrics::describe_counter!("canopy_send_failures_total", "Transport send failures");
    metrics::describe_counter!("canopy_crc_failures_total", "Frames rejected by CRC check");
    metrics::describe_gauge!("canopy_connections_active", "Open transport connections");

    Ok(())
}

pub fn export_to_prometheus() {
    let snapshot = MetricsSnapshot::capture();

    metrics::counter!("canopy_joins_accepted_total").absolute(snapshot.joins_accepted);
    metrics::counter!("canopy_joins_forwarded_total").absolute(snapshot.joins_forwarded);
    metrics::counter!("canopy_cluster_splits_total").absolute(snapshot.cluster_splits);
    metrics::counter!("canopy_leader_conversions_total").absolute(snapshot.leader_conversions);
    metrics::counter!("canopy_members_removed_total").absolute(snapshot.members_removed);
    metrics::counter!("canopy_disconnects_total").absolute(snapshot.disconnects);
    metrics::counter!("canopy_faults_total").absolute(snapshot.faults);
    metrics::counter!("canopy_messages_originated_total").absolute(snapshot.messages_originated);
    metrics::counter!("canopy_messages_delivered_total").absolute(snapshot.messages_delivered);
    metrics::counter!("canopy_duplicates_suppressed_total")
        .absolute(snapshot.duplicates_suppressed);
    metrics::counter!("canopy_forward_retries_total").absolute(snapshot.forward_retries);
    metrics::counter!("canopy_routing_bounces_total").absolute(snapshot.routing_bounces);
    metrics::counter!("canopy_failover_replays_total").absolute(snapshot.failover_replays);
    metrics::counter!("canopy_probes_sent_total").absolute(snapshot.probes_sent);
    metrics::counter!("canopy_probe_timeouts_total").absolute(snapshot.probe_timeouts);
    metrics::counter!("canopy_frames_sent_total").absolute(snapshot.frames_sent);
    metrics::counter!("canopy_frames_received_total").absolute(snapshot.frames_received);
    metrics::counter!("canopy_send_failures_total").absolute(snapshot.send_failures);
    metrics::counter!("canopy_crc_failures_total").absolute(snapshot.crc_failures);
    #[allow(clippy::cast_precision_loss)]
    metrics::gauge!("canopy_connections_active").set(snapshot.connections_active as f64);

    tracing::trace!(
        target: "canopy::metrics",
        delivered = snapshot.messages_delivered,
        retries = snapshot.forward_retries,
        "Exported metrics snapshot"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_monotonic() {
        let before = MetricsSnapshot::capture();
        increment_cluster_splits();
        increment_forward_retries(3);
        let after = MetricsSnapshot::capture();
        assert!(after.cluster_splits > before.cluster_splits);
        assert!(after.forward_retries >= before.forward_retries + 3);
    }

    #[test]
    fn test_connection_gauge_saturates() {
        // Other tests never touch this gauge, so it starts at zero here.
        decrement_connections();
        increment_connections();
        decrement_connections();
        decrement_connections();
        assert_eq!(CONNECTIONS_ACTIVE.load(Ordering::Relaxed), 0);
    }
}
