//! Bus metrics
//!
//! The bus reports two events: a message sent (dimensioned by address,
//! publish vs send, and whether delivery was local and/or remote) and a
//! message read off the wire (address and payload size). [`BusMetrics`]
//! is the sink interface; [`MetricsSink`] forwards to the `metrics`
//! facade, [`CountingMetrics`] keeps atomic counters for tests and
//! embedded introspection.

use std::sync::atomic::{AtomicU64, Ordering};

use metrics::counter;

/// Sink for bus-level metrics events
pub trait BusMetrics: Send + Sync {
    /// A message left the router.
    ///
    /// `local`/`remote` describe where it was dispatched; a publish
    /// reaching both this node and peers sets both.
    fn message_sent(&self, address: &str, publish: bool, local: bool, remote: bool);

    /// A data payload was decoded off the wire.
    fn message_read(&self, address: &str, bytes: usize);
}

/// Sink that emits dimensioned counters via the `metrics` facade
#[derive(Debug, Default)]
pub struct MetricsSink;

impl BusMetrics for MetricsSink {
    fn message_sent(&self, address: &str, publish: bool, local: bool, remote: bool) {
        counter!(
            "eventbus_messages_sent",
            "address" => address.to_string(),
            "publish" => publish.to_string(),
            "local" => local.to_string(),
            "remote" => remote.to_string()
        )
        .increment(1);
    }

    fn message_read(&self, address: &str, bytes: usize) {
        counter!(
            "eventbus_messages_read",
            "address" => address.to_string()
        )
        .increment(1);
        counter!(
            "eventbus_bytes_read",
            "address" => address.to_string()
        )
        .increment(bytes as u64);
    }
}

/// Sink that discards every event
#[derive(Debug, Default)]
pub struct NoopMetrics;

impl BusMetrics for NoopMetrics {
    fn message_sent(&self, _address: &str, _publish: bool, _local: bool, _remote: bool) {}

    fn message_read(&self, _address: &str, _bytes: usize) {}
}

/// Point-in-time view of [`CountingMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Sends dispatched locally only
    pub sent_local: u64,
    /// Sends dispatched to at least one peer
    pub sent_remote: u64,
    /// Messages decoded off the wire
    pub read: u64,
    /// Wire payload bytes decoded
    pub bytes_read: u64,
}

/// Sink backed by atomic counters
#[derive(Debug, Default)]
pub struct CountingMetrics {
    sent_local: AtomicU64,
    sent_remote: AtomicU64,
    read: AtomicU64,
    bytes_read: AtomicU64,
}

impl CountingMetrics {
    /// Create a zeroed counter set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot the current counter values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sent_local: self.sent_local.load(Ordering::Relaxed),
            sent_remote: self.sent_remote.load(Ordering::Relaxed),
            read: self.read.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
        }
    }
}

impl BusMetrics for CountingMetrics {
    fn message_sent(&self, _address: &str, _publish: bool, local: bool, remote: bool) {
        if local {
            self.sent_local.fetch_add(1, Ordering::Relaxed);
        }
        if remote {
            self.sent_remote.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn message_read(&self, _address: &str, bytes: usize) {
        self.read.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counting_metrics_tracks_dimensions() {
        let metrics = CountingMetrics::new();
        metrics.message_sent("a", false, true, false);
        metrics.message_sent("a", true, true, true);
        metrics.message_sent("b", false, false, true);
        metrics.message_read("a", 128);
        metrics.message_read("a", 64);

        let snap = metrics.snapshot();
        assert_eq!(snap.sent_local, 2);
        assert_eq!(snap.sent_remote, 2);
        assert_eq!(snap.read, 2);
        assert_eq!(snap.bytes_read, 192);
    }

    #[test]
    fn noop_metrics_accepts_events() {
        let metrics = NoopMetrics;
        metrics.message_sent("a", true, true, true);
        metrics.message_read("a", 1);
    }
}
