//! Counters for one end of a stream session.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::broadcast;

#[derive(Debug, Default)]
pub struct StreamMetrics {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    events_sent: AtomicU64,
    events_received: AtomicU64,
    acks_sent: AtomicU64,
    nacks_sent: AtomicU64,
    retransmits: AtomicU64,
    sequence_gaps: AtomicU64,
    fragments_rejected: AtomicU64,
}

/// Point-in-time copy of [`StreamMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub events_sent: u64,
    pub events_received: u64,
    pub acks_sent: u64,
    pub nacks_sent: u64,
    /// Frames re-sent in answer to a nack.
    pub retransmits: u64,
    /// Sequence numbers given up on after the reorder buffer overflowed.
    pub sequence_gaps: u64,
    /// Fragments refused as malformed or over the fragment-count limit.
    pub fragments_rejected: u64,
}

impl StreamMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_bytes_sent(&self, n: usize) {
        self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn add_bytes_received(&self, n: usize) {
        self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn event_sent(&self) {
        self.events_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn event_received(&self) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ack_sent(&self) {
        self.acks_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn nack_sent(&self) {
        self.nacks_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_retransmits(&self, n: usize) {
        self.retransmits.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn add_sequence_gaps(&self, n: u64) {
        self.sequence_gaps.fetch_add(n, Ordering::Relaxed);
    }

    pub fn fragment_rejected(&self) {
        self.fragments_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            events_sent: self.events_sent.load(Ordering::Relaxed),
            events_received: self.events_received.load(Ordering::Relaxed),
            acks_sent: self.acks_sent.load(Ordering::Relaxed),
            nacks_sent: self.nacks_sent.load(Ordering::Relaxed),
            retransmits: self.retransmits.load(Ordering::Relaxed),
            sequence_gaps: self.sequence_gaps.load(Ordering::Relaxed),
            fragments_rejected: self.fragments_rejected.load(Ordering::Relaxed),
        }
    }

    pub fn log_stats(&self, label: &str) {
        let s = self.snapshot();
        tracing::info!(
            stream = label,
            bytes_sent = s.bytes_sent,
            bytes_received = s.bytes_received,
            events_sent = s.events_sent,
            events_received = s.events_received,
            acks_sent = s.acks_sent,
            nacks_sent = s.nacks_sent,
            retransmits = s.retransmits,
            sequence_gaps = s.sequence_gaps,
            fragments_rejected = s.fragments_rejected,
            "stream stats"
        );
    }
}

/// Log `metrics` every `interval` until shutdown.
pub async fn stats_loop(
    metrics: std::sync::Arc<StreamMetrics>,
    label: String,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = ticker.tick() => metrics.log_stats(&label),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let m = StreamMetrics::new();
        m.add_bytes_sent(32);
        m.add_bytes_sent(16);
        m.event_sent();
        m.nack_sent();
        m.add_retransmits(3);
        m.add_sequence_gaps(2);

        let s = m.snapshot();
        assert_eq!(s.bytes_sent, 48);
        assert_eq!(s.events_sent, 1);
        assert_eq!(s.nacks_sent, 1);
        assert_eq!(s.retransmits, 3);
        assert_eq!(s.sequence_gaps, 2);
        assert_eq!(s.acks_sent, 0);
    }
}
