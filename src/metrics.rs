//! # Pipeline Metrics
//!
//! A passive sink of counters. Every stage increments the counters it owns
//! with relaxed atomics; nothing in the pipeline reads them back to make a
//! decision. [`TsoMetrics::snapshot`] copies them into a plain struct for
//! reporting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Shared counters, one instance per [`Tso`](crate::api::Tso).
#[derive(Debug, Default)]
pub struct TsoMetrics {
    // Sequencing stage
    pub(crate) timestamps_issued: AtomicU64,
    pub(crate) commits: AtomicU64,
    pub(crate) conflict_aborts: AtomicU64,
    pub(crate) client_aborts: AtomicU64,
    pub(crate) commit_retries: AtomicU64,
    pub(crate) batches_closed: AtomicU64,
    pub(crate) entries_closed: AtomicU64,
    pub(crate) conflict_map_evictions: AtomicU64,
    pub(crate) expired_transactions: AtomicU64,

    // Persistence stage
    pub(crate) batches_persisted: AtomicU64,
    pub(crate) records_persisted: AtomicU64,
    pub(crate) persistence_failures: AtomicU64,
    pub(crate) persistence_micros: AtomicU64,

    // Reply stage
    pub(crate) batches_replied: AtomicU64,
    pub(crate) replies_dropped: AtomicU64,
    pub(crate) batches_buffered: AtomicU64,
    pub(crate) max_reorder_depth: AtomicU64,
    pub(crate) low_watermark_persists: AtomicU64,
    pub(crate) low_watermark_suppressed: AtomicU64,
    pub(crate) last_low_watermark: AtomicU64,
    pub(crate) request_micros: AtomicU64,
}

impl TsoMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    pub(crate) fn add_duration(counter: &AtomicU64, elapsed: Duration) {
        Self::add(counter, elapsed.as_micros() as u64);
    }

    pub(crate) fn set_max(counter: &AtomicU64, value: u64) {
        counter.fetch_max(value, Ordering::Relaxed);
    }

    pub(crate) fn set(counter: &AtomicU64, value: u64) {
        counter.store(value, Ordering::Relaxed);
    }

    /// Copies every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            timestamps_issued: get(&self.timestamps_issued),
            commits: get(&self.commits),
            conflict_aborts: get(&self.conflict_aborts),
            client_aborts: get(&self.client_aborts),
            commit_retries: get(&self.commit_retries),
            batches_closed: get(&self.batches_closed),
            entries_closed: get(&self.entries_closed),
            conflict_map_evictions: get(&self.conflict_map_evictions),
            expired_transactions: get(&self.expired_transactions),
            batches_persisted: get(&self.batches_persisted),
            records_persisted: get(&self.records_persisted),
            persistence_failures: get(&self.persistence_failures),
            persistence_time: Duration::from_micros(get(&self.persistence_micros)),
            batches_replied: get(&self.batches_replied),
            replies_dropped: get(&self.replies_dropped),
            batches_buffered: get(&self.batches_buffered),
            max_reorder_depth: get(&self.max_reorder_depth),
            low_watermark_persists: get(&self.low_watermark_persists),
            low_watermark_suppressed: get(&self.low_watermark_suppressed),
            last_low_watermark: get(&self.last_low_watermark),
            request_time: Duration::from_micros(get(&self.request_micros)),
        }
    }
}

/// A point-in-time copy of [`TsoMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub timestamps_issued: u64,
    pub commits: u64,
    pub conflict_aborts: u64,
    pub client_aborts: u64,
    pub commit_retries: u64,
    pub batches_closed: u64,
    pub entries_closed: u64,
    pub conflict_map_evictions: u64,
    pub expired_transactions: u64,
    pub batches_persisted: u64,
    pub records_persisted: u64,
    pub persistence_failures: u64,
    /// Cumulative time spent in commit-log appends.
    pub persistence_time: Duration,
    pub batches_replied: u64,
    /// Replies whose client had already disconnected.
    pub replies_dropped: u64,
    /// Completion events that arrived ahead of their turn.
    pub batches_buffered: u64,
    pub max_reorder_depth: u64,
    pub low_watermark_persists: u64,
    pub low_watermark_suppressed: u64,
    pub last_low_watermark: u64,
    /// Cumulative time from request decode to reply delivery.
    pub request_time: Duration,
}

impl MetricsSnapshot {
    /// Mean number of entries per closed batch.
    pub fn mean_batch_size(&self) -> f64 {
        if self.batches_closed == 0 {
            0.0
        } else {
            self.entries_closed as f64 / self.batches_closed as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_copies_counters() {
        let metrics = TsoMetrics::new();
        TsoMetrics::incr(&metrics.batches_closed);
        TsoMetrics::incr(&metrics.batches_closed);
        TsoMetrics::add(&metrics.entries_closed, 7);
        TsoMetrics::set_max(&metrics.max_reorder_depth, 3);
        TsoMetrics::set_max(&metrics.max_reorder_depth, 2);
        TsoMetrics::add_duration(&metrics.persistence_micros, Duration::from_millis(2));

        let snap = metrics.snapshot();
        assert_eq!(snap.batches_closed, 2);
        assert_eq!(snap.max_reorder_depth, 3);
        assert_eq!(snap.persistence_time, Duration::from_millis(2));
        assert!((snap.mean_batch_size() - 3.5).abs() < f64::EPSILON);
    }
}
