//! High-level metric recorders.
//!
//! `MetricsCollector` wraps the raw Prometheus metrics with the labels
//! sweepq uses. Every method is a no-op until `init_metrics()` has run, so
//! library code can record unconditionally.

use super::prometheus::{
    ACTIVE_WORKERS, CHUNKS_TOTAL, CHUNK_DURATION, DEAD_LETTER_DEPTH, DUPLICATE_RESULTS,
    JOBS_IN_PROGRESS, PENDING_ENTRIES, QUEUE_DEPTH, RECLAIMED_TOTAL,
};

/// Point-in-time view of one channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub queue_name: String,
    /// Messages stored in the channel.
    pub depth: u64,
    /// Claimed but unacknowledged.
    pub pending: u64,
    /// Messages in the paired dead-letter channel.
    pub dead_letter: u64,
}

impl QueueSnapshot {
    pub fn new(queue_name: impl Into<String>, depth: u64, pending: u64, dead_letter: u64) -> Self {
        Self {
            queue_name: queue_name.into(),
            depth,
            pending,
            dead_letter,
        }
    }
}

/// Records sweepq operational metrics.
///
/// ```ignore
/// use sweepq::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
/// collector.record_chunk("complete", 0.42);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record one finished chunk attempt.
    ///
    /// `status` is one of `complete`, `failed`, `requeued`, `dead_lettered`.
    pub fn record_chunk(&self, status: &str, duration_secs: f64) {
        if let Some(chunks_total) = CHUNKS_TOTAL.get() {
            chunks_total.with_label_values(&[status]).inc();
        }

        if let Some(chunk_duration) = CHUNK_DURATION.get() {
            chunk_duration.observe(duration_secs);
        }

        tracing::trace!(
            status = status,
            duration_secs = duration_secs,
            "Recorded chunk metric"
        );
    }

    /// Publish a channel snapshot to the queue gauges.
    pub fn record_queue(&self, snapshot: &QueueSnapshot) {
        let name = snapshot.queue_name.as_str();
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth.with_label_values(&[name]).set(snapshot.depth as f64);
        }
        if let Some(pending) = PENDING_ENTRIES.get() {
            pending.with_label_values(&[name]).set(snapshot.pending as f64);
        }
        if let Some(dead_letter) = DEAD_LETTER_DEPTH.get() {
            dead_letter
                .with_label_values(&[name])
                .set(snapshot.dead_letter as f64);
        }

        tracing::trace!(
            queue_name = name,
            depth = snapshot.depth,
            pending = snapshot.pending,
            dead_letter = snapshot.dead_letter,
            "Updated queue metrics"
        );
    }

    pub fn record_reclaimed(&self, count: usize) {
        if let Some(reclaimed) = RECLAIMED_TOTAL.get() {
            reclaimed.inc_by(count as f64);
        }
    }

    pub fn record_duplicate(&self) {
        if let Some(duplicates) = DUPLICATE_RESULTS.get() {
            duplicates.inc();
        }
    }

    pub fn worker_started(&self) {
        if let Some(active_workers) = ACTIVE_WORKERS.get() {
            active_workers.inc();
        }
    }

    pub fn worker_stopped(&self) {
        if let Some(active_workers) = ACTIVE_WORKERS.get() {
            active_workers.dec();
        }
    }

    pub fn inc_jobs_in_progress(&self) {
        if let Some(jobs_in_progress) = JOBS_IN_PROGRESS.get() {
            jobs_in_progress.inc();
        }
    }

    pub fn dec_jobs_in_progress(&self) {
        if let Some(jobs_in_progress) = JOBS_IN_PROGRESS.get() {
            jobs_in_progress.dec();
        }
    }
}
