//! Prometheus metrics registration and export.
//!
//! Defines every metric sweepq records and provides functions for
//! initializing the registry and rendering it in text format.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all sweepq metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Chunk attempts finished by workers, labeled by outcome.
pub static CHUNKS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Time spent computing one chunk, in seconds.
pub static CHUNK_DURATION: OnceLock<Histogram> = OnceLock::new();

/// Messages stored in a channel, labeled by queue name.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Claimed but unacknowledged messages, labeled by queue name.
pub static PENDING_ENTRIES: OnceLock<GaugeVec> = OnceLock::new();

/// Messages parked in a dead-letter channel, labeled by source queue name.
pub static DEAD_LETTER_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Stale entries taken over by a sweeper.
pub static RECLAIMED_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Results discarded by the aggregator because the chunk was already folded.
pub static DUPLICATE_RESULTS: OnceLock<Counter> = OnceLock::new();

/// Number of running workers.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Number of chunks currently being computed.
pub static JOBS_IN_PROGRESS: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Later calls leave the first registry in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if a metric definition is invalid.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Chunk metrics
    let chunks_total = CounterVec::new(
        Opts::new("sweepq_chunks_total", "Chunk attempts finished by workers"),
        &["status"],
    )?;

    let chunk_duration = Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "sweepq_chunk_duration_seconds",
            "Chunk compute duration in seconds",
        )
        .buckets(vec![0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0]),
    )?;

    // Queue metrics
    let queue_depth = GaugeVec::new(
        Opts::new("sweepq_queue_depth", "Messages stored in a channel"),
        &["queue_name"],
    )?;

    let pending_entries = GaugeVec::new(
        Opts::new(
            "sweepq_pending_entries",
            "Claimed but unacknowledged messages",
        ),
        &["queue_name"],
    )?;

    let dead_letter_depth = GaugeVec::new(
        Opts::new(
            "sweepq_dead_letter_depth",
            "Messages parked in the dead-letter channel",
        ),
        &["queue_name"],
    )?;

    // Recovery metrics
    let reclaimed_total = Counter::new(
        "sweepq_reclaimed_total",
        "Stale entries taken over by a sweeper",
    )?;

    let duplicate_results = Counter::new(
        "sweepq_duplicate_results_total",
        "Results discarded as duplicates",
    )?;

    // Worker metrics
    let active_workers = Gauge::new("sweepq_active_workers", "Number of running workers")?;

    let jobs_in_progress = Gauge::new(
        "sweepq_jobs_in_progress",
        "Number of chunks currently being computed",
    )?;

    registry.register(Box::new(chunks_total.clone()))?;
    registry.register(Box::new(chunk_duration.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(pending_entries.clone()))?;
    registry.register(Box::new(dead_letter_depth.clone()))?;
    registry.register(Box::new(reclaimed_total.clone()))?;
    registry.register(Box::new(duplicate_results.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;
    registry.register(Box::new(jobs_in_progress.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = CHUNKS_TOTAL.set(chunks_total);
    let _ = CHUNK_DURATION.set(chunk_duration);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = PENDING_ENTRIES.set(pending_entries);
    let _ = DEAD_LETTER_DEPTH.set(dead_letter_depth);
    let _ = RECLAIMED_TOTAL.set(reclaimed_total);
    let _ = DUPLICATE_RESULTS.set(duplicate_results);
    let _ = ACTIVE_WORKERS.set(active_workers);
    let _ = JOBS_IN_PROGRESS.set(jobs_in_progress);

    tracing::debug!("Prometheus metrics initialized");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead when the registry is not initialized or
/// encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
