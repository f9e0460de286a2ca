//! Prometheus metrics for queue, worker and recovery activity.
//!
//! # Example
//!
//! ```ignore
//! use sweepq::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_chunk("complete", 0.8);
//!
//! println!("{}", export_metrics());
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::{MetricsCollector, QueueSnapshot};
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    ACTIVE_WORKERS, CHUNKS_TOTAL, CHUNK_DURATION, DEAD_LETTER_DEPTH, DUPLICATE_RESULTS,
    JOBS_IN_PROGRESS, PENDING_ENTRIES, QUEUE_DEPTH, RECLAIMED_TOTAL, REGISTRY,
};
