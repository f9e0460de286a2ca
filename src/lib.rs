//! sweepq: fault-tolerant distributed parameter sweeps.
//!
//! This library splits a parameter range into chunks, distributes them over
//! Redis Streams or an AMQP broker, and folds the results exactly once per
//! chunk despite worker crashes and redeliveries.

pub mod cli;
pub mod config;
pub mod error;
pub mod metrics;
pub mod scheduler;

// Re-export commonly used error types
pub use error::{ComputeError, ConfigError, QueueError};
