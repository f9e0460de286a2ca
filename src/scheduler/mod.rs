//! Chunked parameter sweeps over a fault-tolerant task queue.
//!
//! - **planner**: splits `[0, N)` into deterministic, contiguous chunks
//! - **backend**: the [`QueueBackend`] contract with stream and broker families
//! - **Producer**: enqueues a plan onto the task channel
//! - **Worker**: dequeue, compute, publish result, acknowledge
//! - **ReclaimSweeper**: moves stale stream entries back to the tail
//! - **Aggregator**: folds results, deduplicating by chunk id
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │   Producer   │
//!                      │ (bootstrap)  │
//!                      └──────┬───────┘
//!                             │ tasks
//!                      ┌──────▼───────┐
//!                      │   Backend    │◀──── sweeper (stream only)
//!                      └──────┬───────┘
//!         ┌───────────────────┼───────────────────┐
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Worker 1│         │ Worker 2│         │ Worker N│
//!    └────┬────┘         └────┬────┘         └────┬────┘
//!         └───────────────────┼───────────────────┘
//!                             │ results
//!                      ┌──────▼───────┐
//!                      │  Aggregator  │
//!                      └──────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use sweepq::config::SweepConfig;
//! use sweepq::scheduler::{Connector, SquareFunction, WorkerPool, WorkerPoolConfig};
//!
//! let config = SweepConfig::load("sweepq.yaml")?;
//! let connector = Connector::from_config(&config);
//!
//! let mut pool = WorkerPool::new(
//!     WorkerPoolConfig::new(4),
//!     config,
//!     connector,
//!     Arc::new(SquareFunction::new()),
//! );
//! pool.start()?;
//! let report = pool.wait().await?;
//! ```
//!
//! # Reliability
//!
//! - **At-least-once**: a task is acknowledged only after its result is enqueued
//! - **Crash recovery**: stream entries are reclaimed by sweepers; broker
//!   deliveries are requeued when the connection drops
//! - **Bounded retries**: both families end in a dead-letter channel
//! - **Duplicate safety**: the aggregator keeps the first result per chunk

pub mod aggregator;
pub mod backend;
pub mod compute;
pub mod job;
pub mod planner;
pub mod producer;
pub mod retry;
pub mod sweeper;
pub mod worker;
pub mod worker_pool;

pub use aggregator::{aggregate, AggregateReport, Aggregator, FoldOutcome};
pub use backend::{
    BackendFamily, BackendKind, Connector, Delivery, DeliveryHandle, Envelope, QueueBackend,
    RejectOutcome,
};
pub use compute::{compute_chunk, FailOn, ParamFunction, SquareFunction};
pub use job::{ChunkResult, ResultStatus, ResultSummary, TaskChunk};
pub use producer::{ProduceReport, Producer};
pub use retry::Backoff;
pub use sweeper::{ReclaimSweeper, SweepReport};
pub use worker::{bootstrap_job, BootstrapOutcome, Worker, WorkerExit, WorkerReport, WorkerState};
pub use worker_pool::{
    PoolError, PoolReport, PoolStats, WorkerOutcome, WorkerPool, WorkerPoolConfig,
};

pub use crate::error::{ComputeError, QueueError};
