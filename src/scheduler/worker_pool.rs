//! Pool of workers sharing one task channel.
//!
//! Every worker runs as an independent async task with its own backend
//! connection opened through a [`Connector`]. Workers bootstrap the job
//! themselves; the backend's initialization claim guarantees exactly one
//! of them produces.
//!
//! # Features
//!
//! - Configurable number of workers
//! - Graceful shutdown with broadcast channel
//! - Abrupt termination of a single worker (`kill`) for fault drills
//! - Pool statistics tracking

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::backend::Connector;
use super::compute::ParamFunction;
use super::worker::{bootstrap_job, Worker, WorkerReport};
use crate::config::SweepConfig;
use crate::error::QueueError;

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// A worker's backend failed.
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// Pool is not running.
    #[error("Pool is not running")]
    NotRunning,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks to spawn.
    pub num_workers: usize,
    /// Worker ids are `{prefix}-{index}`.
    pub worker_prefix: String,
    /// Whether workers run the job bootstrap before consuming.
    pub bootstrap: bool,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            worker_prefix: "worker".to_string(),
            bootstrap: true,
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a new configuration with the specified number of workers.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    pub fn with_worker_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.worker_prefix = prefix.into();
        self
    }

    pub fn with_bootstrap(mut self, bootstrap: bool) -> Self {
        self.bootstrap = bootstrap;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Workers whose loop is currently running.
    pub active_workers: usize,
    /// Chunks completed and acknowledged.
    pub chunks_completed: u64,
    /// Failed chunk attempts.
    pub chunks_failed: u64,
    /// Average compute duration per attempt.
    pub average_chunk_duration: Duration,
    /// Chunks currently held by a worker.
    pub chunks_in_flight: usize,
}

impl PoolStats {
    /// Returns the total number of attempts (completed + failed).
    pub fn total_processed(&self) -> u64 {
        self.chunks_completed + self.chunks_failed
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.chunks_completed as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
#[derive(Debug, Default)]
pub(crate) struct SharedPoolStats {
    chunks_completed: AtomicU64,
    chunks_failed: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
    /// Chunk each busy worker holds, by worker id.
    in_flight: Mutex<BTreeMap<String, String>>,
}

impl SharedPoolStats {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_completion(&self, duration: Duration) {
        self.chunks_completed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    pub(crate) fn record_failure(&self, duration: Duration) {
        self.chunks_failed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    pub(crate) fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn begin_chunk(&self, worker_id: &str, chunk_id: &str) {
        self.lock_in_flight()
            .insert(worker_id.to_string(), chunk_id.to_string());
    }

    pub(crate) fn end_chunk(&self, worker_id: &str) {
        self.lock_in_flight().remove(worker_id);
    }

    fn in_flight(&self) -> BTreeMap<String, String> {
        self.lock_in_flight().clone()
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let completed = self.chunks_completed.load(Ordering::SeqCst);
        let failed = self.chunks_failed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);
        let active = self.active_workers.load(Ordering::SeqCst);
        let chunks_in_flight = self.lock_in_flight().len();

        let total = completed + failed;
        let average_duration = if total > 0 {
            Duration::from_millis(total_duration_ms / total)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: active as usize,
            chunks_completed: completed,
            chunks_failed: failed,
            average_chunk_duration: average_duration,
            chunks_in_flight,
        }
    }
}

/// How a pooled worker ended.
#[derive(Debug)]
pub enum WorkerOutcome {
    Finished(WorkerReport),
    Failed { worker_id: String, error: QueueError },
    Killed { worker_id: String },
}

impl WorkerOutcome {
    pub fn worker_id(&self) -> &str {
        match self {
            WorkerOutcome::Finished(report) => &report.worker_id,
            WorkerOutcome::Failed { worker_id, .. } | WorkerOutcome::Killed { worker_id } => {
                worker_id
            }
        }
    }
}

/// Everything the pool observed once all workers stopped.
#[derive(Debug)]
pub struct PoolReport {
    pub outcomes: Vec<WorkerOutcome>,
    pub stats: PoolStats,
}

impl PoolReport {
    pub fn finished(&self) -> impl Iterator<Item = &WorkerReport> {
        self.outcomes.iter().filter_map(|o| match o {
            WorkerOutcome::Finished(report) => Some(report),
            _ => None,
        })
    }

    /// First backend error any worker died with.
    pub fn first_error(&self) -> Option<&QueueError> {
        self.outcomes.iter().find_map(|o| match o {
            WorkerOutcome::Failed { error, .. } => Some(error),
            _ => None,
        })
    }
}

struct PooledWorker {
    id: String,
    handle: JoinHandle<Result<WorkerReport, QueueError>>,
}

/// Worker pool that manages multiple workers consuming one task channel.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    sweep: SweepConfig,
    connector: Connector,
    function: Arc<dyn ParamFunction>,
    shutdown_tx: broadcast::Sender<()>,
    workers: Vec<PooledWorker>,
    killed: Vec<String>,
    stats: Arc<SharedPoolStats>,
    is_running: AtomicBool,
}

impl WorkerPool {
    pub fn new(
        config: WorkerPoolConfig,
        sweep: SweepConfig,
        connector: Connector,
        function: Arc<dyn ParamFunction>,
    ) -> Self {
        // Buffer size of 1 is sufficient since we only send once
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            sweep,
            connector,
            function,
            shutdown_tx,
            workers: Vec::new(),
            killed: Vec::new(),
            stats: Arc::new(SharedPoolStats::new()),
            is_running: AtomicBool::new(false),
        }
    }

    /// Spawns all workers.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running.
    pub fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }

        for i in 0..self.config.num_workers {
            let id = format!("{}-{}", self.config.worker_prefix, i);
            let connector = self.connector.clone();
            let sweep = self.sweep.clone();
            let function = Arc::clone(&self.function);
            let shutdown_rx = self.shutdown_tx.subscribe();
            let stats = Arc::clone(&self.stats);
            let bootstrap = self.config.bootstrap;
            let worker_id = id.clone();

            let handle = tokio::spawn(async move {
                let backend = connector.connect().await?;
                if bootstrap {
                    bootstrap_job(Arc::clone(&backend), &sweep, &worker_id).await?;
                }
                Worker::new(worker_id, backend, function, &sweep)
                    .with_shutdown(shutdown_rx)
                    .with_stats(stats)
                    .run()
                    .await
            });

            self.workers.push(PooledWorker { id, handle });
        }

        self.is_running.store(true, Ordering::SeqCst);
        info!(
            num_workers = self.config.num_workers,
            backend = %self.connector.kind(),
            "Worker pool started"
        );
        Ok(())
    }

    /// Terminates one worker abruptly, as a crash would.
    ///
    /// The worker's connection is dropped wherever it happened to be; any
    /// task it held is recovered by the backend's own mechanism. Its gauges
    /// are released once the aborted task is dropped.
    pub fn kill(&mut self, worker_id: &str) -> bool {
        let Some(worker) = self.workers.iter().find(|w| w.id == worker_id) else {
            return false;
        };
        if worker.handle.is_finished() {
            return false;
        }
        worker.handle.abort();
        self.killed.push(worker_id.to_string());
        warn!(worker_id = %worker_id, "Worker killed");
        true
    }

    /// Waits for every worker to stop on its own (idle timeout, task limit).
    pub async fn wait(&mut self) -> Result<PoolReport, PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }
        let report = self.join_all().await;
        self.is_running.store(false, Ordering::SeqCst);
        Ok(report)
    }

    /// Signals every worker to stop after its current chunk and waits.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if workers don't stop within
    /// the configured timeout.
    pub async fn shutdown(&mut self) -> Result<PoolReport, PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!("Initiating worker pool shutdown");
        // Workers may have already stopped
        let _ = self.shutdown_tx.send(());

        let timeout = self.config.shutdown_timeout;
        let result = tokio::time::timeout(timeout, self.join_all()).await;
        self.is_running.store(false, Ordering::SeqCst);
        match result {
            Ok(report) => {
                info!("Worker pool shutdown complete");
                Ok(report)
            }
            Err(_) => Err(PoolError::ShutdownTimeout(timeout)),
        }
    }

    async fn join_all(&mut self) -> PoolReport {
        let mut outcomes = Vec::with_capacity(self.workers.len());
        for worker in self.workers.drain(..) {
            let outcome = match worker.handle.await {
                Ok(Ok(report)) => WorkerOutcome::Finished(report),
                Ok(Err(error)) => {
                    error!(worker_id = %worker.id, error = %error, "Worker failed");
                    WorkerOutcome::Failed {
                        worker_id: worker.id,
                        error,
                    }
                }
                Err(e) if e.is_cancelled() => WorkerOutcome::Killed {
                    worker_id: worker.id,
                },
                Err(e) => {
                    error!(worker_id = %worker.id, error = %e, "Worker task panicked");
                    WorkerOutcome::Failed {
                        error: QueueError::Protocol(format!("worker panicked: {}", e)),
                        worker_id: worker.id,
                    }
                }
            };
            outcomes.push(outcome);
        }
        PoolReport {
            outcomes,
            stats: self.stats(),
        }
    }

    /// A sender that stops every worker, e.g. from a signal handler.
    pub fn shutdown_signal(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.config.num_workers)
    }

    /// Returns whether the pool is currently running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Returns the number of workers in the pool.
    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }

    /// Workers whose task has not finished yet.
    pub fn live_workers(&self) -> usize {
        self.workers
            .iter()
            .filter(|w| !w.handle.is_finished())
            .count()
    }

    /// Chunk each busy worker currently holds, by worker id.
    pub fn in_flight(&self) -> BTreeMap<String, String> {
        self.stats.in_flight()
    }

    pub fn worker_ids(&self) -> Vec<String> {
        self.workers.iter().map(|w| w.id.clone()).collect()
    }

    pub fn killed(&self) -> &[String] {
        &self.killed
    }
}
