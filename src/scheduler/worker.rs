//! The worker consume loop and job bootstrap.
//!
//! # Lifecycle
//!
//! ```text
//! Idle ──dequeue──▶ Claimed ──decode──▶ Processing ──▶ Acked ──▶ Idle
//!                                          │
//!                                          └──▶ Failed ──▶ Idle
//!
//! any state ──(shutdown | idle timeout | max tasks)──▶ Stopped
//! ```
//!
//! A task is acknowledged only after its result has been enqueued. A
//! worker that dies between the two leaves the task recoverable, so the
//! worst case is one duplicate result, never a missing one.
//!
//! On compute failure a stream worker leaves the entry unacknowledged for
//! a sweeper to reclaim; a broker worker rejects it so the broker routes it
//! through the retry queue and eventually the dead-letter queue.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::backend::{BackendFamily, Delivery, QueueBackend, RejectOutcome};
use super::compute::{compute_chunk, ParamFunction};
use super::job::{ChunkResult, TaskChunk};
use super::producer::{ProduceReport, Producer};
use super::retry::Backoff;
use super::sweeper::{ReclaimSweeper, SweepReport};
use super::worker_pool::SharedPoolStats;
use crate::config::SweepConfig;
use crate::error::QueueError;
use crate::metrics::MetricsCollector;

/// Where a worker is in its processing cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Claimed,
    Processing,
    Acked,
    Failed,
    Stopped,
}

/// Why a worker stopped without error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    /// No task arrived within the idle timeout.
    IdleTimeout,
    /// A shutdown signal was received.
    Shutdown,
    /// The configured task limit was reached.
    MaxTasks,
    /// Fail-fast mode stopped on a compute failure.
    ComputeFailed { chunk_id: String },
}

impl WorkerExit {
    /// Process exit status reported to the orchestrator.
    pub fn exit_code(&self) -> u8 {
        match self {
            WorkerExit::IdleTimeout | WorkerExit::Shutdown | WorkerExit::MaxTasks => 0,
            WorkerExit::ComputeFailed { .. } => 70,
        }
    }
}

impl std::fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerExit::IdleTimeout => write!(f, "idle timeout"),
            WorkerExit::Shutdown => write!(f, "shutdown"),
            WorkerExit::MaxTasks => write!(f, "task limit reached"),
            WorkerExit::ComputeFailed { chunk_id } => {
                write!(f, "compute failed on {}", chunk_id)
            }
        }
    }
}

/// Summary of one worker run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    pub worker_id: String,
    pub exit: WorkerExit,
    /// Tasks whose result was published and acknowledged.
    pub completed: u64,
    /// Compute failures.
    pub failed: u64,
    /// Acks that found the task already settled elsewhere.
    pub stale_acks: u64,
    /// Undecodable or malformed task messages sent to the dead-letter channel.
    pub poison: u64,
    /// Recovery done by this worker's embedded sweeper.
    pub sweeps: SweepReport,
}

impl WorkerReport {
    fn new(worker_id: &str) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            exit: WorkerExit::IdleTimeout,
            completed: 0,
            failed: 0,
            stale_acks: 0,
            poison: 0,
            sweeps: SweepReport::default(),
        }
    }

    /// Tasks this worker took off the queue.
    pub fn handled(&self) -> u64 {
        self.completed + self.failed + self.poison
    }
}

/// Outcome of [`bootstrap_job`].
#[derive(Debug, Clone, PartialEq)]
pub enum BootstrapOutcome {
    /// This caller won the claim and enqueued the plan into an empty channel.
    Produced(ProduceReport),
    /// This caller took over from a claimant that died mid-produce and
    /// enqueued the full plan again next to `existing` leftover messages.
    Resumed { report: ProduceReport, existing: u64 },
    /// Another live worker holds the initialization claim.
    AlreadyClaimed,
    /// The job was fully enqueued earlier.
    AlreadyInitialized,
}

/// Creates both channels and, if this caller wins the initialization race,
/// plans and enqueues the job.
///
/// Safe to call from every worker at startup. The claim is a lease, so a
/// winner that dies before finishing leaves the job to the next caller;
/// the job is only marked initialized once every chunk is enqueued. A
/// takeover re-enqueues chunks the dead claimant may already have sent,
/// which positional chunk ids make harmless downstream.
pub async fn bootstrap_job(
    backend: Arc<dyn QueueBackend>,
    config: &SweepConfig,
    owner: &str,
) -> Result<BootstrapOutcome, QueueError> {
    for channel in [&config.task_channel, &config.results_channel] {
        match backend.initialize(channel, &config.group).await {
            Ok(()) => {}
            Err(e) if e.is_benign() => {
                debug!(channel = %channel, error = %e, "Channel already initialized")
            }
            Err(e) => return Err(e),
        }
    }

    let task_channel = config.task_channel.as_str();
    if backend.is_initialized(task_channel).await? {
        debug!(owner = %owner, "Job already initialized");
        return Ok(BootstrapOutcome::AlreadyInitialized);
    }
    if !backend
        .claim_initialization(task_channel, owner, config.worker.init_lease())
        .await?
    {
        debug!(owner = %owner, "Job initialization claimed by another worker");
        return Ok(BootstrapOutcome::AlreadyClaimed);
    }

    let depth = backend.channel_depth(task_channel).await?;
    let pending = backend.pending_count(task_channel, &config.group).await?;
    let existing = depth + pending;
    if existing > 0 {
        warn!(
            owner = %owner,
            depth = depth,
            pending = pending,
            "Resuming an interrupted initialization"
        );
    }

    let report = Producer::new(Arc::clone(&backend), task_channel)
        .with_backoff(config.retry.backoff())
        .plan_and_produce(config.total_parameters, config.chunk_size)
        .await?;
    backend.mark_initialized(task_channel).await?;
    info!(owner = %owner, enqueued = report.enqueued, "Job initialized");

    if existing > 0 {
        Ok(BootstrapOutcome::Resumed { report, existing })
    } else {
        Ok(BootstrapOutcome::Produced(report))
    }
}

/// Keeps the active-worker gauges raised for the lifetime of a run.
///
/// Dropping it lowers them, including when the worker's task is aborted.
struct ActiveGuard {
    metrics: MetricsCollector,
    stats: Option<Arc<SharedPoolStats>>,
}

impl ActiveGuard {
    fn new(metrics: MetricsCollector, stats: Option<Arc<SharedPoolStats>>) -> Self {
        metrics.worker_started();
        if let Some(stats) = &stats {
            stats.increment_active();
        }
        Self { metrics, stats }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.metrics.worker_stopped();
        if let Some(stats) = &self.stats {
            stats.decrement_active();
        }
    }
}

/// Marks one chunk as held by this worker until dropped.
struct InFlightGuard {
    metrics: MetricsCollector,
    stats: Option<Arc<SharedPoolStats>>,
    worker_id: String,
}

impl InFlightGuard {
    fn new(
        metrics: MetricsCollector,
        stats: Option<Arc<SharedPoolStats>>,
        worker_id: &str,
        chunk_id: &str,
    ) -> Self {
        metrics.inc_jobs_in_progress();
        if let Some(stats) = &stats {
            stats.begin_chunk(worker_id, chunk_id);
        }
        Self {
            metrics,
            stats,
            worker_id: worker_id.to_string(),
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.metrics.dec_jobs_in_progress();
        if let Some(stats) = &self.stats {
            stats.end_chunk(&self.worker_id);
        }
    }
}

/// A single consumer of the task channel.
pub struct Worker {
    id: String,
    backend: Arc<dyn QueueBackend>,
    function: Arc<dyn ParamFunction>,
    config: SweepConfig,
    backoff: Backoff,
    sweeper: Option<ReclaimSweeper>,
    shutdown_rx: Option<broadcast::Receiver<()>>,
    stats: Option<Arc<SharedPoolStats>>,
    metrics: MetricsCollector,
    state: WorkerState,
}

impl Worker {
    /// Creates a worker that owns `backend`.
    ///
    /// Stream-family workers embed a sweeper so no separate sweeper process
    /// is required.
    pub fn new(
        id: impl Into<String>,
        backend: Arc<dyn QueueBackend>,
        function: Arc<dyn ParamFunction>,
        config: &SweepConfig,
    ) -> Self {
        let id = id.into();
        let sweeper = (backend.kind().family() == BackendFamily::Stream)
            .then(|| ReclaimSweeper::new(Arc::clone(&backend), config, id.clone()));

        Self {
            id,
            backend,
            function,
            config: config.clone(),
            backoff: config.retry.backoff(),
            sweeper,
            shutdown_rx: None,
            stats: None,
            metrics: MetricsCollector::new(),
            state: WorkerState::Idle,
        }
    }

    pub fn with_shutdown(mut self, shutdown_rx: broadcast::Receiver<()>) -> Self {
        self.shutdown_rx = Some(shutdown_rx);
        self
    }

    pub(crate) fn with_stats(mut self, stats: Arc<SharedPoolStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Disables the embedded sweeper, e.g. when a standalone sweeper runs.
    pub fn without_sweeper(mut self) -> Self {
        self.sweeper = None;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    fn shutdown_requested(&mut self) -> bool {
        let Some(rx) = self.shutdown_rx.as_mut() else {
            return false;
        };
        !matches!(rx.try_recv(), Err(broadcast::error::TryRecvError::Empty))
    }

    /// Main worker loop.
    ///
    /// Returns a report on a clean stop. Errors are backend failures that
    /// outlived the retry budget, or non-transient protocol errors.
    pub async fn run(mut self) -> Result<WorkerReport, QueueError> {
        info!(worker_id = %self.id, backend = %self.backend.kind(), "Worker started");
        let active = ActiveGuard::new(self.metrics.clone(), self.stats.clone());

        let result = self.consume().await;

        self.state = WorkerState::Stopped;
        drop(active);

        match &result {
            Ok(report) => info!(
                worker_id = %self.id,
                exit = %report.exit,
                completed = report.completed,
                failed = report.failed,
                "Worker stopped"
            ),
            Err(e) => error!(worker_id = %self.id, error = %e, "Worker stopped on error"),
        }
        result
    }

    async fn consume(&mut self) -> Result<WorkerReport, QueueError> {
        let mut report = WorkerReport::new(&self.id);
        let idle_timeout = self.config.worker.idle_timeout();
        let block_timeout = self.config.worker.block_timeout();
        let mut idle_since = Instant::now();
        let mut last_sweep: Option<Instant> = None;

        loop {
            self.state = WorkerState::Idle;

            if self.shutdown_requested() {
                info!(worker_id = %self.id, "Worker received shutdown signal");
                report.exit = WorkerExit::Shutdown;
                return Ok(report);
            }
            if let Some(limit) = self.config.worker.max_tasks {
                if report.handled() >= limit {
                    report.exit = WorkerExit::MaxTasks;
                    return Ok(report);
                }
            }

            if let Some(sweeper) = &self.sweeper {
                let due = last_sweep.map_or(true, |at| at.elapsed() >= sweeper.sweep_interval());
                if due {
                    last_sweep = Some(Instant::now());
                    match sweeper.sweep_once().await {
                        Ok(sweep) => {
                            // Requeued entries are fresh work.
                            if sweep.requeued > 0 {
                                idle_since = Instant::now();
                            }
                            report.sweeps.absorb(sweep);
                        }
                        Err(e) if e.is_transient() => return Err(e),
                        Err(e) => warn!(worker_id = %self.id, error = %e, "Sweep failed"),
                    }
                }
            }

            let idle_for = idle_since.elapsed();
            let mut wait = block_timeout;
            if idle_for >= idle_timeout {
                let pending = self.unsettled_elsewhere().await?;
                if pending == 0 {
                    info!(
                        worker_id = %self.id,
                        idle_ms = idle_for.as_millis() as u64,
                        "No task within idle timeout"
                    );
                    report.exit = WorkerExit::IdleTimeout;
                    return Ok(report);
                }
                debug!(
                    worker_id = %self.id,
                    pending = pending,
                    "Idle but entries are still pending, waiting for reclamation"
                );
            } else {
                wait = wait.min(idle_timeout - idle_for);
            }
            if let (Some(sweeper), Some(at)) = (&self.sweeper, last_sweep) {
                let until_sweep = sweeper.sweep_interval().saturating_sub(at.elapsed());
                wait = wait.min(until_sweep.max(Duration::from_millis(1)));
            }

            let delivery = {
                let backend = &self.backend;
                let (channel, group, consumer) = (
                    self.config.task_channel.as_str(),
                    self.config.group.as_str(),
                    self.id.as_str(),
                );
                self.backoff
                    .retry("dequeue", move || {
                        backend.dequeue(channel, group, consumer, wait)
                    })
                    .await?
            };

            let Some(delivery) = delivery else {
                continue;
            };

            self.state = WorkerState::Claimed;
            if let Some(exit) = self.process(delivery, &mut report).await? {
                report.exit = exit;
                return Ok(report);
            }
            idle_since = Instant::now();
        }
    }

    /// Handles one claimed task. Returns an exit reason in fail-fast mode.
    async fn process(
        &mut self,
        delivery: Delivery,
        report: &mut WorkerReport,
    ) -> Result<Option<WorkerExit>, QueueError> {
        let chunk = match delivery.decode::<TaskChunk>() {
            Ok(chunk) if chunk.is_well_formed() => chunk,
            Ok(chunk) => {
                warn!(
                    worker_id = %self.id,
                    chunk_id = %chunk.chunk_id,
                    "Malformed chunk range, dead-lettering"
                );
                self.dead_letter_poison(&delivery).await?;
                report.poison += 1;
                return Ok(None);
            }
            Err(e) => {
                warn!(
                    worker_id = %self.id,
                    message_id = %delivery.message_id,
                    error = %e,
                    "Undecodable task payload, dead-lettering"
                );
                self.dead_letter_poison(&delivery).await?;
                report.poison += 1;
                return Ok(None);
            }
        };

        info!(
            worker_id = %self.id,
            chunk_id = %chunk.chunk_id,
            attempt = delivery.attempt,
            redelivered = delivery.redelivered,
            "Processing chunk"
        );

        self.state = WorkerState::Processing;
        let _in_flight = InFlightGuard::new(
            self.metrics.clone(),
            self.stats.clone(),
            &self.id,
            &chunk.chunk_id,
        );
        let started = Instant::now();
        let computed = compute_chunk(Arc::clone(&self.function), &chunk).await;
        let duration = started.elapsed();

        match computed {
            Ok(summary) => {
                let result =
                    ChunkResult::complete(&chunk, &self.id, summary, duration.as_secs_f64());
                self.publish(&result).await?;

                let acked = self.acknowledge(&delivery).await?;
                if !acked {
                    report.stale_acks += 1;
                    debug!(
                        worker_id = %self.id,
                        chunk_id = %chunk.chunk_id,
                        "Task was already settled elsewhere; result is a duplicate"
                    );
                }

                self.state = WorkerState::Acked;
                report.completed += 1;
                self.metrics.record_chunk("complete", duration.as_secs_f64());
                if let Some(stats) = &self.stats {
                    stats.record_completion(duration);
                }
                debug!(
                    worker_id = %self.id,
                    chunk_id = %chunk.chunk_id,
                    sum = result.result_summary.sum,
                    duration_ms = duration.as_millis() as u64,
                    "Chunk completed"
                );
                Ok(None)
            }
            Err(compute_err) => {
                self.state = WorkerState::Failed;
                report.failed += 1;
                if let Some(stats) = &self.stats {
                    stats.record_failure(duration);
                }
                let failure = QueueError::ComputeFailure {
                    chunk_id: chunk.chunk_id.clone(),
                    reason: compute_err.to_string(),
                };
                warn!(worker_id = %self.id, error = %failure, "Chunk attempt failed");

                let record = ChunkResult::failed(&chunk, &self.id, duration.as_secs_f64());
                self.publish(&record).await?;

                let status = self.settle_failure(&chunk, &delivery).await?;
                self.metrics.record_chunk(status, duration.as_secs_f64());

                if self.config.worker.fail_fast {
                    return Ok(Some(WorkerExit::ComputeFailed {
                        chunk_id: chunk.chunk_id,
                    }));
                }
                Ok(None)
            }
        }
    }

    /// Stream entries still claimed by some consumer of the group.
    ///
    /// Always zero on brokers, which return a dead consumer's deliveries
    /// to the queue by themselves.
    async fn unsettled_elsewhere(&self) -> Result<u64, QueueError> {
        if self.backend.kind().family() != BackendFamily::Stream {
            return Ok(0);
        }
        let backend = &self.backend;
        let (channel, group) = (
            self.config.task_channel.as_str(),
            self.config.group.as_str(),
        );
        self.backoff
            .retry("pending_count", move || backend.pending_count(channel, group))
            .await
    }

    /// Routes a failed attempt according to the backend family.
    async fn settle_failure(
        &self,
        chunk: &TaskChunk,
        delivery: &Delivery,
    ) -> Result<&'static str, QueueError> {
        match self.backend.kind().family() {
            BackendFamily::Stream => {
                debug!(
                    worker_id = %self.id,
                    chunk_id = %chunk.chunk_id,
                    "Leaving entry pending for reclamation"
                );
                Ok("failed")
            }
            BackendFamily::Broker => {
                match self
                    .backend
                    .reject(&self.config.task_channel, &delivery.handle, true)
                    .await
                {
                    Ok(RejectOutcome::Requeued { attempt }) => {
                        debug!(
                            worker_id = %self.id,
                            chunk_id = %chunk.chunk_id,
                            attempt = attempt,
                            "Chunk routed to retry"
                        );
                        Ok("requeued")
                    }
                    Ok(RejectOutcome::DeadLettered { attempt }) => {
                        let exhausted = QueueError::RetriesExhausted {
                            chunk_id: chunk.chunk_id.clone(),
                            attempts: attempt,
                        };
                        warn!(worker_id = %self.id, error = %exhausted, "Chunk dead-lettered");
                        Ok("dead_lettered")
                    }
                    Err(e) if e.is_benign() => {
                        debug!(worker_id = %self.id, error = %e, "Reject on settled delivery");
                        Ok("failed")
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Moves a message that can never be processed out of the task channel.
    async fn dead_letter_poison(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let channel = self.config.task_channel.as_str();
        match self.backend.kind().family() {
            BackendFamily::Broker => {
                match self.backend.reject(channel, &delivery.handle, false).await {
                    Ok(_) => {}
                    Err(e) if e.is_benign() => {}
                    Err(e) => return Err(e),
                }
            }
            BackendFamily::Stream => {
                let dead = self.backend.dead_letter_channel(channel);
                let envelope = delivery.envelope(delivery.attempt);
                let backend = &self.backend;
                let (dead, envelope) = (dead.as_str(), &envelope);
                self.backoff
                    .retry("dead_letter", move || backend.enqueue_envelope(dead, envelope))
                    .await?;
                self.acknowledge(delivery).await?;
            }
        }
        self.metrics.record_chunk("dead_lettered", 0.0);
        Ok(())
    }

    async fn publish(&self, result: &ChunkResult) -> Result<(), QueueError> {
        let payload = result.to_payload()?;
        let backend = &self.backend;
        let channel = self.config.results_channel.as_str();
        let payload = payload.as_slice();
        self.backoff
            .retry("publish_result", move || backend.enqueue(channel, payload))
            .await?;
        Ok(())
    }

    async fn acknowledge(&self, delivery: &Delivery) -> Result<bool, QueueError> {
        let backend = &self.backend;
        let (channel, group) = (
            self.config.task_channel.as_str(),
            self.config.group.as_str(),
        );
        let handle = &delivery.handle;
        self.backoff
            .retry("acknowledge", move || backend.acknowledge(channel, group, handle))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::backend::{BackendKind, Connector, MemoryBroker, MemoryStream};
    use crate::scheduler::compute::{FailOn, SquareFunction};
    use crate::scheduler::job::{ChunkResult, ResultStatus};
    use crate::scheduler::planner::plan;

    const WAIT: Duration = Duration::from_millis(10);

    fn test_config(kind: BackendKind) -> SweepConfig {
        SweepConfig::default()
            .with_backend(kind)
            .with_job(100, 10)
            .with_idle_timeout(Duration::from_millis(100))
            .with_block_timeout(Duration::from_millis(20))
            .with_staleness(Duration::from_secs(60), Duration::from_millis(20))
            .with_broker_retries(2, Duration::ZERO)
    }

    async fn results(backend: &Arc<dyn QueueBackend>, config: &SweepConfig) -> Vec<ChunkResult> {
        let mut out = Vec::new();
        while let Some(delivery) = backend
            .dequeue(&config.results_channel, &config.group, "reader", WAIT)
            .await
            .expect("dequeue")
        {
            out.push(delivery.decode().expect("decode"));
        }
        out
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(WorkerExit::IdleTimeout.exit_code(), 0);
        assert_eq!(WorkerExit::Shutdown.exit_code(), 0);
        assert_eq!(WorkerExit::MaxTasks.exit_code(), 0);
        assert_eq!(
            WorkerExit::ComputeFailed {
                chunk_id: "chunk_000001".into()
            }
            .exit_code(),
            70
        );
    }

    #[tokio::test]
    async fn test_bootstrap_produces_once() {
        let config = test_config(BackendKind::MemoryStream);
        let stream = MemoryStream::new();
        let a: Arc<dyn QueueBackend> = Arc::new(stream.connect());
        let b: Arc<dyn QueueBackend> = Arc::new(stream.connect());

        let (ra, rb) = tokio::join!(
            bootstrap_job(Arc::clone(&a), &config, "worker-a"),
            bootstrap_job(Arc::clone(&b), &config, "worker-b"),
        );
        let outcomes = [ra.expect("bootstrap a"), rb.expect("bootstrap b")];

        let produced = outcomes
            .iter()
            .filter(|o| matches!(o, BootstrapOutcome::Produced(_)))
            .count();
        assert_eq!(produced, 1);
        assert_eq!(a.channel_depth(&config.task_channel).await.expect("depth"), 10);
    }

    #[tokio::test]
    async fn test_bootstrap_after_initialization_is_noop() {
        let config = test_config(BackendKind::MemoryBroker);
        let broker = MemoryBroker::new(2, Duration::ZERO);
        let first: Arc<dyn QueueBackend> = Arc::new(broker.connect());
        let late: Arc<dyn QueueBackend> = Arc::new(broker.connect());

        let outcome = bootstrap_job(Arc::clone(&first), &config, "worker-a")
            .await
            .expect("bootstrap");
        assert!(matches!(outcome, BootstrapOutcome::Produced(_)));
        drop(first);

        let outcome = bootstrap_job(Arc::clone(&late), &config, "worker-b")
            .await
            .expect("bootstrap");
        assert_eq!(outcome, BootstrapOutcome::AlreadyInitialized);
        assert_eq!(late.channel_depth(&config.task_channel).await.expect("depth"), 10);
    }

    #[tokio::test]
    async fn test_bootstrap_recovers_from_crashed_claimant() {
        for kind in [BackendKind::MemoryStream, BackendKind::MemoryBroker] {
            let config = test_config(kind).with_init_lease(Duration::from_millis(50));
            let connector = Connector::from_config(&config);

            let doomed = connector.connect().await.expect("connect");
            assert!(doomed
                .claim_initialization(&config.task_channel, "doomed", config.worker.init_lease())
                .await
                .expect("claim"));
            drop(doomed);
            tokio::time::sleep(Duration::from_millis(100)).await;

            let survivor = connector.connect().await.expect("connect");
            let outcome = bootstrap_job(Arc::clone(&survivor), &config, "survivor")
                .await
                .expect("bootstrap");

            assert!(
                matches!(outcome, BootstrapOutcome::Produced(_)),
                "{} left the job unpopulated: {:?}",
                kind,
                outcome
            );
            assert_eq!(
                survivor.channel_depth(&config.task_channel).await.expect("depth"),
                10
            );
            assert!(survivor
                .is_initialized(&config.task_channel)
                .await
                .expect("initialized"));
        }
    }

    #[tokio::test]
    async fn test_bootstrap_resumes_partial_produce() {
        let config = test_config(BackendKind::MemoryStream).with_init_lease(Duration::from_millis(50));
        let stream = MemoryStream::new();

        let doomed: Arc<dyn QueueBackend> = Arc::new(stream.connect());
        doomed
            .initialize(&config.task_channel, &config.group)
            .await
            .expect("init");
        assert!(doomed
            .claim_initialization(&config.task_channel, "doomed", config.worker.init_lease())
            .await
            .expect("claim"));
        let chunks = plan(config.total_parameters, config.chunk_size).expect("plan");
        Producer::new(Arc::clone(&doomed), config.task_channel.clone())
            .produce(&chunks[..4])
            .await
            .expect("partial produce");
        drop(doomed);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let survivor: Arc<dyn QueueBackend> = Arc::new(stream.connect());
        let outcome = bootstrap_job(Arc::clone(&survivor), &config, "survivor")
            .await
            .expect("bootstrap");

        match outcome {
            BootstrapOutcome::Resumed { report, existing } => {
                assert_eq!(existing, 4);
                assert_eq!(report.enqueued, 10);
            }
            other => panic!("expected a resumed initialization, got {:?}", other),
        }
        assert_eq!(
            survivor.channel_depth(&config.task_channel).await.expect("depth"),
            14
        );
    }

    /// Default timings scaled down a hundredfold.
    fn scaled_defaults(kind: BackendKind) -> SweepConfig {
        let defaults = SweepConfig::default();
        SweepConfig::default()
            .with_backend(kind)
            .with_job(20, 10)
            .with_staleness(
                Duration::from_millis(defaults.stream.staleness_threshold_ms / 100),
                Duration::from_millis(defaults.stream.sweep_interval_ms / 100),
            )
            .with_idle_timeout(Duration::from_millis(defaults.worker.idle_timeout_ms / 100))
            .with_block_timeout(Duration::from_millis(defaults.worker.block_timeout_ms / 100))
    }

    /// Acks `chunk_000000`, claims `chunk_000001`, then disappears.
    async fn crash_holding_second_chunk(stream: &MemoryStream, config: &SweepConfig) {
        let doomed: Arc<dyn QueueBackend> = Arc::new(stream.connect());
        bootstrap_job(Arc::clone(&doomed), config, "doomed")
            .await
            .expect("bootstrap");

        let first = doomed
            .dequeue(&config.task_channel, &config.group, "doomed", WAIT)
            .await
            .expect("dequeue")
            .expect("first chunk");
        let chunk: TaskChunk = first.decode().expect("decode");
        let summary = SquareFunction::new()
            .compute_range(chunk.start_param, chunk.end_param)
            .expect("compute");
        let result = ChunkResult::complete(&chunk, "doomed", summary, 0.0);
        doomed
            .enqueue(&config.results_channel, &result.to_payload().expect("payload"))
            .await
            .expect("publish");
        assert!(doomed
            .acknowledge(&config.task_channel, &config.group, &first.handle)
            .await
            .expect("ack"));

        let second = doomed
            .dequeue(&config.task_channel, &config.group, "doomed", WAIT)
            .await
            .expect("dequeue")
            .expect("second chunk");
        assert_eq!(second.decode::<TaskChunk>().expect("decode").chunk_id, "chunk_000001");
    }

    #[tokio::test]
    async fn test_survivor_recovers_crashed_claim_with_default_timings() {
        let config = scaled_defaults(BackendKind::MemoryStream);
        config.validate().expect("scaled defaults are valid");
        let stream = MemoryStream::new();
        crash_holding_second_chunk(&stream, &config).await;

        let survivor: Arc<dyn QueueBackend> = Arc::new(stream.connect());
        let report = Worker::new(
            "survivor",
            Arc::clone(&survivor),
            Arc::new(SquareFunction::new()),
            &config,
        )
        .run()
        .await
        .expect("run");

        assert_eq!(report.exit, WorkerExit::IdleTimeout);
        assert_eq!(report.completed, 1);
        assert_eq!(report.sweeps.requeued, 1);
        assert_eq!(
            survivor
                .pending_count(&config.task_channel, &config.group)
                .await
                .expect("pending"),
            0
        );
    }

    #[tokio::test]
    async fn test_idle_stream_worker_waits_for_pending_entries() {
        // Idle timeout shorter than the staleness threshold.
        let config = scaled_defaults(BackendKind::MemoryStream)
            .with_idle_timeout(Duration::from_millis(50));
        let stream = MemoryStream::new();
        crash_holding_second_chunk(&stream, &config).await;

        let report = Worker::new(
            "survivor",
            Arc::new(stream.connect()),
            Arc::new(SquareFunction::new()),
            &config,
        )
        .run()
        .await
        .expect("run");

        assert_eq!(report.exit, WorkerExit::IdleTimeout);
        assert_eq!(report.completed, 1, "worker gave up on a pending entry");
    }

    #[tokio::test]
    async fn test_worker_processes_all_chunks_then_idles_out() {
        let config = test_config(BackendKind::MemoryStream);
        let backend: Arc<dyn QueueBackend> = Arc::new(MemoryStream::new().connect());
        bootstrap_job(Arc::clone(&backend), &config, "w1")
            .await
            .expect("bootstrap");

        let worker = Worker::new(
            "w1",
            Arc::clone(&backend),
            Arc::new(SquareFunction::new()),
            &config,
        );
        let report = worker.run().await.expect("run");

        assert_eq!(report.exit, WorkerExit::IdleTimeout);
        assert_eq!(report.completed, 10);
        assert_eq!(
            backend
                .pending_count(&config.task_channel, &config.group)
                .await
                .expect("pending"),
            0
        );

        let results = results(&backend, &config).await;
        assert_eq!(results.len(), 10);
        assert!(results.iter().all(|r| r.status == ResultStatus::Complete));
        assert_eq!(results.iter().map(|r| r.params_processed).sum::<u64>(), 100);
    }

    #[tokio::test]
    async fn test_worker_stops_at_max_tasks() {
        let config = test_config(BackendKind::MemoryBroker).with_max_tasks(Some(3));
        let broker = MemoryBroker::new(2, Duration::ZERO);
        let backend: Arc<dyn QueueBackend> = Arc::new(broker.connect());
        bootstrap_job(Arc::clone(&backend), &config, "w1")
            .await
            .expect("bootstrap");

        let report = Worker::new("w1", backend, Arc::new(SquareFunction::new()), &config)
            .run()
            .await
            .expect("run");

        assert_eq!(report.exit, WorkerExit::MaxTasks);
        assert_eq!(report.completed, 3);
    }

    #[tokio::test]
    async fn test_worker_stops_on_shutdown() {
        let config = test_config(BackendKind::MemoryStream)
            .with_idle_timeout(Duration::from_secs(30));
        let backend: Arc<dyn QueueBackend> = Arc::new(MemoryStream::new().connect());
        backend
            .initialize(&config.task_channel, &config.group)
            .await
            .expect("init");
        let (tx, rx) = broadcast::channel(1);

        let worker = Worker::new("w1", backend, Arc::new(SquareFunction::new()), &config)
            .with_shutdown(rx);
        let handle = tokio::spawn(worker.run());
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(()).expect("send");

        let report = handle.await.expect("join").expect("run");
        assert_eq!(report.exit, WorkerExit::Shutdown);
    }

    #[tokio::test]
    async fn test_broker_compute_failure_rejects_until_dead_letter() {
        let config = test_config(BackendKind::MemoryBroker).with_job(10, 10);
        let broker = MemoryBroker::new(2, Duration::ZERO);
        let backend: Arc<dyn QueueBackend> = Arc::new(broker.connect());
        bootstrap_job(Arc::clone(&backend), &config, "w1")
            .await
            .expect("bootstrap");

        let function = Arc::new(FailOn::new(SquareFunction::new(), [3]));
        let report = Worker::new("w1", Arc::clone(&backend), function, &config)
            .run()
            .await
            .expect("run");

        // One first delivery plus max_retries redeliveries.
        assert_eq!(report.failed, 3);
        assert_eq!(report.completed, 0);
        assert_eq!(
            backend
                .dead_letter_count(&config.task_channel)
                .await
                .expect("dlq"),
            1
        );
        assert_eq!(
            backend.channel_depth(&config.task_channel).await.expect("depth"),
            0
        );

        let failures = results(&backend, &config).await;
        assert_eq!(failures.len(), 3);
        assert!(failures.iter().all(|r| r.status == ResultStatus::Failed));
    }

    #[tokio::test]
    async fn test_stream_compute_failure_leaves_entry_pending() {
        let config = test_config(BackendKind::MemoryStream)
            .with_job(10, 10)
            .with_fail_fast(true);
        let backend: Arc<dyn QueueBackend> = Arc::new(MemoryStream::new().connect());
        bootstrap_job(Arc::clone(&backend), &config, "w1")
            .await
            .expect("bootstrap");

        let function = Arc::new(FailOn::new(SquareFunction::new(), [0]));
        let report = Worker::new("w1", Arc::clone(&backend), function, &config)
            .run()
            .await
            .expect("run");

        assert_eq!(
            report.exit,
            WorkerExit::ComputeFailed {
                chunk_id: "chunk_000000".into()
            }
        );
        assert_eq!(
            backend
                .pending_count(&config.task_channel, &config.group)
                .await
                .expect("pending"),
            1
        );
    }

    #[tokio::test]
    async fn test_poison_message_is_dead_lettered() {
        for kind in [BackendKind::MemoryStream, BackendKind::MemoryBroker] {
            let config = test_config(kind);
            let backend: Arc<dyn QueueBackend> = match kind {
                BackendKind::MemoryStream => Arc::new(MemoryStream::new().connect()),
                _ => Arc::new(MemoryBroker::new(2, Duration::ZERO).connect()),
            };
            backend
                .initialize(&config.task_channel, &config.group)
                .await
                .expect("init");
            backend
                .enqueue(&config.task_channel, b"not json")
                .await
                .expect("enqueue");

            let function = Arc::new(SquareFunction::new());
            let report = Worker::new("w1", Arc::clone(&backend), function, &config)
                .run()
                .await
                .expect("run");

            assert_eq!(report.poison, 1, "{} should dead-letter poison", kind);
            assert_eq!(
                backend
                    .dead_letter_count(&config.task_channel)
                    .await
                    .expect("dead"),
                1
            );
            assert_eq!(
                backend
                    .pending_count(&config.task_channel, &config.group)
                    .await
                    .expect("pending"),
                0
            );
        }
    }
}
