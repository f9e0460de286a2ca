//! Staleness-based recovery for stream backends.
//!
//! A sweep claims every entry idle longer than the staleness threshold,
//! then for each one either re-appends it to the tail of the task channel
//! with its attempt counter incremented, or, once the counter exceeds
//! `max_reclaims`, moves it to the dead stream. The claimed original is
//! acknowledged afterwards, so a sweeper crash mid-sweep leaves the entry
//! pending under the sweeper's id where the next sweep finds it again.
//!
//! Claiming is atomic in the backend: two sweepers racing on the same
//! entry never both obtain it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::backend::QueueBackend;
use super::retry::Backoff;
use crate::config::SweepConfig;
use crate::error::QueueError;
use crate::metrics::MetricsCollector;

/// Counts from one or more sweeps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Entries claimed from dead or stalled consumers.
    pub reclaimed: usize,
    /// Entries re-appended to the task channel.
    pub requeued: usize,
    /// Entries moved to the dead stream.
    pub dead_lettered: usize,
}

impl SweepReport {
    pub(crate) fn absorb(&mut self, other: SweepReport) {
        self.reclaimed += other.reclaimed;
        self.requeued += other.requeued;
        self.dead_lettered += other.dead_lettered;
    }
}

/// Reclaims stale entries from one consumer group.
pub struct ReclaimSweeper {
    backend: Arc<dyn QueueBackend>,
    channel: String,
    group: String,
    consumer_id: String,
    staleness: Duration,
    sweep_interval: Duration,
    max_reclaims: u32,
    batch: usize,
    backoff: Backoff,
    metrics: MetricsCollector,
}

impl ReclaimSweeper {
    pub fn new(
        backend: Arc<dyn QueueBackend>,
        config: &SweepConfig,
        consumer_id: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            channel: config.task_channel.clone(),
            group: config.group.clone(),
            consumer_id: consumer_id.into(),
            staleness: config.stream.staleness_threshold(),
            sweep_interval: config.stream.sweep_interval(),
            max_reclaims: config.stream.max_reclaims,
            batch: config.stream.reclaim_batch,
            backoff: config.retry.backoff(),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }

    /// Runs one reclamation pass.
    ///
    /// Returns `Unsupported` on broker backends.
    pub async fn sweep_once(&self) -> Result<SweepReport, QueueError> {
        if !self.backend.supports_reclaim() {
            return Err(QueueError::Unsupported {
                backend: self.backend.kind().as_str(),
                operation: "reclaim_stale",
            });
        }

        let backend = &self.backend;
        let (channel, group, consumer) = (
            self.channel.as_str(),
            self.group.as_str(),
            self.consumer_id.as_str(),
        );
        let (staleness, batch) = (self.staleness, self.batch);

        let reclaimed = self
            .backoff
            .retry("reclaim_stale", move || {
                backend.reclaim_stale(channel, group, staleness, consumer, batch)
            })
            .await?;

        let mut report = SweepReport {
            reclaimed: reclaimed.len(),
            ..Default::default()
        };
        if reclaimed.is_empty() {
            return Ok(report);
        }
        self.metrics.record_reclaimed(reclaimed.len());

        let dead_channel = self.backend.dead_letter_channel(channel);
        for delivery in reclaimed {
            let next_attempt = delivery.attempt + 1;
            let envelope = delivery.envelope(next_attempt);
            let exhausted = next_attempt > self.max_reclaims;
            let target = if exhausted {
                dead_channel.as_str()
            } else {
                channel
            };

            let envelope = &envelope;
            self.backoff
                .retry("requeue", move || backend.enqueue_envelope(target, envelope))
                .await?;

            let handle = &delivery.handle;
            let acked = self
                .backoff
                .retry("acknowledge", move || backend.acknowledge(channel, group, handle))
                .await?;

            if exhausted {
                report.dead_lettered += 1;
                warn!(
                    message_id = %delivery.message_id,
                    attempt = next_attempt,
                    dead_channel = %dead_channel,
                    "Entry exhausted its reclaim budget, moved to dead stream"
                );
            } else {
                report.requeued += 1;
                debug!(
                    message_id = %delivery.message_id,
                    attempt = next_attempt,
                    "Requeued stale entry"
                );
            }
            if !acked {
                debug!(message_id = %delivery.message_id, "Original already acknowledged");
            }
        }

        info!(
            sweeper = %self.consumer_id,
            reclaimed = report.reclaimed,
            requeued = report.requeued,
            dead_lettered = report.dead_lettered,
            "Sweep complete"
        );
        Ok(report)
    }

    /// Sweeps every `sweep_interval` until a shutdown signal arrives.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<SweepReport, QueueError> {
        let mut total = SweepReport::default();
        let mut ticker = tokio::time::interval(self.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            sweeper = %self.consumer_id,
            channel = %self.channel,
            interval_ms = self.sweep_interval.as_millis() as u64,
            staleness_ms = self.staleness.as_millis() as u64,
            "Sweeper started"
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!(sweeper = %self.consumer_id, "Sweeper received shutdown signal");
                    break;
                }
                _ = ticker.tick() => {
                    total.absorb(self.sweep_once().await?);
                }
            }
        }

        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::backend::{MemoryBroker, MemoryStream};
    use crate::scheduler::job::TaskChunk;

    const WAIT: Duration = Duration::from_millis(10);

    fn config(max_reclaims: u32) -> SweepConfig {
        SweepConfig::default()
            .with_staleness(Duration::ZERO, Duration::from_millis(10))
            .with_max_reclaims(max_reclaims)
    }

    async fn stream_with_claimed_task() -> (MemoryStream, Arc<dyn QueueBackend>) {
        let stream = MemoryStream::new();
        let backend: Arc<dyn QueueBackend> = Arc::new(stream.connect());
        backend.initialize("tasks", "workers").await.expect("init");
        let chunk = TaskChunk::new("chunk_000000", 0, 10, chrono::Utc::now());
        backend
            .enqueue("tasks", &chunk.to_payload().expect("payload"))
            .await
            .expect("enqueue");
        backend
            .dequeue("tasks", "workers", "crashed-worker", WAIT)
            .await
            .expect("dequeue")
            .expect("message");
        (stream, backend)
    }

    #[tokio::test]
    async fn test_sweep_requeues_stale_entry() {
        let (_stream, backend) = stream_with_claimed_task().await;
        let sweeper = ReclaimSweeper::new(Arc::clone(&backend), &config(3), "sweeper-1");

        let report = sweeper.sweep_once().await.expect("sweep");
        assert_eq!(
            report,
            SweepReport {
                reclaimed: 1,
                requeued: 1,
                dead_lettered: 0
            }
        );
        assert_eq!(backend.pending_count("tasks", "workers").await.expect("pending"), 0);

        let redelivered = backend
            .dequeue("tasks", "workers", "healthy-worker", WAIT)
            .await
            .expect("dequeue")
            .expect("requeued task");
        assert_eq!(redelivered.attempt, 1);
        let chunk: TaskChunk = redelivered.decode().expect("decode");
        assert_eq!(chunk.chunk_id, "chunk_000000");
    }

    #[tokio::test]
    async fn test_sweep_dead_letters_after_budget() {
        let (_stream, backend) = stream_with_claimed_task().await;
        let sweeper = ReclaimSweeper::new(Arc::clone(&backend), &config(1), "sweeper-1");

        // First reclaim: attempt 0 -> 1, still within budget.
        assert_eq!(sweeper.sweep_once().await.expect("sweep").requeued, 1);
        backend
            .dequeue("tasks", "workers", "crashed-again", WAIT)
            .await
            .expect("dequeue")
            .expect("message");

        // Second reclaim: attempt 1 -> 2 exceeds max_reclaims = 1.
        let report = sweeper.sweep_once().await.expect("sweep");
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(backend.dead_letter_count("tasks").await.expect("dead"), 1);
        assert!(backend
            .dequeue("tasks", "workers", "healthy", WAIT)
            .await
            .expect("dequeue")
            .is_none());
    }

    #[tokio::test]
    async fn test_sweep_ignores_fresh_entries() {
        let (_stream, backend) = stream_with_claimed_task().await;
        let fresh = SweepConfig::default()
            .with_staleness(Duration::from_secs(60), Duration::from_millis(10));
        let sweeper = ReclaimSweeper::new(Arc::clone(&backend), &fresh, "sweeper-1");

        assert_eq!(sweeper.sweep_once().await.expect("sweep"), SweepReport::default());
        assert_eq!(backend.pending_count("tasks", "workers").await.expect("pending"), 1);
    }

    #[tokio::test]
    async fn test_racing_sweepers_claim_once() {
        let (stream, backend) = stream_with_claimed_task().await;
        let a = ReclaimSweeper::new(Arc::clone(&backend), &config(3), "sweeper-a");
        let b = ReclaimSweeper::new(Arc::new(stream.connect()), &config(3), "sweeper-b");

        let (ra, rb) = tokio::join!(a.sweep_once(), b.sweep_once());
        let total = ra.expect("sweep a").reclaimed + rb.expect("sweep b").reclaimed;
        assert_eq!(total, 1);
        assert_eq!(backend.channel_depth("tasks").await.expect("depth"), 2);
    }

    #[tokio::test]
    async fn test_sweep_unsupported_on_broker() {
        let backend: Arc<dyn QueueBackend> =
            Arc::new(MemoryBroker::new(3, Duration::ZERO).connect());
        let sweeper = ReclaimSweeper::new(backend, &config(3), "sweeper-1");

        let result = sweeper.sweep_once().await;
        assert!(matches!(result, Err(QueueError::Unsupported { .. })));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (_stream, backend) = stream_with_claimed_task().await;
        let sweeper = ReclaimSweeper::new(backend, &config(3), "sweeper-1");
        let (tx, rx) = broadcast::channel(1);

        let handle = tokio::spawn(async move { sweeper.run(rx).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(()).expect("send shutdown");

        let total = handle.await.expect("join").expect("run");
        assert!(total.reclaimed >= 1);
    }
}
