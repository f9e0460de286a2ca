//! Enqueues planned chunks onto the task channel.
//!
//! Enqueue never waits on consumers. Transient backend failures are retried
//! with backoff; if the budget runs out, the error carries how far the
//! producer got so a rerun can resume with [`Producer::produce_from`].
//! Chunk ids are positional, so re-enqueueing an already-sent chunk is
//! harmless downstream.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info};

use super::backend::QueueBackend;
use super::job::TaskChunk;
use super::planner;
use super::retry::Backoff;
use crate::error::QueueError;

/// Outcome of a produce run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProduceReport {
    /// Chunks in the plan.
    pub planned: usize,
    /// Chunks enqueued by this run.
    pub enqueued: usize,
    /// Chunks skipped because an earlier run already sent them.
    pub skipped: usize,
    pub elapsed: Duration,
}

/// Publishes task chunks to one channel.
pub struct Producer {
    backend: Arc<dyn QueueBackend>,
    channel: String,
    backoff: Backoff,
}

impl Producer {
    pub fn new(backend: Arc<dyn QueueBackend>, channel: impl Into<String>) -> Self {
        Self {
            backend,
            channel: channel.into(),
            backoff: Backoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Plans `[0, total_parameters)` and enqueues every chunk.
    pub async fn plan_and_produce(
        &self,
        total_parameters: u64,
        chunk_size: u64,
    ) -> Result<ProduceReport, QueueError> {
        let chunks = planner::plan(total_parameters, chunk_size)?;
        self.produce(&chunks).await
    }

    /// Enqueues every chunk in order.
    pub async fn produce(&self, chunks: &[TaskChunk]) -> Result<ProduceReport, QueueError> {
        self.produce_from(chunks, 0).await
    }

    /// Enqueues chunks starting at index `resume_from`.
    pub async fn produce_from(
        &self,
        chunks: &[TaskChunk],
        resume_from: usize,
    ) -> Result<ProduceReport, QueueError> {
        let started = Instant::now();
        let skipped = resume_from.min(chunks.len());
        let mut enqueued = 0;

        info!(
            channel = %self.channel,
            planned = chunks.len(),
            resume_from = skipped,
            "Producing task chunks"
        );

        for (index, chunk) in chunks.iter().enumerate().skip(skipped) {
            let payload = chunk.to_payload()?;
            let backend = &self.backend;
            let channel = self.channel.as_str();
            let payload = payload.as_slice();

            let message_id = self
                .backoff
                .retry("enqueue", move || backend.enqueue(channel, payload))
                .await
                .map_err(|e| {
                    error!(
                        channel = %self.channel,
                        chunk_id = %chunk.chunk_id,
                        resume_from = index,
                        error = %e,
                        "Enqueue failed after retries"
                    );
                    e
                })?;

            enqueued += 1;
            debug!(chunk_id = %chunk.chunk_id, message_id = %message_id, "Enqueued chunk");
        }

        let report = ProduceReport {
            planned: chunks.len(),
            enqueued,
            skipped,
            elapsed: started.elapsed(),
        };
        info!(
            channel = %self.channel,
            enqueued = report.enqueued,
            skipped = report.skipped,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Produced task chunks"
        );
        Ok(report)
    }
}
