//! Folds chunk results into the job answer.
//!
//! Results may arrive more than once and in any order. The first `Complete`
//! result per chunk id wins; later ones are counted as duplicates and
//! dropped. Because the fold is a wrapping sum plus a count, the answer does
//! not depend on arrival order.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use super::backend::QueueBackend;
use super::job::{ChunkResult, ResultSummary};
use crate::error::QueueError;
use crate::metrics::MetricsCollector;

/// What happened to one result passed to [`Aggregator::fold`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoldOutcome {
    /// First complete result for its chunk; folded into the total.
    Accepted,
    /// A complete result for a chunk that was already folded.
    Duplicate,
    /// A failed attempt; counted, never folded.
    FailedAttempt,
}

/// The aggregated answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AggregateReport {
    pub sum: i64,
    pub count: u64,
    pub processed_chunks: u64,
    pub expected_chunks: u64,
    pub duplicates: u64,
    pub failed_attempts: u64,
    /// Every expected chunk contributed exactly once.
    pub complete: bool,
}

/// In-memory result fold.
#[derive(Debug, Clone)]
pub struct Aggregator {
    expected_chunks: u64,
    seen: HashSet<String>,
    summary: ResultSummary,
    duplicates: u64,
    failed_attempts: u64,
}

impl Aggregator {
    pub fn new(expected_chunks: u64) -> Self {
        Self {
            expected_chunks,
            seen: HashSet::new(),
            summary: ResultSummary::default(),
            duplicates: 0,
            failed_attempts: 0,
        }
    }

    pub fn fold(&mut self, result: &ChunkResult) -> FoldOutcome {
        if !result.is_complete() {
            self.failed_attempts += 1;
            return FoldOutcome::FailedAttempt;
        }
        if !self.seen.insert(result.chunk_id.clone()) {
            self.duplicates += 1;
            return FoldOutcome::Duplicate;
        }
        self.summary = self.summary.merge(result.result_summary);
        FoldOutcome::Accepted
    }

    pub fn processed_chunks(&self) -> u64 {
        self.seen.len() as u64
    }

    pub fn is_complete(&self) -> bool {
        self.processed_chunks() >= self.expected_chunks
    }

    pub fn report(&self) -> AggregateReport {
        AggregateReport {
            sum: self.summary.sum,
            count: self.summary.count,
            processed_chunks: self.processed_chunks(),
            expected_chunks: self.expected_chunks,
            duplicates: self.duplicates,
            failed_attempts: self.failed_attempts,
            complete: self.is_complete(),
        }
    }
}

/// Consumes the results channel until every expected chunk has reported or
/// nothing arrives for `idle_deadline`.
///
/// Every consumed result is acknowledged, including duplicates and
/// undecodable payloads, so the results channel drains.
pub async fn aggregate(
    backend: Arc<dyn QueueBackend>,
    results_channel: &str,
    group: &str,
    consumer: &str,
    expected_chunks: u64,
    idle_deadline: Duration,
) -> Result<AggregateReport, QueueError> {
    match backend.initialize(results_channel, group).await {
        Ok(()) => {}
        Err(e) if e.is_benign() => {}
        Err(e) => return Err(e),
    }

    let metrics = MetricsCollector::new();
    let mut aggregator = Aggregator::new(expected_chunks);
    let mut idle_since = Instant::now();
    let block = idle_deadline.min(Duration::from_secs(1));

    info!(
        channel = %results_channel,
        expected_chunks = expected_chunks,
        "Aggregating results"
    );

    while !aggregator.is_complete() {
        let idle_for = idle_since.elapsed();
        if idle_for >= idle_deadline {
            warn!(
                processed = aggregator.processed_chunks(),
                expected = expected_chunks,
                "Aggregation idle deadline reached"
            );
            break;
        }

        let wait = block.min(idle_deadline - idle_for);
        let Some(delivery) = backend
            .dequeue(results_channel, group, consumer, wait)
            .await?
        else {
            continue;
        };
        idle_since = Instant::now();

        match delivery.decode::<ChunkResult>() {
            Ok(result) => match aggregator.fold(&result) {
                FoldOutcome::Accepted => {
                    debug!(chunk_id = %result.chunk_id, worker_id = %result.worker_id, "Folded result")
                }
                FoldOutcome::Duplicate => {
                    metrics.record_duplicate();
                    debug!(chunk_id = %result.chunk_id, "Dropped duplicate result");
                }
                FoldOutcome::FailedAttempt => {
                    debug!(chunk_id = %result.chunk_id, "Counted failed attempt")
                }
            },
            Err(e) => warn!(message_id = %delivery.message_id, error = %e, "Skipping undecodable result"),
        }

        backend
            .acknowledge(results_channel, group, &delivery.handle)
            .await?;
    }

    let report = aggregator.report();
    info!(
        sum = report.sum,
        count = report.count,
        processed_chunks = report.processed_chunks,
        duplicates = report.duplicates,
        failed_attempts = report.failed_attempts,
        complete = report.complete,
        "Aggregation finished"
    );
    Ok(report)
}
