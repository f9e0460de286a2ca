//! Message types exchanged over the task and results channels.
//!
//! - `TaskChunk`: a contiguous parameter range, the unit of work
//! - `ChunkResult`: what a worker publishes after computing a chunk
//! - `ResultSummary`: the aggregable payload inside a result
//! - `ResultStatus`: outcome of a single attempt

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A contiguous, half-open range of parameter indices.
///
/// Chunks are created once by the planner and never mutated. The
/// `chunk_id` is derived from the chunk's position in the plan, so a
/// restarted producer regenerates identical identifiers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskChunk {
    /// Position-derived identifier, e.g. `chunk_000042`.
    pub chunk_id: String,
    /// First parameter index (inclusive).
    pub start_param: u64,
    /// One past the last parameter index (exclusive).
    pub end_param: u64,
    /// Number of parameters in the range.
    pub total_in_chunk: u64,
    /// When the chunk was planned.
    pub created_at: DateTime<Utc>,
}

impl TaskChunk {
    /// Creates a chunk covering `[start_param, end_param)`.
    pub fn new(
        chunk_id: impl Into<String>,
        start_param: u64,
        end_param: u64,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            chunk_id: chunk_id.into(),
            start_param,
            end_param,
            total_in_chunk: end_param.saturating_sub(start_param),
            created_at,
        }
    }

    /// Returns whether the range is non-empty and `total_in_chunk` agrees with it.
    pub fn is_well_formed(&self) -> bool {
        self.end_param > self.start_param
            && self.total_in_chunk == self.end_param - self.start_param
    }

    /// Iterates the parameter indices in this chunk.
    pub fn params(&self) -> std::ops::Range<u64> {
        self.start_param..self.end_param
    }

    /// Serializes the chunk into a task message payload.
    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parses a task message payload.
    pub fn from_payload(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

/// Outcome of one attempt at a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Complete,
    Failed,
}

impl std::fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResultStatus::Complete => write!(f, "complete"),
            ResultStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Aggregable payload carried by a result.
///
/// `sum` uses wrapping addition so that merging is associative and
/// commutative for every input, not only for sums that fit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultSummary {
    pub sum: i64,
    pub count: u64,
}

impl ResultSummary {
    pub fn new(sum: i64, count: u64) -> Self {
        Self { sum, count }
    }

    /// Folds one computed value into the summary.
    pub fn push(&mut self, value: i64) {
        self.sum = self.sum.wrapping_add(value);
        self.count += 1;
    }

    /// Combines two summaries.
    pub fn merge(self, other: ResultSummary) -> ResultSummary {
        ResultSummary {
            sum: self.sum.wrapping_add(other.sum),
            count: self.count + other.count,
        }
    }
}

/// Result published by a worker for one chunk.
///
/// Several results may exist for the same `chunk_id` when a task is
/// delivered more than once; consumers must deduplicate on `chunk_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkResult {
    /// Identifier of the chunk this result answers.
    pub chunk_id: String,
    /// Worker that produced the result.
    pub worker_id: String,
    /// Outcome of the attempt.
    pub status: ResultStatus,
    /// Number of parameters actually computed.
    pub params_processed: u64,
    /// Wall-clock time spent computing, in seconds.
    pub duration_seconds: f64,
    /// Folded values for the chunk's range.
    pub result_summary: ResultSummary,
    /// When the attempt finished.
    pub completed_at: DateTime<Utc>,
}

impl ChunkResult {
    /// Creates a successful result for a fully computed chunk.
    pub fn complete(
        chunk: &TaskChunk,
        worker_id: impl Into<String>,
        summary: ResultSummary,
        duration_seconds: f64,
    ) -> Self {
        Self {
            chunk_id: chunk.chunk_id.clone(),
            worker_id: worker_id.into(),
            status: ResultStatus::Complete,
            params_processed: summary.count,
            duration_seconds,
            result_summary: summary,
            completed_at: Utc::now(),
        }
    }

    /// Creates a failure record for an attempt that did not finish.
    pub fn failed(chunk: &TaskChunk, worker_id: impl Into<String>, duration_seconds: f64) -> Self {
        Self {
            chunk_id: chunk.chunk_id.clone(),
            worker_id: worker_id.into(),
            status: ResultStatus::Failed,
            params_processed: 0,
            duration_seconds,
            result_summary: ResultSummary::default(),
            completed_at: Utc::now(),
        }
    }

    /// Returns whether the attempt completed.
    pub fn is_complete(&self) -> bool {
        self.status == ResultStatus::Complete
    }

    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}
