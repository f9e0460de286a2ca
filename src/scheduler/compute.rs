//! The per-parameter computation workers run.
//!
//! Workers treat the function as an opaque, synchronous, possibly slow
//! call. It runs on the blocking thread pool so the worker's runtime stays
//! responsive while a chunk is being computed.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use super::job::{ResultSummary, TaskChunk};
use crate::error::ComputeError;

/// A pure function of one parameter index.
pub trait ParamFunction: Send + Sync + 'static {
    /// Computes the value for one parameter.
    fn compute(&self, param: u64) -> Result<i64, ComputeError>;

    /// Computes and folds every parameter of a chunk. Stops at the first failure.
    fn compute_range(&self, start_param: u64, end_param: u64) -> Result<ResultSummary, ComputeError> {
        let mut summary = ResultSummary::default();
        for param in start_param..end_param {
            summary.push(self.compute(param)?);
        }
        Ok(summary)
    }
}

/// Squares each parameter, optionally sleeping per chunk to model slow work.
#[derive(Debug, Clone, Copy, Default)]
pub struct SquareFunction {
    pub latency: Duration,
}

impl SquareFunction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self { latency }
    }
}

impl ParamFunction for SquareFunction {
    fn compute(&self, param: u64) -> Result<i64, ComputeError> {
        let value = i64::try_from(param).map_err(|_| ComputeError::InvalidParameter {
            param,
            reason: "exceeds i64 range".to_string(),
        })?;
        Ok(value.wrapping_mul(value))
    }

    fn compute_range(&self, start_param: u64, end_param: u64) -> Result<ResultSummary, ComputeError> {
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }
        let mut summary = ResultSummary::default();
        for param in start_param..end_param {
            summary.push(self.compute(param)?);
        }
        Ok(summary)
    }
}

/// Wraps another function and fails on a fixed set of parameters.
///
/// Used to model poison chunks.
#[derive(Clone)]
pub struct FailOn<F> {
    inner: F,
    params: HashSet<u64>,
}

impl<F: ParamFunction> FailOn<F> {
    pub fn new(inner: F, params: impl IntoIterator<Item = u64>) -> Self {
        Self {
            inner,
            params: params.into_iter().collect(),
        }
    }
}

impl<F: ParamFunction> ParamFunction for FailOn<F> {
    fn compute(&self, param: u64) -> Result<i64, ComputeError> {
        if self.params.contains(&param) {
            return Err(ComputeError::Failed {
                param,
                reason: "configured to fail".to_string(),
            });
        }
        self.inner.compute(param)
    }

    fn compute_range(&self, start_param: u64, end_param: u64) -> Result<ResultSummary, ComputeError> {
        if let Some(param) = (start_param..end_param).find(|p| self.params.contains(p)) {
            return Err(ComputeError::Failed {
                param,
                reason: "configured to fail".to_string(),
            });
        }
        self.inner.compute_range(start_param, end_param)
    }
}

/// Runs `compute_range` for a chunk on the blocking pool.
pub async fn compute_chunk(
    function: Arc<dyn ParamFunction>,
    chunk: &TaskChunk,
) -> Result<ResultSummary, ComputeError> {
    let (start, end) = (chunk.start_param, chunk.end_param);
    tokio::task::spawn_blocking(move || function.compute_range(start, end))
        .await
        .map_err(|e| ComputeError::Aborted(e.to_string()))?
}

/// Expected summary for `[0, total)` under [`SquareFunction`].
pub fn expected_square_summary(total: u64) -> ResultSummary {
    SquareFunction::new()
        .compute_range(0, total)
        .unwrap_or_default()
}
