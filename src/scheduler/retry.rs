//! Bounded exponential backoff for transient backend errors.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::QueueError;

/// Retry budget for operations that may hit `BackendUnavailable`.
///
/// Only errors for which [`QueueError::is_transient`] holds are retried;
/// everything else returns immediately.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(5, Duration::from_millis(200), Duration::from_secs(10))
    }
}

impl Backoff {
    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            max_delay,
            factor: 2.0,
        }
    }

    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// Delay before the retry that follows `failures_so_far` failures (0-based).
    pub fn delay_for(&self, failures_so_far: u32) -> Duration {
        let exponent = failures_so_far.min(32) as i32;
        let millis = self.initial_delay.as_millis() as f64 * self.factor.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64).max(0.0);
        Duration::from_millis(capped.round() as u64)
    }

    /// Runs `op` until it succeeds, fails permanently, or the budget is spent.
    pub async fn retry<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, QueueError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, QueueError>>,
    {
        let mut failures = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && failures + 1 < self.max_attempts => {
                    let delay = self.delay_for(failures);
                    failures += 1;
                    warn!(
                        operation = %operation,
                        attempt = failures,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient backend error, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
