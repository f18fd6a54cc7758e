//! # Retry Logic and Backoff
//!
//! Exponential backoff for operations pushed to the backend.
//!
//! ## Features
//!
//! - **Exponential Backoff**: `base * multiplier^retry`, capped at `max_delay_ms`
//! - **Max Retries**: bounded by the policy and by the error class
//! - **Error-Aware Budget**: business-rule rejections get at most one retry,
//!   client errors none
//!
//! ## Usage
//!
//! ```rust,no_run
//! use offline_sync::offline::retry::RetryPolicy;
//! use offline_sync::shared::SyncError;
//!
//! # async fn example() {
//! let policy = RetryPolicy::default();
//! let report = policy
//!     .run(policy.max_retries, |_attempt| async { Err::<(), _>(SyncError::network("down")) })
//!     .await;
//! assert_eq!(report.retries, 3);
//! # }
//! ```

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

use crate::shared::error::SyncError;

/// Backoff configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_delay_ms: u64,
    /// Growth factor between consecutive delays
    pub multiplier: f64,
    /// Upper bound on any delay
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            multiplier: 2.0,
            max_delay_ms: 30_000,
        }
    }
}

/// Outcome of a retried call
#[derive(Debug, Clone)]
pub struct RetryReport<T> {
    /// Final result
    pub result: Result<T, SyncError>,
    /// Attempts made, the first one included
    pub attempts: u32,
    /// Retries made after the first attempt
    pub retries: u32,
    /// Delay slept before each retry
    pub delays: Vec<Duration>,
}

impl RetryPolicy {
    /// Create a new policy
    pub fn new(max_retries: u32, base_delay_ms: u64, multiplier: f64, max_delay_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay_ms,
            multiplier,
            max_delay_ms,
        }
    }

    /// Delay before retry number `retry` (0-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.min(i32::MAX as u32) as i32;
        let raw = self.base_delay_ms as f64 * self.multiplier.powi(exponent);
        let capped = raw.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    /// Run `call` until it succeeds or the retry budget is spent.
    ///
    /// `max_retries` bounds the retries for this call; the error class can
    /// shrink it further (see [`SyncError::retry_budget`]). `call` receives
    /// the 0-based attempt number.
    pub async fn run<T, F, Fut>(&self, max_retries: u32, mut call: F) -> RetryReport<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        let mut attempts = 0u32;
        let mut delays = Vec::new();

        loop {
            let result = call(attempts).await;
            attempts += 1;

            let error = match result {
                Ok(value) => {
                    return RetryReport {
                        result: Ok(value),
                        attempts,
                        retries: attempts - 1,
                        delays,
                    }
                }
                Err(e) => e,
            };

            let retries = attempts - 1;
            if retries >= error.retry_budget(max_retries) {
                return RetryReport {
                    result: Err(error),
                    attempts,
                    retries,
                    delays,
                };
            }

            let delay = self.delay_for(retries);
            tracing::debug!(
                "[Retry] Attempt {} failed ({}), retrying in {:?}",
                attempts,
                error,
                delay
            );
            delays.push(delay);
            tokio::time::sleep(delay).await;
        }
    }
}
