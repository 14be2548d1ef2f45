// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry logic with exponential backoff.
//!
//! Every attempt and every backoff wait observes a [`CancellationToken`]:
//! cancellation surfaces as [`RetryError::Cancelled`], never as the
//! underlying failure. Running out of attempts surfaces
//! [`RetryError::Exhausted`] wrapping the last failure.
//!
//! # Example
//!
//! ```
//! use playback_sync::RetryConfig;
//! use std::time::Duration;
//!
//! let upstream = RetryConfig::upstream(5, Duration::from_secs(2));
//! assert_eq!(upstream.max_attempts, 5);
//!
//! let query = RetryConfig::query();
//! assert_eq!(query.max_attempts, 3);
//! ```

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Configuration for operation retry behavior.
///
/// - [`RetryConfig::upstream()`] - history/session provider calls, from configuration
/// - [`RetryConfig::query()`] - quick retry for cheap lookups
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first one
    pub max_attempts: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::upstream(5, Duration::from_secs(2))
    }
}

impl RetryConfig {
    /// Doubling backoff for upstream provider calls.
    #[must_use]
    pub fn upstream(max_attempts: usize, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: base_delay,
            max_delay: Duration::from_secs(300),
            factor: 2.0,
        }
    }

    /// Quick retry for individual lookups (don't block a batch on one IP).
    #[must_use]
    pub fn query() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Delay before the attempt following `attempt` (1-based).
    #[must_use]
    pub fn delay_after(&self, attempt: usize) -> Duration {
        let mut delay = self.initial_delay;
        for _ in 1..attempt {
            delay = delay.mul_f64(self.factor).min(self.max_delay);
        }
        delay
    }
}

/// Error returned by [`retry`].
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// The caller's cancellation fired before an attempt succeeded
    #[error("operation '{operation}' cancelled")]
    Cancelled { operation: String },

    /// Every attempt failed
    #[error("retries exhausted for '{operation}' after {attempts} attempts: {source}")]
    Exhausted {
        operation: String,
        attempts: usize,
        #[source]
        source: E,
    },
}

pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = config.max_attempts.max(1);
    let cancelled = || RetryError::Cancelled { operation: operation_name.to_string() };
    let mut attempt = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(cancelled());
        }
        attempt += 1;

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled()),
            outcome = operation() => outcome,
        };

        match outcome {
            Ok(val) => {
                if attempt > 1 {
                    info!(operation = operation_name, attempt, "Operation succeeded after retry");
                }
                return Ok(val);
            }
            Err(err) if attempt >= max_attempts => {
                warn!(operation = operation_name, attempts = attempt, error = %err, "Retries exhausted");
                crate::metrics::record_retry(operation_name, "exhausted");
                return Err(RetryError::Exhausted {
                    operation: operation_name.to_string(),
                    attempts: attempt,
                    source: err,
                });
            }
            Err(err) => {
                let delay = config.delay_after(attempt);
                warn!(
                    operation = operation_name,
                    attempt,
                    max_attempts,
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    "Operation failed, retrying"
                );
                crate::metrics::record_retry(operation_name, "retried");

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(cancelled()),
                    _ = sleep(delay) => {}
                }
            }
        }
    }
}
