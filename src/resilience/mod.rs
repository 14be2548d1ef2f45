// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Resilience layer wrapped around every upstream call.
//!
//! [`ProtectedCall`] composes a named [`CircuitBreaker`] with a
//! [`RetryConfig`]: the breaker sees one outcome per logical call (the whole
//! retry loop), so an open circuit short-circuits before any attempt and a
//! rejection is never retried.

pub mod circuit_breaker;
pub mod retry;

use std::future::Future;
use tokio_util::sync::CancellationToken;

pub use circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitCounts, CircuitError, CircuitSnapshot, CircuitState};
pub use retry::{retry, RetryConfig, RetryError};

/// Error from a [`ProtectedCall`].
#[derive(Debug, thiserror::Error)]
pub enum GuardError<E> {
    /// The breaker is open; the dependency was not invoked
    #[error("circuit '{circuit}' is open")]
    CircuitOpen { circuit: String },

    /// Every retry attempt failed
    #[error("retries exhausted after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: usize,
        #[source]
        source: E,
    },

    /// Cancelled while attempting or waiting to retry
    #[error("cancelled")]
    Cancelled,
}

impl<E> GuardError<E> {
    #[must_use]
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// A named upstream dependency guarded by a breaker and a retry policy.
///
/// `execute` is the single entry point for every upstream command; it is
/// generic over the command's response type.
#[derive(Debug)]
pub struct ProtectedCall {
    breaker: CircuitBreaker,
    retry: RetryConfig,
}

impl ProtectedCall {
    pub fn new(name: impl Into<String>, circuit: CircuitConfig, retry: RetryConfig) -> Self {
        Self {
            breaker: CircuitBreaker::new(name, circuit),
            retry,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.breaker.name()
    }

    #[must_use]
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Run `command` through the breaker and the retry loop.
    pub async fn execute<T, E, F, Fut>(
        &self,
        command: &str,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<T, GuardError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let operation_name = format!("{}.{}", self.breaker.name(), command);
        let result = self
            .breaker
            .call_classified(
                || retry(&operation_name, &self.retry, cancel, operation),
                |e| !matches!(e, RetryError::Cancelled { .. }),
            )
            .await;

        match result {
            Ok(value) => Ok(value),
            Err(CircuitError::Rejected { circuit }) => Err(GuardError::CircuitOpen { circuit }),
            Err(CircuitError::Inner(RetryError::Cancelled { .. })) => Err(GuardError::Cancelled),
            Err(CircuitError::Inner(RetryError::Exhausted { attempts, source, .. })) => {
                Err(GuardError::RetriesExhausted { attempts, source })
            }
        }
    }
}
