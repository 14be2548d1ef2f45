// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Ratio-based circuit breaker for upstream calls.
//!
//! Protects the history provider, session providers and geolocation
//! providers from being hammered while they are unhealthy. One breaker per
//! named dependency; the breaker is generic over each call's own result type.
//!
//! States:
//! - Closed: calls pass through, outcomes are counted in a rolling window
//! - Open: calls fail fast with [`CircuitError::Rejected`] until the cooldown elapses
//! - HalfOpen: a bounded number of trial calls decide between Closed and Open
//!
//! The breaker only trips once the window holds at least `min_requests`
//! settled calls and the failure ratio reaches `failure_ratio`.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker state for metrics/monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed = 0,
    HalfOpen = 1,
    Open = 2,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::HalfOpen => write!(f, "half_open"),
            Self::Open => write!(f, "open"),
        }
    }
}

/// Error type for circuit-protected operations
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The breaker rejected the call without invoking the dependency
    #[error("circuit breaker '{circuit}' open, request rejected")]
    Rejected { circuit: String },

    /// The underlying operation failed
    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

impl<E> CircuitError<E> {
    /// True when the breaker short-circuited the call.
    #[must_use]
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }
}

/// Configuration for a circuit breaker
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Minimum settled calls in the window before the breaker may trip
    pub min_requests: u32,
    /// Failure ratio (0.0 - 1.0) at or above which the breaker trips
    pub failure_ratio: f64,
    /// Rolling measurement window while closed; zero disables window resets
    pub window: Duration,
    /// How long the breaker stays open before allowing trial calls
    pub cooldown: Duration,
    /// Trial calls admitted while half-open; this many consecutive successes close it
    pub half_open_max_requests: u32,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            min_requests: 10,
            failure_ratio: 0.6,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(120),
            half_open_max_requests: 3,
        }
    }
}

impl CircuitConfig {
    /// Config for best-effort enrichment lookups (recovers sooner)
    #[must_use]
    pub fn lenient() -> Self {
        Self {
            min_requests: 10,
            failure_ratio: 0.8,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
            half_open_max_requests: 1,
        }
    }
}

/// Rolling counts for the current generation (window or half-open trial).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CircuitCounts {
    /// Calls admitted in this generation
    pub requests: u32,
    pub total_successes: u32,
    pub total_failures: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

impl CircuitCounts {
    fn on_success(&mut self) {
        self.total_successes += 1;
        self.consecutive_successes += 1;
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.total_failures += 1;
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;
    }

    fn settled(&self) -> u32 {
        self.total_successes + self.total_failures
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, Copy)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub counts: CircuitCounts,
    pub last_transition: Instant,
}

struct Inner {
    state: CircuitState,
    generation: u64,
    counts: CircuitCounts,
    /// Closed: end of the window. Open: end of the cooldown.
    expiry: Option<Instant>,
    last_transition: Instant,
}

type Transition = (CircuitState, CircuitState);

impl Inner {
    fn new(config: &CircuitConfig, now: Instant) -> Self {
        let mut inner = Self {
            state: CircuitState::Closed,
            generation: 0,
            counts: CircuitCounts::default(),
            expiry: None,
            last_transition: now,
        };
        inner.new_generation(config, now);
        inner
    }

    fn new_generation(&mut self, config: &CircuitConfig, now: Instant) {
        self.generation += 1;
        self.counts = CircuitCounts::default();
        self.expiry = match self.state {
            CircuitState::Closed if config.window.is_zero() => None,
            CircuitState::Closed => Some(now + config.window),
            CircuitState::Open => Some(now + config.cooldown),
            CircuitState::HalfOpen => None,
        };
    }

    fn set_state(&mut self, to: CircuitState, config: &CircuitConfig, now: Instant) -> Transition {
        let from = self.state;
        self.state = to;
        self.last_transition = now;
        self.new_generation(config, now);
        (from, to)
    }

    /// Apply time-driven changes: window rollover and cooldown expiry.
    fn refresh(&mut self, config: &CircuitConfig, now: Instant) -> Option<Transition> {
        let expired = self.expiry.is_some_and(|expiry| expiry <= now);
        match self.state {
            CircuitState::Closed if expired => {
                self.new_generation(config, now);
                None
            }
            CircuitState::Open if expired => Some(self.set_state(CircuitState::HalfOpen, config, now)),
            _ => None,
        }
    }

    fn should_trip(&self, config: &CircuitConfig) -> bool {
        let settled = self.counts.settled();
        settled >= config.min_requests
            && settled > 0
            && f64::from(self.counts.total_failures) / f64::from(settled) >= config.failure_ratio
    }

    fn record(&mut self, success: bool, config: &CircuitConfig, now: Instant) -> Option<Transition> {
        if success {
            self.counts.on_success();
        } else {
            self.counts.on_failure();
        }
        match self.state {
            CircuitState::Closed if self.should_trip(config) => {
                Some(self.set_state(CircuitState::Open, config, now))
            }
            CircuitState::HalfOpen if !success => Some(self.set_state(CircuitState::Open, config, now)),
            CircuitState::HalfOpen
                if self.counts.consecutive_successes >= config.half_open_max_requests.max(1) =>
            {
                Some(self.set_state(CircuitState::Closed, config, now))
            }
            _ => None,
        }
    }
}

/// Releases an admitted slot if the call future is dropped before it settles.
struct AdmissionGuard<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    settled: bool,
}

impl Drop for AdmissionGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.release(self.generation);
        }
    }
}

/// A named circuit breaker with metrics tracking
pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<CircuitState>,

    // Metrics
    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given name and config
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        let (state_tx, _) = watch::channel(CircuitState::Closed);
        let inner = Inner::new(&config, Instant::now());
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(inner),
            state_tx,
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    /// Create with default config
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitConfig::default())
    }

    /// Get the circuit breaker name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get current circuit state (applies any elapsed cooldown first).
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.snapshot().state
    }

    /// Current state, counts and last transition time.
    #[must_use]
    pub fn snapshot(&self) -> CircuitSnapshot {
        let (snapshot, transition) = {
            let mut inner = self.inner.lock();
            let transition = inner.refresh(&self.config, Instant::now());
            let snapshot = CircuitSnapshot {
                state: inner.state,
                counts: inner.counts,
                last_transition: inner.last_transition,
            };
            (snapshot, transition)
        };
        if let Some(transition) = transition {
            self.notify(transition);
        }
        snapshot
    }

    /// Watch state transitions.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<CircuitState> {
        self.state_tx.subscribe()
    }

    /// Execute an async operation through the circuit breaker.
    ///
    /// Every error counts as a failure.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_classified(f, |_| true).await
    }

    /// Execute an async operation, letting `is_failure` decide which errors
    /// count against the breaker. Errors it rejects release the slot without
    /// being counted either way.
    pub async fn call_classified<F, Fut, T, E, P>(&self, f: F, is_failure: P) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        self.calls_total.fetch_add(1, Ordering::Relaxed);

        let Some(generation) = self.admit() else {
            self.rejections.fetch_add(1, Ordering::Relaxed);
            warn!(circuit = %self.name, "Circuit breaker rejected call (open)");
            crate::metrics::record_circuit_call(&self.name, "rejected");
            return Err(CircuitError::Rejected { circuit: self.name.clone() });
        };

        let mut guard = AdmissionGuard { breaker: self, generation, settled: false };
        let result = f().await;
        guard.settled = true;

        match result {
            Ok(value) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                self.settle(generation, true);
                debug!(circuit = %self.name, "Circuit call succeeded");
                crate::metrics::record_circuit_call(&self.name, "success");
                Ok(value)
            }
            Err(e) if is_failure(&e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                self.settle(generation, false);
                debug!(circuit = %self.name, "Circuit call failed");
                crate::metrics::record_circuit_call(&self.name, "failure");
                Err(CircuitError::Inner(e))
            }
            Err(e) => {
                self.release(generation);
                crate::metrics::record_circuit_call(&self.name, "ignored");
                Err(CircuitError::Inner(e))
            }
        }
    }

    fn admit(&self) -> Option<u64> {
        let (admitted, transition) = {
            let mut inner = self.inner.lock();
            let transition = inner.refresh(&self.config, Instant::now());
            let admitted = match inner.state {
                CircuitState::Open => None,
                CircuitState::HalfOpen
                    if inner.counts.requests >= self.config.half_open_max_requests.max(1) =>
                {
                    None
                }
                _ => {
                    inner.counts.requests += 1;
                    Some(inner.generation)
                }
            };
            (admitted, transition)
        };
        if let Some(transition) = transition {
            self.notify(transition);
        }
        admitted
    }

    fn settle(&self, generation: u64, success: bool) {
        let transition = {
            let mut inner = self.inner.lock();
            let now = Instant::now();
            let refreshed = inner.refresh(&self.config, now);
            if inner.generation == generation {
                inner.record(success, &self.config, now)
            } else {
                refreshed
            }
        };
        if let Some(transition) = transition {
            self.notify(transition);
        }
    }

    fn release(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.generation == generation {
            inner.counts.requests = inner.counts.requests.saturating_sub(1);
        }
    }

    fn notify(&self, (from, to): Transition) {
        match to {
            CircuitState::Open => warn!(circuit = %self.name, %from, %to, "Circuit breaker opened"),
            _ => info!(circuit = %self.name, %from, %to, "Circuit breaker state changed"),
        }
        self.state_tx.send_replace(to);
        crate::metrics::set_circuit_state(&self.name, to as u8);
        crate::metrics::record_circuit_transition(&self.name, &from.to_string(), &to.to_string());
    }

    /// Get total number of calls
    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    /// Get number of successful calls
    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    /// Get number of failed calls (operation errors)
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Get number of rejected calls (circuit open)
    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}
