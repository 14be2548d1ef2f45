// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for playback-sync.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host application is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `playback_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `component`: store, bus, upstream, geolocation
//! - `operation`: fetch, insert_event, publish, lookup
//! - `status`: success, failure, rejected, cancelled

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record operation latency
pub fn record_latency(component: &str, operation: &str, duration: Duration) {
    histogram!(
        "playback_sync_operation_seconds",
        "component" => component.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

// ═══════════════════════════════════════════════════════════════════════════
// SYNC PASSES
// ═══════════════════════════════════════════════════════════════════════════

/// Record a completed (or failed) sync pass
pub fn record_sync_pass(status: &str, duration: Duration) {
    counter!(
        "playback_sync_passes_total",
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("playback_sync_pass_seconds").record(duration.as_secs_f64());
}

/// Record fetched batch size
pub fn record_batch_size(count: usize) {
    histogram!("playback_sync_batch_size").record(count as f64);
}

/// Record per-record outcomes (persisted, skipped, failed)
pub fn record_records(outcome: &str, count: usize) {
    counter!(
        "playback_sync_records_total",
        "outcome" => outcome.to_string()
    )
    .increment(count as u64);
}

/// Record which persistence path a record took
pub fn record_persist_path(path: &str) {
    counter!(
        "playback_sync_persist_total",
        "path" => path.to_string()
    )
    .increment(1);
}

/// Record a failed or timed-out bus publish
pub fn record_bus_failure(reason: &str) {
    counter!(
        "playback_sync_bus_failures_total",
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record an orchestrator lifecycle transition into `state`
pub fn record_state_transition(state: &str) {
    counter!(
        "playback_sync_state_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// RESILIENCE
// ═══════════════════════════════════════════════════════════════════════════

/// Set circuit breaker state (0=closed, 1=half-open, 2=open)
pub fn set_circuit_state(circuit: &str, state: u8) {
    gauge!(
        "playback_sync_circuit_breaker_state",
        "circuit" => circuit.to_string()
    )
    .set(state as f64);
}

/// Record a circuit breaker call outcome
pub fn record_circuit_call(circuit: &str, outcome: &str) {
    counter!(
        "playback_sync_circuit_breaker_calls_total",
        "circuit" => circuit.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a circuit breaker state transition
pub fn record_circuit_transition(circuit: &str, from: &str, to: &str) {
    counter!(
        "playback_sync_circuit_breaker_transitions_total",
        "circuit" => circuit.to_string(),
        "from" => from.to_string(),
        "to" => to.to_string()
    )
    .increment(1);
}

/// Record a retry decision (retried, exhausted)
pub fn record_retry(operation: &str, outcome: &str) {
    counter!(
        "playback_sync_retries_total",
        "operation" => operation.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// GEOLOCATION
// ═══════════════════════════════════════════════════════════════════════════

/// Record how an address was resolved (invalid, local, cache_hit, provider, unknown)
pub fn record_geolocation(resolution: &str) {
    counter!(
        "playback_sync_geolocation_total",
        "resolution" => resolution.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// LIVE SESSIONS
// ═══════════════════════════════════════════════════════════════════════════

/// Record a session poll and how many sessions it emitted
pub fn record_session_poll(status: &str, emitted: usize) {
    counter!(
        "playback_sync_session_polls_total",
        "status" => status.to_string()
    )
    .increment(1);
    counter!("playback_sync_sessions_emitted_total").increment(emitted as u64);
}

/// Set number of sessions held by the seen cache
pub fn set_seen_cache_entries(count: usize) {
    gauge!("playback_sync_seen_cache_entries").set(count as f64);
}

/// Record a buffer health classification
pub fn record_buffer_health(status: &str) {
    counter!(
        "playback_sync_buffer_health_total",
        "status" => status.to_string()
    )
    .increment(1);
}

/// Set number of sessions tracked by the buffer health monitor
pub fn set_buffer_sessions(count: usize) {
    gauge!("playback_sync_buffer_tracked_sessions").set(count as f64);
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    component: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(component: &'static str, operation: &'static str) -> Self {
        Self {
            component,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.component, self.operation, self.start.elapsed());
    }
}

/// Convenience macro for timing operations
#[macro_export]
macro_rules! time_operation {
    ($component:expr, $op:expr) => {
        $crate::metrics::LatencyTimer::new($component, $op)
    };
}
