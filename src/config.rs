//! Configuration for the playback sync engine.
//!
//! # Example
//!
//! ```
//! use playback_sync::{PersistenceMode, PlaybackSyncConfig};
//!
//! // Minimal config (uses defaults)
//! let config = PlaybackSyncConfig::default();
//! assert_eq!(config.sync.batch_size, 1000);
//! assert_eq!(config.breaker.min_requests, 10);
//!
//! // Event-sourcing mode with a faster sync loop
//! let mut config = PlaybackSyncConfig::default();
//! config.sync.persistence = PersistenceMode::EventSourcing;
//! config.sync.interval_secs = 60;
//! assert!(config.validate().is_ok());
//! ```

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

use crate::event::Source;
use crate::resilience::{CircuitConfig, RetryConfig};

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("failed to initialize provider: {0}")]
    Provider(String),
}

pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid { field, reason: reason.into() }
}

/// How a processed record reaches durable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PersistenceMode {
    /// Write to the store, then publish a best-effort notification
    #[default]
    Notification,
    /// Publish to the bus (its consumer writes); fall back to a direct write
    EventSourcing,
}

/// Top-level configuration.
///
/// All fields have defaults; sections may be omitted entirely.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct PlaybackSyncConfig {
    /// Server instance component of correlation keys ("default" when unset)
    #[serde(default)]
    pub server_id: Option<String>,

    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub breaker: BreakerSettings,

    #[serde(default)]
    pub geolocation: GeolocationSettings,

    #[serde(default)]
    pub buffer_health: BufferHealthSettings,

    #[serde(default)]
    pub session_polling: SessionPollingSettings,
}

impl PlaybackSyncConfig {
    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sync.batch_size == 0 {
            return Err(invalid("sync.batch_size", "must be greater than zero"));
        }
        if self.sync.retry_attempts == 0 {
            return Err(invalid("sync.retry_attempts", "must be at least 1"));
        }
        if self.sync.interval_secs == 0 {
            return Err(invalid("sync.interval_secs", "must be greater than zero"));
        }
        if self.breaker.min_requests == 0 {
            return Err(invalid("breaker.min_requests", "must be at least 1"));
        }
        if !(self.breaker.failure_ratio > 0.0 && self.breaker.failure_ratio <= 1.0) {
            return Err(invalid("breaker.failure_ratio", format!("{} is outside (0, 1]", self.breaker.failure_ratio)));
        }
        if self.buffer_health.risky_threshold <= self.buffer_health.critical_threshold {
            return Err(invalid("buffer_health.risky_threshold", "must be greater than critical_threshold"));
        }
        if self.buffer_health.poll_interval_secs == 0 {
            return Err(invalid("buffer_health.poll_interval_secs", "must be greater than zero"));
        }
        if self.session_polling.interval_secs < MIN_SESSION_POLL_SECS {
            return Err(invalid(
                "session_polling.interval_secs",
                format!("must be at least {MIN_SESSION_POLL_SECS} seconds"),
            ));
        }
        Ok(())
    }
}

// ========================================
// Sync
// ========================================

#[derive(Debug, Clone, Deserialize)]
pub struct SyncSettings {
    /// Source of the history provider; checked when the orchestrator is built
    #[serde(default)]
    pub source: Source,

    /// Records fetched per page
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Attempts per upstream fetch (including the first)
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: usize,

    /// Base backoff delay, doubled per attempt
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Periodic sync interval
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Window fetched on the first pass when no watermark exists
    #[serde(default = "default_lookback_secs")]
    pub lookback_secs: u64,

    /// Fetch full history (from `history_floor`) on the first pass
    #[serde(default)]
    pub sync_all: bool,

    #[serde(default)]
    pub persistence: PersistenceMode,

    /// Bound on a synchronous bus publish
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,

    /// Run one pass immediately on start
    #[serde(default = "default_true")]
    pub initial_sync: bool,
}

fn default_batch_size() -> usize { 1000 }
fn default_retry_attempts() -> usize { 5 }
fn default_retry_delay_ms() -> u64 { 2_000 }
fn default_interval_secs() -> u64 { 300 }
fn default_lookback_secs() -> u64 { 24 * 60 * 60 }
fn default_publish_timeout_ms() -> u64 { 5_000 }
fn default_true() -> bool { true }

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            source: Source::default(),
            batch_size: default_batch_size(),
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            interval_secs: default_interval_secs(),
            lookback_secs: default_lookback_secs(),
            sync_all: false,
            persistence: PersistenceMode::default(),
            publish_timeout_ms: default_publish_timeout_ms(),
            initial_sync: true,
        }
    }
}

impl SyncSettings {
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    #[must_use]
    pub fn lookback(&self) -> Duration {
        Duration::from_secs(self.lookback_secs)
    }

    #[must_use]
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    #[must_use]
    pub fn retry(&self) -> RetryConfig {
        RetryConfig::upstream(self.retry_attempts, Duration::from_millis(self.retry_delay_ms))
    }

    /// Lower bound for a full-history sync.
    #[must_use]
    pub fn history_floor() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0)
            .single()
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }
}

// ========================================
// Circuit breaker
// ========================================

#[derive(Debug, Clone, Deserialize)]
pub struct BreakerSettings {
    #[serde(default = "default_min_requests")]
    pub min_requests: u32,
    #[serde(default = "default_failure_ratio")]
    pub failure_ratio: f64,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_half_open_max_requests")]
    pub half_open_max_requests: u32,
}

fn default_min_requests() -> u32 { 10 }
fn default_failure_ratio() -> f64 { 0.6 }
fn default_window_secs() -> u64 { 60 }
fn default_cooldown_secs() -> u64 { 120 }
fn default_half_open_max_requests() -> u32 { 3 }

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            min_requests: default_min_requests(),
            failure_ratio: default_failure_ratio(),
            window_secs: default_window_secs(),
            cooldown_secs: default_cooldown_secs(),
            half_open_max_requests: default_half_open_max_requests(),
        }
    }
}

impl BreakerSettings {
    #[must_use]
    pub fn circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            min_requests: self.min_requests,
            failure_ratio: self.failure_ratio,
            window: Duration::from_secs(self.window_secs),
            cooldown: Duration::from_secs(self.cooldown_secs),
            half_open_max_requests: self.half_open_max_requests,
        }
    }
}

// ========================================
// Geolocation
// ========================================

#[derive(Debug, Clone, Deserialize)]
pub struct GeolocationSettings {
    /// Ask the history source's own GeoIP endpoint first
    #[serde(default = "default_true")]
    pub upstream_enabled: bool,
    /// MaxMind GeoLite2 account id (provider disabled when unset)
    #[serde(default)]
    pub maxmind_account_id: Option<String>,
    #[serde(default)]
    pub maxmind_license_key: Option<String>,
    /// Use the free ip-api.com endpoint as a fallback
    #[serde(default = "default_true")]
    pub ip_api_enabled: bool,
    #[serde(default = "default_geo_retry_attempts")]
    pub retry_attempts: usize,
    #[serde(default = "default_geo_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_geo_retry_attempts() -> usize { 2 }
fn default_geo_retry_delay_ms() -> u64 { 500 }

impl Default for GeolocationSettings {
    fn default() -> Self {
        Self {
            upstream_enabled: true,
            maxmind_account_id: None,
            maxmind_license_key: None,
            ip_api_enabled: true,
            retry_attempts: default_geo_retry_attempts(),
            retry_delay_ms: default_geo_retry_delay_ms(),
        }
    }
}

impl GeolocationSettings {
    #[must_use]
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

// ========================================
// Buffer health
// ========================================

#[derive(Debug, Clone, Deserialize)]
pub struct BufferHealthSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_buffer_poll_secs")]
    pub poll_interval_secs: u64,
    /// Fill percentage below which a session is critical
    #[serde(default = "default_critical_threshold")]
    pub critical_threshold: f64,
    /// Fill percentage below which a session is risky
    #[serde(default = "default_risky_threshold")]
    pub risky_threshold: f64,
    /// Buffered seconds that count as a full buffer
    #[serde(default = "default_capacity_secs")]
    pub capacity_secs: f64,
}

fn default_buffer_poll_secs() -> u64 { 5 }
fn default_critical_threshold() -> f64 { 20.0 }
fn default_risky_threshold() -> f64 { 50.0 }
fn default_capacity_secs() -> f64 { 30.0 }

impl Default for BufferHealthSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: default_buffer_poll_secs(),
            critical_threshold: default_critical_threshold(),
            risky_threshold: default_risky_threshold(),
            capacity_secs: default_capacity_secs(),
        }
    }
}

impl BufferHealthSettings {
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

// ========================================
// Session polling
// ========================================

/// Lower bound on the live-session poll interval.
pub const MIN_SESSION_POLL_SECS: u64 = 10;

#[derive(Debug, Clone, Deserialize)]
pub struct SessionPollingSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_session_poll_secs")]
    pub interval_secs: u64,
    /// How long an emitted session is suppressed
    #[serde(default = "default_seen_ttl_secs")]
    pub seen_ttl_secs: u64,
    #[serde(default = "default_seen_max_entries")]
    pub seen_max_entries: usize,
    /// Emit every session on every poll (disables suppression)
    #[serde(default)]
    pub publish_all: bool,
}

fn default_session_poll_secs() -> u64 { 30 }
fn default_seen_ttl_secs() -> u64 { 300 }
fn default_seen_max_entries() -> usize { 10_000 }

impl Default for SessionPollingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_session_poll_secs(),
            seen_ttl_secs: default_seen_ttl_secs(),
            seen_max_entries: default_seen_max_entries(),
            publish_all: false,
        }
    }
}

impl SessionPollingSettings {
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(MIN_SESSION_POLL_SECS))
    }

    #[must_use]
    pub fn seen_ttl(&self) -> Duration {
        Duration::from_secs(self.seen_ttl_secs)
    }

    /// Sweep cadence for the seen cache: half the TTL, at least one second.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs((self.seen_ttl_secs / 2).max(1))
    }
}
