//! Public types for the sync orchestrator.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use crate::bus::BusError;
use crate::resilience::GuardError;
use crate::storage::traits::StorageError;
use crate::upstream::ProviderError;

/// Orchestrator lifecycle state.
///
/// Use [`super::SyncOrchestrator::state()`] to check current state or
/// [`super::SyncOrchestrator::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OrchestratorState {
    /// Just built, not yet started
    Created,
    /// Spawning background tasks
    Starting,
    /// Background tasks running
    Running,
    /// Cancelling and awaiting background tasks
    Stopping,
    /// All background tasks have exited
    Stopped,
}

impl std::fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Starting => write!(f, "Starting"),
            Self::Running => write!(f, "Running"),
            Self::Stopping => write!(f, "Stopping"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

#[derive(Error, Debug)]
pub enum SyncError {
    /// Another pass holds the pass lock; this call did no work
    #[error("a sync pass is already in progress")]
    PassInProgress,

    /// A batch could not be fetched; the pass was aborted and the
    /// watermark left where it was
    #[error("failed to fetch history batch at offset {offset}: {source}")]
    Fetch {
        offset: usize,
        #[source]
        source: GuardError<ProviderError>,
    },

    #[error("sync cancelled")]
    Cancelled,

    #[error("cannot {action} orchestrator in state {state}")]
    InvalidState {
        action: &'static str,
        state: OrchestratorState,
    },
}

/// Failure to persist one event.
#[derive(Error, Debug)]
pub enum PersistError {
    /// The store already holds an event with this correlation key
    #[error("event {0} already persisted")]
    Duplicate(String),

    #[error("store write failed: {0}")]
    Store(#[source] StorageError),

    /// Event-sourcing publish failed and so did the fallback write
    #[error("publish failed ({publish}) and fallback write failed ({store})")]
    Both { publish: BusError, store: StorageError },
}

impl From<StorageError> for PersistError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Duplicate(key) => Self::Duplicate(key),
            other => Self::Store(other),
        }
    }
}

/// How a persisted event reached durable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistPath {
    /// Written directly to the store (notification mode)
    Store,
    /// Handed to the event bus, whose consumer writes it
    Bus,
    /// Bus publish failed; written directly instead
    Fallback,
}

impl PersistPath {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Store => "store",
            Self::Bus => "bus",
            Self::Fallback => "fallback",
        }
    }
}

/// Why a record produced no new event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Missing, empty or unparsable client address
    InvalidAddress,
    /// The store already has this session key
    AlreadyProcessed,
    /// The store rejected the correlation key as a duplicate
    Duplicate,
}

/// Result of running one record through the pipeline.
#[derive(Debug)]
pub enum RecordOutcome {
    Persisted(PersistPath),
    Skipped(SkipReason),
    Failed(PersistError),
}

/// Whether the pipeline consults the store's session-key index before
/// processing a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupPolicy {
    /// Batch sources: skip records whose session key is already stored
    Durable,
    /// Live pollers: rely on correlation-key uniqueness at the store only
    CorrelationOnly,
}

/// Tally of a processed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchResult {
    /// Total records in the batch
    pub total: usize,
    /// Records that produced a new event
    pub persisted: usize,
    /// Records skipped as invalid or already processed
    pub skipped: usize,
    /// Records whose event could not be persisted
    pub failed: usize,
}

impl BatchResult {
    /// Check if no record failed
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    pub(crate) fn record(&mut self, outcome: &RecordOutcome) {
        self.total += 1;
        match outcome {
            RecordOutcome::Persisted(_) => self.persisted += 1,
            RecordOutcome::Skipped(_) => self.skipped += 1,
            RecordOutcome::Failed(_) => self.failed += 1,
        }
    }
}

/// Summary of a completed sync pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncReport {
    /// Pass start; becomes the next watermark
    pub started_at: DateTime<Utc>,
    /// Lower bound the pass fetched from
    pub since: DateTime<Utc>,
    /// Number of fetch calls made
    pub batches: usize,
    /// Records seen across all batches
    pub fetched: usize,
    pub persisted: usize,
    pub skipped: usize,
    pub failed: usize,
    pub duration: Duration,
}

impl SyncReport {
    pub(crate) fn new(started_at: DateTime<Utc>, since: DateTime<Utc>) -> Self {
        Self {
            started_at,
            since,
            batches: 0,
            fetched: 0,
            persisted: 0,
            skipped: 0,
            failed: 0,
            duration: Duration::ZERO,
        }
    }

    pub(crate) fn absorb(&mut self, batch: &BatchResult) {
        self.fetched += batch.total;
        self.persisted += batch.persisted;
        self.skipped += batch.skipped;
        self.failed += batch.failed;
    }
}

/// Point-in-time health of the orchestrator.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub state: OrchestratorState,
    /// A pass is executing right now
    pub syncing: bool,
    /// Upstream answered a ping
    pub upstream_reachable: bool,
    pub upstream_latency_ms: Option<u64>,
    pub upstream_error: Option<String>,
    /// Breaker guarding the history provider
    pub upstream_circuit: String,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub last_report: Option<SyncReport>,
    /// Addresses held in the resolver's memory cache
    pub geo_cache_entries: usize,
    /// Sessions held by the live poller's seen cache
    pub seen_sessions: Option<usize>,
    /// Running, upstream reachable and its circuit not open
    pub healthy: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_orchestrator_state_display() {
        assert_eq!(format!("{}", OrchestratorState::Created), "Created");
        assert_eq!(format!("{}", OrchestratorState::Running), "Running");
        assert_eq!(format!("{}", OrchestratorState::Stopped), "Stopped");
    }

    #[test]
    fn test_batch_result_tally() {
        let mut batch = BatchResult::default();
        batch.record(&RecordOutcome::Persisted(PersistPath::Store));
        batch.record(&RecordOutcome::Skipped(SkipReason::InvalidAddress));
        assert!(batch.is_success());

        batch.record(&RecordOutcome::Failed(PersistError::Store(StorageError::Backend("down".into()))));
        assert_eq!(batch, BatchResult { total: 3, persisted: 1, skipped: 1, failed: 1 });
        assert!(!batch.is_success());
    }

    #[test]
    fn test_report_absorbs_batches() {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut report = SyncReport::new(t, t);
        report.absorb(&BatchResult { total: 10, persisted: 7, skipped: 2, failed: 1 });
        report.absorb(&BatchResult { total: 3, persisted: 3, skipped: 0, failed: 0 });
        assert_eq!((report.fetched, report.persisted, report.skipped, report.failed), (13, 10, 2, 1));
    }

    #[test]
    fn test_storage_duplicate_maps_to_persist_duplicate() {
        let err: PersistError = StorageError::Duplicate("k".into()).into();
        assert!(matches!(err, PersistError::Duplicate(ref k) if k == "k"));
    }
}
