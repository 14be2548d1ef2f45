//! # Playback Sync
//!
//! A sync and reconciliation engine for media-server playback activity.
//!
//! ## Architecture
//!
//! Playback records arrive from a primary history provider (batch) and from
//! real-time session providers (polled). Every record flows through one
//! pipeline and becomes at most one canonical [`PlaybackEvent`]:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Sync Orchestrator                       │
//! │  • Periodic + on-demand passes, never overlapping          │
//! │  • Batched fetch, watermark advanced only on success       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!              (every upstream call via ProtectedCall)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Resilience Layer                        │
//! │  • Ratio circuit breaker per dependency                    │
//! │  • Cancellable exponential backoff retry                   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Per-record pipeline                      │
//! │  • Address validation, durable session dedup               │
//! │  • Geolocation: local sentinel → cache → providers         │
//! │  • Correlation key, store-first or bus-first persistence   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use playback_sync::{BroadcastBus, InMemoryStore, PersistenceMode, PlaybackSyncConfig, SyncOrchestrator};
//! # use playback_sync::HistoryProvider;
//!
//! # async fn run(provider: Arc<dyn HistoryProvider>) {
//! let mut config = PlaybackSyncConfig::default();
//! config.sync.persistence = PersistenceMode::EventSourcing;
//!
//! let store = Arc::new(InMemoryStore::new());
//! let bus = Arc::new(BroadcastBus::default());
//! let cancel = tokio_util::sync::CancellationToken::new();
//! let writer = playback_sync::bus::spawn_store_writer(&bus, store.clone(), cancel.clone());
//!
//! let orchestrator = SyncOrchestrator::builder(config, store, provider)
//!     .with_bus(bus)
//!     .build()
//!     .expect("valid config");
//!
//! orchestrator.start().expect("start once");
//! // ...
//! orchestrator.stop().await;
//! cancel.cancel();
//! writer.await.ok();
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`coordinator`]: The [`SyncOrchestrator`] and the per-record pipeline
//! - [`resilience`]: Circuit breaker, retry, and their composition
//! - [`geolocation`]: Address handling, providers, and the [`GeoResolver`]
//! - [`correlation`]: Correlation keys and the seen-session cache
//! - [`poller`]: Live session polling
//! - [`telemetry`]: Buffer health prediction
//! - [`storage`]: Store interface and the in-memory store
//! - [`bus`]: Event bus interface and the in-process bus

pub mod bus;
pub mod config;
pub mod coordinator;
pub mod correlation;
pub mod event;
pub mod geolocation;
pub mod metrics;
pub mod poller;
pub mod resilience;
pub mod storage;
pub mod telemetry;
pub mod upstream;

// Note: We don't expose a `tracing` module to avoid conflict with the tracing crate

pub use bus::{BroadcastBus, BusError, EventBus};
pub use config::{
    BreakerSettings, BufferHealthSettings, ConfigError, GeolocationSettings, PersistenceMode, PlaybackSyncConfig,
    SessionPollingSettings, SyncSettings,
};
pub use coordinator::{
    BatchResult, DedupPolicy, HealthCheck, OrchestratorState, PersistError, PersistPath, RecordOutcome, SkipReason,
    SyncError, SyncOrchestrator, SyncOrchestratorBuilder, SyncReport,
};
pub use correlation::{CorrelationKey, CorrelationParts, SeenSessionCache};
pub use event::{ActiveSession, HistoryRecord, PlaybackEvent, PlaybackMetadata, Source, TranscodeProgress};
pub use geolocation::{
    GeoProvider, GeoResolver, Geolocation, IpApiProvider, MaxMindProvider, UpstreamGeoProvider,
};
pub use metrics::LatencyTimer;
pub use poller::{PollReport, SessionPoller};
pub use resilience::{
    CircuitBreaker, CircuitConfig, CircuitError, CircuitState, GuardError, ProtectedCall, RetryConfig, RetryError,
};
pub use storage::memory::InMemoryStore;
pub use storage::traits::{PlaybackStore, StorageError};
pub use telemetry::{BufferHealth, BufferHealthMonitor, BufferMetrics, HealthStatus};
pub use upstream::{BroadcastSink, HistoryProvider, ProviderError, SessionProvider};
