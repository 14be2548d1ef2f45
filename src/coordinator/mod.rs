// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync orchestrator.
//!
//! The [`SyncOrchestrator`] ties together all components:
//! - A guarded history provider, fetched in fixed-size batches
//! - The per-record pipeline (dedup, geolocation, persistence)
//! - Optional live session polling and buffer health monitoring
//!
//! # Lifecycle
//!
//! ```text
//! Created → Starting → Running → Stopping → Stopped
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use playback_sync::{InMemoryStore, OrchestratorState, PlaybackSyncConfig, SyncOrchestrator};
//! # use playback_sync::HistoryProvider;
//!
//! # async fn demo(provider: Arc<dyn HistoryProvider>) {
//! let store = Arc::new(InMemoryStore::new());
//! let orchestrator = SyncOrchestrator::builder(PlaybackSyncConfig::default(), store, provider)
//!     .build()
//!     .expect("valid config");
//!
//! assert_eq!(orchestrator.state(), OrchestratorState::Created);
//! let report = orchestrator.trigger_sync().await.expect("sync failed");
//! println!("persisted {} events", report.persisted);
//! # }
//! ```

mod lifecycle;
mod pass;
pub(crate) mod pipeline;
mod types;

pub use types::{
    BatchResult, DedupPolicy, HealthCheck, OrchestratorState, PersistError, PersistPath, RecordOutcome, SkipReason,
    SyncError, SyncReport,
};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex as SyncMutex, RwLock};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::bus::EventBus;
use crate::config::{invalid, ConfigError, PersistenceMode, PlaybackSyncConfig};
use crate::geolocation::GeoResolver;
use crate::poller::SessionPoller;
use crate::resilience::{CircuitState, ProtectedCall};
use crate::storage::traits::PlaybackStore;
use crate::telemetry::BufferHealthMonitor;
use crate::upstream::{BroadcastSink, HistoryProvider, SessionProvider};

use pipeline::RecordPipeline;

/// Watermark and pass status, guarded separately from the pass lock.
#[derive(Debug, Default)]
struct SyncStatus {
    watermark: Option<DateTime<Utc>>,
    running: bool,
    last_report: Option<SyncReport>,
}

/// Drives periodic and on-demand reconciliation passes.
///
/// # Thread Safety
///
/// The orchestrator is `Send + Sync` and shared as `Arc<SyncOrchestrator>`.
/// Passes are serialized by an async mutex; status reads never wait on a
/// running pass.
pub struct SyncOrchestrator {
    pub(super) config: PlaybackSyncConfig,

    pub(super) history: Arc<dyn HistoryProvider>,

    /// Breaker + retry for every history provider call
    pub(super) upstream: ProtectedCall,

    pub(super) pipeline: Arc<RecordPipeline>,

    pub(super) broadcast: Option<Arc<dyn BroadcastSink>>,

    pub(super) poller: Option<Arc<SessionPoller>>,

    pub(super) monitor: Option<Arc<BufferHealthMonitor>>,

    /// Held for the duration of a pass
    pub(super) pass_lock: Mutex<()>,

    status: RwLock<SyncStatus>,

    /// Lifecycle state (broadcast to watchers)
    pub(super) state: watch::Sender<OrchestratorState>,

    /// Latest completed pass
    pub(super) completions: watch::Sender<Option<SyncReport>>,

    pub(super) cancel: CancellationToken,

    pub(super) tasks: SyncMutex<Vec<JoinHandle<()>>>,
}

impl SyncOrchestrator {
    /// Start building an orchestrator around the primary history provider.
    pub fn builder(
        config: PlaybackSyncConfig,
        store: Arc<dyn PlaybackStore>,
        history: Arc<dyn HistoryProvider>,
    ) -> SyncOrchestratorBuilder {
        SyncOrchestratorBuilder {
            config,
            store,
            history,
            bus: None,
            resolver: None,
            broadcast: None,
            sessions: None,
        }
    }

    /// Get current lifecycle state.
    #[must_use]
    pub fn state(&self) -> OrchestratorState {
        *self.state.borrow()
    }

    /// Get a receiver to watch state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<OrchestratorState> {
        self.state.subscribe()
    }

    pub(super) fn set_state(&self, state: OrchestratorState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            info!(from = %previous, to = %state, "Orchestrator state changed");
            crate::metrics::record_state_transition(&state.to_string());
        }
    }

    /// Whether a sync pass is executing right now.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.status.read().running
    }

    /// Start time of the last successful pass (the current watermark).
    #[must_use]
    pub fn last_sync_time(&self) -> Option<DateTime<Utc>> {
        self.status.read().watermark
    }

    /// Summary of the last successful pass.
    #[must_use]
    pub fn last_report(&self) -> Option<SyncReport> {
        self.status.read().last_report.clone()
    }

    /// Receiver that observes every completed pass.
    #[must_use]
    pub fn subscribe_completions(&self) -> watch::Receiver<Option<SyncReport>> {
        self.completions.subscribe()
    }

    /// State of the breaker guarding the history provider.
    #[must_use]
    pub fn upstream_circuit(&self) -> CircuitState {
        self.upstream.breaker().state()
    }

    #[must_use]
    pub fn resolver(&self) -> &GeoResolver {
        self.pipeline.resolver()
    }

    #[must_use]
    pub fn session_poller(&self) -> Option<&Arc<SessionPoller>> {
        self.poller.as_ref()
    }

    #[must_use]
    pub fn buffer_monitor(&self) -> Option<&Arc<BufferHealthMonitor>> {
        self.monitor.as_ref()
    }

    /// Perform a health check.
    ///
    /// Pings the history provider through its breaker (no retries) and
    /// collects cached state.
    pub async fn health_check(&self) -> HealthCheck {
        let state = self.state();
        let start = std::time::Instant::now();
        let ping = self.upstream.breaker().call(|| self.history.ping()).await;
        let latency_ms = start.elapsed().as_millis() as u64;

        let (upstream_reachable, upstream_latency_ms, upstream_error) = match ping {
            Ok(()) => (true, Some(latency_ms), None),
            Err(e) => (false, None, Some(e.to_string())),
        };
        let circuit = self.upstream_circuit();
        let status = self.status.read();

        HealthCheck {
            state,
            syncing: status.running,
            upstream_reachable,
            upstream_latency_ms,
            upstream_error,
            upstream_circuit: circuit.to_string(),
            last_sync_time: status.watermark,
            last_report: status.last_report.clone(),
            geo_cache_entries: self.resolver().cached_len(),
            seen_sessions: self.poller.as_ref().map(|p| p.seen_len()),
            healthy: state == OrchestratorState::Running && upstream_reachable && circuit != CircuitState::Open,
        }
    }
}

/// Builder for [`SyncOrchestrator`].
pub struct SyncOrchestratorBuilder {
    config: PlaybackSyncConfig,
    store: Arc<dyn PlaybackStore>,
    history: Arc<dyn HistoryProvider>,
    bus: Option<Arc<dyn EventBus>>,
    resolver: Option<Arc<GeoResolver>>,
    broadcast: Option<Arc<dyn BroadcastSink>>,
    sessions: Option<Arc<dyn SessionProvider>>,
}

impl SyncOrchestratorBuilder {
    #[must_use]
    pub fn with_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Use a prepared resolver instead of one built from the geolocation settings.
    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<GeoResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    #[must_use]
    pub fn with_broadcast(mut self, sink: Arc<dyn BroadcastSink>) -> Self {
        self.broadcast = Some(sink);
        self
    }

    /// Live session feed for the poller and the buffer health monitor.
    #[must_use]
    pub fn with_session_provider(mut self, provider: Arc<dyn SessionProvider>) -> Self {
        self.sessions = Some(provider);
        self
    }

    pub fn build(self) -> Result<Arc<SyncOrchestrator>, ConfigError> {
        let config = self.config;
        config.validate()?;
        if config.sync.persistence == PersistenceMode::EventSourcing && self.bus.is_none() {
            return Err(invalid("sync.persistence", "event_sourcing requires an event bus"));
        }
        let reported = self.history.source();
        if config.sync.source != reported {
            return Err(invalid(
                "sync.source",
                format!("configured as {} but the history provider is {reported}", config.sync.source),
            ));
        }

        let circuit = config.breaker.circuit_config();
        let resolver = match self.resolver {
            Some(resolver) => resolver,
            None => Arc::new(
                GeoResolver::from_settings(
                    self.store.clone(),
                    &config.geolocation,
                    circuit.clone(),
                    Some(self.history.clone()),
                )
                .map_err(|e| ConfigError::Provider(e.to_string()))?,
            ),
        };

        let pipeline = Arc::new(RecordPipeline::new(
            config.server_id.clone(),
            self.store,
            self.bus,
            resolver,
            config.sync.persistence,
            config.sync.publish_timeout(),
        ));

        let upstream = ProtectedCall::new(self.history.source().as_str(), circuit.clone(), config.sync.retry());

        let (poller, monitor) = match self.sessions {
            Some(provider) => {
                let guard = Arc::new(ProtectedCall::new(
                    format!("{}-sessions", provider.source()),
                    circuit,
                    config.sync.retry(),
                ));
                let poller = config.session_polling.enabled.then(|| {
                    Arc::new(SessionPoller::new(
                        provider.clone(),
                        guard.clone(),
                        pipeline.clone(),
                        &config.session_polling,
                    ))
                });
                let monitor = config.buffer_health.enabled.then(|| {
                    Arc::new(BufferHealthMonitor::new(
                        provider.clone(),
                        guard.clone(),
                        config.buffer_health.clone(),
                        self.broadcast.clone(),
                    ))
                });
                (poller, monitor)
            }
            None => (None, None),
        };

        let (state, _) = watch::channel(OrchestratorState::Created);
        let (completions, _) = watch::channel(None);

        Ok(Arc::new(SyncOrchestrator {
            config,
            history: self.history,
            upstream,
            pipeline,
            broadcast: self.broadcast,
            poller,
            monitor,
            pass_lock: Mutex::new(()),
            status: RwLock::new(SyncStatus::default()),
            state,
            completions,
            cancel: CancellationToken::new(),
            tasks: SyncMutex::new(Vec::new()),
        }))
    }
}
