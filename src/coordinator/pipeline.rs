//! Per-record pipeline: validate → dedup → geolocate → build → persist.
//!
//! Shared by the batch sync pass and the live session poller.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::types::{BatchResult, DedupPolicy, PersistError, PersistPath, RecordOutcome, SkipReason};
use crate::bus::{BusError, EventBus};
use crate::config::PersistenceMode;
use crate::event::{HistoryRecord, PlaybackEvent, Source};
use crate::geolocation::{address, GeoResolver, Geolocation};
use crate::storage::traits::PlaybackStore;

pub(crate) struct RecordPipeline {
    server_id: Option<String>,
    store: Arc<dyn PlaybackStore>,
    bus: Option<Arc<dyn EventBus>>,
    resolver: Arc<GeoResolver>,
    mode: PersistenceMode,
    publish_timeout: Duration,
}

impl RecordPipeline {
    pub(crate) fn new(
        server_id: Option<String>,
        store: Arc<dyn PlaybackStore>,
        bus: Option<Arc<dyn EventBus>>,
        resolver: Arc<GeoResolver>,
        mode: PersistenceMode,
        publish_timeout: Duration,
    ) -> Self {
        Self {
            server_id,
            store,
            bus,
            resolver,
            mode,
            publish_timeout,
        }
    }

    pub(crate) fn resolver(&self) -> &GeoResolver {
        &self.resolver
    }

    /// Process a batch in order. Locations for every distinct address are
    /// resolved up front; per-record failures never abort the batch.
    pub(crate) async fn process_batch(
        &self,
        records: &[HistoryRecord],
        source: Source,
        dedup: DedupPolicy,
        cancel: &CancellationToken,
    ) -> BatchResult {
        let addresses: Vec<String> = records.iter().filter_map(|r| r.ip_address.clone()).collect();
        let locations = self.resolver.resolve_many(&addresses, cancel).await;

        let mut result = BatchResult::default();
        for record in records {
            let outcome = self.process_with(record, source, dedup, &locations, cancel).await;
            result.record(&outcome);
        }

        crate::metrics::record_records("persisted", result.persisted);
        crate::metrics::record_records("skipped", result.skipped);
        crate::metrics::record_records("failed", result.failed);
        result
    }

    /// Process a single record, resolving its location on demand.
    pub(crate) async fn process(
        &self,
        record: &HistoryRecord,
        source: Source,
        dedup: DedupPolicy,
        cancel: &CancellationToken,
    ) -> RecordOutcome {
        self.process_with(record, source, dedup, &HashMap::new(), cancel).await
    }

    async fn process_with(
        &self,
        record: &HistoryRecord,
        source: Source,
        dedup: DedupPolicy,
        locations: &HashMap<String, Geolocation>,
        cancel: &CancellationToken,
    ) -> RecordOutcome {
        let Some(ip) = record.ip_address.as_deref().and_then(address::parse) else {
            debug!(%source, user_id = record.user_id, title = %record.title, "Skipping record without a usable address");
            return RecordOutcome::Skipped(SkipReason::InvalidAddress);
        };
        let ip_address = ip.to_string();
        let session_key = record.effective_session_key(source);

        if dedup == DedupPolicy::Durable {
            match self.store.record_exists(&session_key).await {
                Ok(true) => {
                    debug!(%source, session_key = %session_key, "Skipping already processed session");
                    return RecordOutcome::Skipped(SkipReason::AlreadyProcessed);
                }
                Ok(false) => {}
                // Correlation-key uniqueness at the store still rejects a replay
                Err(e) => warn!(session_key = %session_key, error = %e, "Session existence check failed, processing anyway"),
            }
        }

        let location = match locations.get(&ip_address) {
            Some(geo) => geo.clone(),
            None => self.resolver.resolve(&ip_address, cancel).await,
        };

        let event = PlaybackEvent::from_record(record, source, self.server_id.as_deref(), ip_address, location);

        match self.persist(&event).await {
            Ok(path) => {
                crate::metrics::record_persist_path(path.as_str());
                RecordOutcome::Persisted(path)
            }
            Err(PersistError::Duplicate(key)) => {
                debug!(%key, "Event already persisted");
                RecordOutcome::Skipped(SkipReason::Duplicate)
            }
            Err(e) => {
                if matches!(e, PersistError::Both { .. }) {
                    error!(key = %event.correlation_key, error = %e, "Event lost: publish and fallback write both failed");
                } else {
                    warn!(key = %event.correlation_key, error = %e, "Failed to persist event");
                }
                RecordOutcome::Failed(e)
            }
        }
    }

    /// Persist one event under the configured mode.
    ///
    /// Event-sourcing: publish first; only when the publish fails is the
    /// event written directly, with the same correlation key. Exactly one of
    /// the two paths is responsible for the durable write.
    pub(crate) async fn persist(&self, event: &PlaybackEvent) -> Result<PersistPath, PersistError> {
        match (self.mode, &self.bus) {
            (PersistenceMode::EventSourcing, Some(bus)) => match self.publish(bus.as_ref(), event).await {
                Ok(()) => Ok(PersistPath::Bus),
                Err(publish) => {
                    warn!(key = %event.correlation_key, error = %publish, "Publish failed, writing event directly");
                    crate::metrics::record_bus_failure(bus_failure_reason(&publish));
                    let _timer = crate::time_operation!("store", "insert_event");
                    match self.store.insert_event(event).await {
                        Ok(()) => Ok(PersistPath::Fallback),
                        Err(store) => match PersistError::from(store) {
                            PersistError::Store(store) => Err(PersistError::Both { publish, store }),
                            other => Err(other),
                        },
                    }
                }
            },
            (_, bus) => {
                {
                    let _timer = crate::time_operation!("store", "insert_event");
                    self.store.insert_event(event).await?;
                }
                if let Some(bus) = bus {
                    if let Err(e) = self.publish(bus.as_ref(), event).await {
                        warn!(key = %event.correlation_key, error = %e, "Notification publish failed");
                        crate::metrics::record_bus_failure(bus_failure_reason(&e));
                    }
                }
                Ok(PersistPath::Store)
            }
        }
    }

    async fn publish(&self, bus: &dyn EventBus, event: &PlaybackEvent) -> Result<(), BusError> {
        let _timer = crate::time_operation!("bus", "publish");
        match tokio::time::timeout(self.publish_timeout, bus.publish(event)).await {
            Ok(result) => result,
            Err(_) => Err(BusError::Timeout(self.publish_timeout)),
        }
    }
}

fn bus_failure_reason(err: &BusError) -> &'static str {
    match err {
        BusError::NotConnected => "not_connected",
        BusError::Timeout(_) => "timeout",
        BusError::Publish(_) => "publish",
    }
}
