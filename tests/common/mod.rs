//! Test doubles shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;

use playback_sync::{
    BusError, EventBus, GeoProvider, Geolocation, HistoryProvider, HistoryRecord, InMemoryStore, PlaybackEvent,
    PlaybackMetadata, PlaybackStore, PlaybackSyncConfig, ProviderError, Source, StorageError,
};

// =============================================================================
// Records and config
// =============================================================================

pub fn record(n: usize, ip: &str) -> HistoryRecord {
    HistoryRecord {
        row_id: Some(n as i64),
        session_key: Some(format!("session-{n}")),
        started_at: Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap() + chrono::Duration::seconds(n as i64),
        stopped_at: None,
        user_id: (n % 7) as i64,
        username: format!("user{}", n % 7),
        ip_address: Some(ip.to_string()),
        rating_key: Some(format!("{}", 1000 + n)),
        title: format!("Title {n}"),
        media_type: "episode".into(),
        machine_id: Some(format!("device-{}", n % 3)),
        metadata: PlaybackMetadata::default(),
    }
}

/// `count` records on private addresses (no geolocation network traffic).
pub fn records(count: usize) -> Vec<HistoryRecord> {
    (0..count).map(|n| record(n, &format!("192.168.1.{}", n % 250 + 1))).collect()
}

/// Defaults with fast retries and no external geolocation provider.
pub fn test_config(batch_size: usize) -> PlaybackSyncConfig {
    let mut config = PlaybackSyncConfig::default();
    config.sync.batch_size = batch_size;
    config.sync.retry_attempts = 2;
    config.sync.retry_delay_ms = 1;
    config.sync.initial_sync = false;
    config.geolocation.ip_api_enabled = false;
    config.session_polling.enabled = false;
    config.buffer_health.enabled = false;
    config
}

// =============================================================================
// History provider
// =============================================================================

/// Serves a fixed record list by offset; can fail, or hold a fetch open.
pub struct PagedHistory {
    records: Mutex<Vec<HistoryRecord>>,
    calls: AtomicUsize,
    sinces: Mutex<Vec<DateTime<Utc>>>,
    failing: AtomicBool,
    gate: Option<Arc<Gate>>,
}

/// Parks a fetch until released.
#[derive(Default)]
pub struct Gate {
    pub entered: Notify,
    pub release: Notify,
}

impl PagedHistory {
    pub fn new(records: Vec<HistoryRecord>) -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(records),
            calls: AtomicUsize::new(0),
            sinces: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
            gate: None,
        })
    }

    pub fn gated(records: Vec<HistoryRecord>, gate: Arc<Gate>) -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(records),
            calls: AtomicUsize::new(0),
            sinces: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
            gate: Some(gate),
        })
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_records(&self, records: Vec<HistoryRecord>) {
        *self.records.lock() = records;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn sinces(&self) -> Vec<DateTime<Utc>> {
        self.sinces.lock().clone()
    }
}

#[async_trait]
impl HistoryProvider for PagedHistory {
    fn source(&self) -> Source {
        Source::Tautulli
    }

    async fn fetch_history_since(
        &self,
        since: DateTime<Utc>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<HistoryRecord>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.sinces.lock().push(since);
        if let Some(gate) = &self.gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(ProviderError::Status { provider: "tautulli".into(), status: 503 });
        }
        let records = self.records.lock();
        Ok(records.iter().skip(offset).take(limit).cloned().collect())
    }

    async fn lookup_geoip(&self, _ip: IpAddr) -> Result<Geolocation, ProviderError> {
        Err(ProviderError::NotConfigured("tautulli geoip".into()))
    }

    async fn ping(&self) -> Result<(), ProviderError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ProviderError::Transport("connection refused".into()));
        }
        Ok(())
    }
}

// =============================================================================
// Failing store
// =============================================================================

/// Wraps [`InMemoryStore`] and fails `insert_event` on chosen call numbers
/// (1-indexed), or on every call.
pub struct FailingStore {
    pub inner: InMemoryStore,
    insert_calls: AtomicU64,
    fail_on_calls: Vec<u64>,
    fail_all: AtomicBool,
}

impl FailingStore {
    pub fn new(fail_on_calls: Vec<u64>) -> Arc<Self> {
        Arc::new(Self {
            inner: InMemoryStore::new(),
            insert_calls: AtomicU64::new(0),
            fail_on_calls,
            fail_all: AtomicBool::new(false),
        })
    }

    pub fn always_failing() -> Arc<Self> {
        let store = Self::new(Vec::new());
        store.fail_all.store(true, Ordering::SeqCst);
        store
    }

    pub fn insert_calls(&self) -> u64 {
        self.insert_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PlaybackStore for FailingStore {
    async fn record_exists(&self, session_key: &str) -> Result<bool, StorageError> {
        self.inner.record_exists(session_key).await
    }

    async fn get_location(&self, ip: &str) -> Result<Option<Geolocation>, StorageError> {
        self.inner.get_location(ip).await
    }

    async fn get_locations(&self, ips: &[String]) -> Result<HashMap<String, Geolocation>, StorageError> {
        self.inner.get_locations(ips).await
    }

    async fn upsert_location(&self, geo: &Geolocation) -> Result<(), StorageError> {
        self.inner.upsert_location(geo).await
    }

    async fn insert_event(&self, event: &PlaybackEvent) -> Result<(), StorageError> {
        let call = self.insert_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_all.load(Ordering::SeqCst) || self.fail_on_calls.contains(&call) {
            return Err(StorageError::Backend(format!("injected failure on insert {call}")));
        }
        self.inner.insert_event(event).await
    }
}

// =============================================================================
// Buses
// =============================================================================

/// Bus that always fails, counting attempts.
#[derive(Default)]
pub struct DownBus {
    pub attempts: AtomicUsize,
}

#[async_trait]
impl EventBus for DownBus {
    async fn publish(&self, _event: &PlaybackEvent) -> Result<(), BusError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(BusError::Publish("broker unreachable".into()))
    }
}

/// Bus that never answers.
pub struct HangingBus;

#[async_trait]
impl EventBus for HangingBus {
    async fn publish(&self, _event: &PlaybackEvent) -> Result<(), BusError> {
        std::future::pending().await
    }
}

// =============================================================================
// Geolocation provider
// =============================================================================

/// Geo provider answering from a fixed table; unknown addresses fail.
pub struct TableGeo {
    pub table: HashMap<String, Geolocation>,
    pub calls: AtomicUsize,
    pub delay: Duration,
}

impl TableGeo {
    pub fn new(entries: &[(&str, Geolocation)]) -> Arc<Self> {
        Arc::new(Self {
            table: entries.iter().map(|(ip, geo)| (ip.to_string(), geo.clone())).collect(),
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
        })
    }
}

#[async_trait]
impl GeoProvider for TableGeo {
    fn name(&self) -> &str {
        "table"
    }

    fn is_available(&self) -> bool {
        true
    }

    async fn lookup(&self, ip: IpAddr) -> Result<Geolocation, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.table
            .get(&ip.to_string())
            .cloned()
            .ok_or(ProviderError::Status { provider: "table".into(), status: 404 })
    }
}
