//! Chaos Testing for the Sync Orchestrator
//!
//! Failure scenarios driven by fault-injecting collaborators:
//! 1. **FailingStore** - precise insert failures at specific call counts
//! 2. **DownBus / HangingBus** - event bus unreachable or unresponsive
//! 3. **PagedHistory::set_failing** - upstream outage, breaker trips
//!
//! # Running Chaos Tests
//! ```bash
//! cargo test --test chaos -- --nocapture
//! ```

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use playback_sync::{
    CircuitState, GeoResolver, Geolocation, GuardError, InMemoryStore, OrchestratorState, PersistenceMode,
    RetryConfig, SyncError, SyncOrchestrator,
};

use common::{record, records, test_config, DownBus, FailingStore, HangingBus, PagedHistory, TableGeo};

// =============================================================================
// Persistence failures
// =============================================================================

#[tokio::test]
async fn chaos_store_failures_do_not_abort_batch() {
    let store = FailingStore::new(vec![2, 4]);
    let orchestrator = SyncOrchestrator::builder(test_config(10), store.clone(), PagedHistory::new(records(5)))
        .build()
        .unwrap();

    let report = orchestrator.trigger_sync().await.unwrap();

    assert_eq!(report.fetched, 5);
    assert_eq!(report.persisted, 3);
    assert_eq!(report.failed, 2);
    assert_eq!(store.inner.event_count(), 3);
    // Per-record failures still count as a successful pass
    assert_eq!(orchestrator.last_sync_time(), Some(report.started_at));
}

#[tokio::test]
async fn chaos_event_sourcing_bus_down_writes_exactly_once() {
    let mut config = test_config(10);
    config.sync.persistence = PersistenceMode::EventSourcing;
    let store = FailingStore::new(Vec::new());
    let bus = Arc::new(DownBus::default());

    let orchestrator = SyncOrchestrator::builder(config, store.clone(), PagedHistory::new(records(7)))
        .with_bus(bus.clone())
        .build()
        .unwrap();

    let report = orchestrator.trigger_sync().await.unwrap();

    assert_eq!(report.persisted, 7);
    assert_eq!(bus.attempts.load(Ordering::SeqCst), 7);
    assert_eq!(store.insert_calls(), 7);
    assert_eq!(store.inner.event_count(), 7);
}

#[tokio::test(start_paused = true)]
async fn chaos_event_sourcing_bus_hangs_falls_back_after_timeout() {
    let mut config = test_config(10);
    config.sync.persistence = PersistenceMode::EventSourcing;
    config.sync.publish_timeout_ms = 250;
    let store = FailingStore::new(Vec::new());

    let orchestrator = SyncOrchestrator::builder(config, store.clone(), PagedHistory::new(records(3)))
        .with_bus(Arc::new(HangingBus))
        .build()
        .unwrap();

    let report = orchestrator.trigger_sync().await.unwrap();

    assert_eq!(report.persisted, 3);
    assert_eq!(store.insert_calls(), 3);
}

#[tokio::test]
async fn chaos_bus_and_store_both_down_fail_records_only() {
    let mut config = test_config(10);
    config.sync.persistence = PersistenceMode::EventSourcing;
    let store = FailingStore::always_failing();

    let orchestrator = SyncOrchestrator::builder(config, store.clone(), PagedHistory::new(records(4)))
        .with_bus(Arc::new(DownBus::default()))
        .build()
        .unwrap();

    let report = orchestrator.trigger_sync().await.unwrap();

    assert_eq!(report.failed, 4);
    assert_eq!(report.persisted, 0);
    assert_eq!(store.inner.event_count(), 0);
}

#[tokio::test]
async fn chaos_notification_bus_down_still_persists() {
    let store = FailingStore::new(Vec::new());
    let bus = Arc::new(DownBus::default());
    let orchestrator = SyncOrchestrator::builder(test_config(10), store.clone(), PagedHistory::new(records(3)))
        .with_bus(bus.clone())
        .build()
        .unwrap();

    let report = orchestrator.trigger_sync().await.unwrap();

    assert_eq!(report.persisted, 3);
    assert_eq!(bus.attempts.load(Ordering::SeqCst), 3);
    assert_eq!(store.inner.event_count(), 3);
}

// =============================================================================
// Upstream failures
// =============================================================================

#[tokio::test]
async fn chaos_fetch_failure_keeps_watermark() {
    let history = PagedHistory::new(records(3));
    let orchestrator = SyncOrchestrator::builder(test_config(10), Arc::new(InMemoryStore::new()), history.clone())
        .build()
        .unwrap();

    let first = orchestrator.trigger_sync().await.unwrap();

    history.set_failing(true);
    let err = orchestrator.trigger_sync().await.unwrap_err();
    assert!(matches!(err, SyncError::Fetch { offset: 0, source: GuardError::RetriesExhausted { attempts: 2, .. } }));
    assert_eq!(orchestrator.last_sync_time(), Some(first.started_at));

    history.set_failing(false);
    let retried = orchestrator.trigger_sync().await.unwrap();
    assert_eq!(retried.since, first.started_at);
}

#[tokio::test]
async fn chaos_failed_first_pass_leaves_no_watermark() {
    let history = PagedHistory::new(records(30));
    let orchestrator = SyncOrchestrator::builder(test_config(10), Arc::new(InMemoryStore::new()), history.clone())
        .build()
        .unwrap();

    history.set_failing(true);
    assert!(orchestrator.trigger_sync().await.is_err());
    assert!(orchestrator.last_sync_time().is_none());
    assert!(orchestrator.last_report().is_none());
}

#[tokio::test]
async fn chaos_repeated_fetch_failures_open_circuit() {
    let mut config = test_config(10);
    config.breaker.min_requests = 2;
    config.breaker.failure_ratio = 0.5;
    config.sync.retry_attempts = 1;
    let history = PagedHistory::new(records(3));
    history.set_failing(true);

    let orchestrator = SyncOrchestrator::builder(config, Arc::new(InMemoryStore::new()), history.clone())
        .build()
        .unwrap();

    assert!(orchestrator.trigger_sync().await.is_err());
    assert!(orchestrator.trigger_sync().await.is_err());
    assert_eq!(orchestrator.upstream_circuit(), CircuitState::Open);
    let calls = history.calls();

    let err = orchestrator.trigger_sync().await.unwrap_err();
    assert!(matches!(err, SyncError::Fetch { source: GuardError::CircuitOpen { .. }, .. }));
    assert_eq!(history.calls(), calls, "open circuit must not reach the provider");
}

#[tokio::test]
async fn chaos_stop_interrupts_retry_backoff() {
    let mut config = test_config(10);
    config.sync.initial_sync = true;
    config.sync.retry_attempts = 5;
    config.sync.retry_delay_ms = 60_000;
    let history = PagedHistory::new(records(3));
    history.set_failing(true);

    let orchestrator = SyncOrchestrator::builder(config, Arc::new(InMemoryStore::new()), history.clone())
        .build()
        .unwrap();
    orchestrator.start().unwrap();

    for _ in 0..100 {
        if history.calls() > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    tokio::time::timeout(Duration::from_secs(2), orchestrator.stop())
        .await
        .expect("stop blocked on a retry wait");
    assert_eq!(orchestrator.state(), OrchestratorState::Stopped);
    assert_eq!(history.calls(), 1);
    assert!(orchestrator.last_sync_time().is_none());
}

#[tokio::test]
async fn chaos_stop_without_start_and_double_stop() {
    let orchestrator =
        SyncOrchestrator::builder(test_config(10), Arc::new(InMemoryStore::new()), PagedHistory::new(Vec::new()))
            .build()
            .unwrap();

    orchestrator.stop().await;
    orchestrator.stop().await;
    assert_eq!(orchestrator.state(), OrchestratorState::Stopped);

    // A stopped orchestrator refuses new passes
    assert!(matches!(orchestrator.trigger_sync().await, Err(SyncError::Cancelled)));
}

// =============================================================================
// Geolocation failures
// =============================================================================

#[tokio::test]
async fn chaos_geolocation_outage_never_drops_events() {
    let store = Arc::new(InMemoryStore::new());
    let geo = TableGeo::new(&[("8.8.8.8", Geolocation::new("8.8.8.8", 37.75, -97.8, "United States"))]);
    let resolver = Arc::new(
        GeoResolver::new(store.clone(), test_config(10).breaker.circuit_config(), RetryConfig::upstream(1, Duration::from_millis(1)))
            .with_provider(geo.clone()),
    );

    let batch = vec![record(1, "8.8.8.8:32400"), record(2, "203.0.113.50"), record(3, "203.0.113.50")];
    let orchestrator = SyncOrchestrator::builder(test_config(10), store.clone(), PagedHistory::new(batch))
        .with_resolver(resolver.clone())
        .build()
        .unwrap();

    let report = orchestrator.trigger_sync().await.unwrap();
    assert_eq!(report.persisted, 3);

    let events = store.events();
    let located = events.iter().find(|e| e.ip_address == "8.8.8.8").unwrap();
    assert_eq!(located.location.country, "United States");
    let unknown: Vec<_> = events.iter().filter(|e| e.ip_address == "203.0.113.50").collect();
    assert_eq!(unknown.len(), 2);
    assert!(unknown.iter().all(|e| e.location.is_unknown()));

    // One lookup per distinct address; the failure is cached
    assert_eq!(geo.calls.load(Ordering::SeqCst), 2);
    assert!(store.location_count() >= 2);
}
