// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic playback-sync usage example.
//!
//! Demonstrates:
//! 1. Building an orchestrator over an in-memory store and a fake history feed
//! 2. Running an on-demand sync pass
//! 3. Running a second pass (everything already processed)
//! 4. Health check
//! 5. Displaying metrics
//! 6. Clean shutdown
//!
//! No external services are needed; geolocation runs against local
//! addresses only.
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//! ```

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use playback_sync::{
    Geolocation, HistoryProvider, HistoryRecord, InMemoryStore, PlaybackMetadata, PlaybackSyncConfig, ProviderError, Source,
    SyncOrchestrator,
};

/// Replays a fixed list of plays, paged by offset.
struct DemoHistory {
    records: Vec<HistoryRecord>,
}

impl DemoHistory {
    fn new() -> Self {
        let now = Utc::now();
        let plays = [
            ("alice", "The Expanse", "192.168.1.20:32400", "living-room"),
            ("bob", "Severance", "10.0.0.7", "phone"),
            ("carol", "Arrival", "[fd00::12]:8080", "laptop"),
            ("alice", "Dune", "192.168.1.20", "living-room"),
            ("dave", "Andor", "N/A", "tablet"),
        ];
        let records = plays
            .iter()
            .enumerate()
            .map(|(i, (user, title, ip, device))| HistoryRecord {
                row_id: Some(i as i64 + 1),
                session_key: Some(format!("demo-{i}")),
                started_at: now - chrono::Duration::minutes(10 * (i as i64 + 1)),
                stopped_at: None,
                user_id: i as i64 % 4,
                username: (*user).to_string(),
                ip_address: Some((*ip).to_string()),
                rating_key: Some(format!("{}", 5000 + i)),
                title: (*title).to_string(),
                media_type: "movie".into(),
                machine_id: Some((*device).to_string()),
                metadata: PlaybackMetadata::default(),
            })
            .collect();
        Self { records }
    }
}

#[async_trait]
impl HistoryProvider for DemoHistory {
    fn source(&self) -> Source {
        Source::Tautulli
    }

    async fn fetch_history_since(
        &self,
        _since: DateTime<Utc>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<HistoryRecord>, ProviderError> {
        Ok(self.records.iter().skip(offset).take(limit).cloned().collect())
    }

    async fn lookup_geoip(&self, _ip: IpAddr) -> Result<Geolocation, ProviderError> {
        Err(ProviderError::NotConfigured("demo geoip".into()))
    }

    async fn ping(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt().with_target(false).compact().init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║           playback-sync: Basic Usage Example                  ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Configure and build
    // ─────────────────────────────────────────────────────────────────────────
    let mut config = PlaybackSyncConfig::default();
    config.server_id = Some("demo-server".into());
    config.sync.batch_size = 2;
    config.sync.initial_sync = false;
    config.geolocation.ip_api_enabled = false;

    let store = Arc::new(InMemoryStore::new());
    let orchestrator = SyncOrchestrator::builder(config, store.clone(), Arc::new(DemoHistory::new())).build()?;
    orchestrator.start()?;
    println!("🚀 State: {}", orchestrator.state());

    // ─────────────────────────────────────────────────────────────────────────
    // 2. First pass
    // ─────────────────────────────────────────────────────────────────────────
    let report = orchestrator.trigger_sync().await?;
    println!("\n📝 First pass");
    println!("   └─ batches={} fetched={}", report.batches, report.fetched);
    println!("   └─ persisted={} skipped={} failed={}", report.persisted, report.skipped, report.failed);
    println!("   └─ took {:?}", report.duration);

    for event in store.events() {
        println!(
            "   └─ {} {} from {} ({})",
            event.username,
            event.title,
            event.ip_address,
            if event.location.is_unknown() { "unknown" } else { event.location.country.as_str() }
        );
        println!("      key {}", event.correlation_key);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Second pass
    // ─────────────────────────────────────────────────────────────────────────
    let again = orchestrator.trigger_sync().await?;
    println!("\n🔁 Second pass: persisted={} skipped={}", again.persisted, again.skipped);

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Health
    // ─────────────────────────────────────────────────────────────────────────
    let health = orchestrator.health_check().await;
    println!("\n🩺 Health");
    println!("   └─ healthy={} state={} circuit={}", health.healthy, health.state, health.upstream_circuit);
    println!("   └─ last sync {:?}", health.last_sync_time);
    println!("   └─ geo cache entries {}", health.geo_cache_entries);

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Metrics
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📈 Metrics:");
    dump_metrics(&snapshotter);

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Shutdown
    // ─────────────────────────────────────────────────────────────────────────
    orchestrator.stop().await;
    println!("\n🛑 State: {}", orchestrator.state());

    Ok(())
}

fn dump_metrics(snapshotter: &Snapshotter) {
    let mut lines: Vec<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, value)| {
            let (_, key) = composite_key.into_parts();
            let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
            let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };
            let rendered = match value {
                DebugValue::Counter(v) => v.to_string(),
                DebugValue::Gauge(v) => format!("{:.2}", v.into_inner()),
                DebugValue::Histogram(samples) => {
                    let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                    format!("count={} sum={:.4}", samples.len(), sum)
                }
            };
            format!("{}{} = {}", key.name(), label_str, rendered)
        })
        .collect();
    lines.sort();

    if lines.is_empty() {
        println!("   └─ (no metrics recorded)");
    }
    for line in lines {
        println!("   └─ {line}");
    }
}
