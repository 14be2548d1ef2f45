// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Buffer health prediction for transcoding sessions.
//!
//! # Formulas
//!
//! ```text
//! buffer_seconds   = max(0, max_offset_available − view_offset) / 1000
//! fill_percent     = min(100, buffer_seconds / capacity × 100)
//! drain_rate       = 1 − (buffer_seconds − previous) / elapsed     clamped to [0.1, 5.0]
//! seconds_to_stall = buffer_seconds / (drain_rate − 1)             only when drain_rate > 1
//! ```
//!
//! A drain rate above 1.0 means the buffer empties faster than real time.
//! Read-only: nothing here is persisted.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BufferHealthSettings;
use crate::event::{ActiveSession, TranscodeProgress};
use crate::resilience::{GuardError, ProtectedCall};
use crate::upstream::{BroadcastSink, ProviderError, SessionProvider};

const MIN_DRAIN_RATE: f64 = 0.1;
const MAX_DRAIN_RATE: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Risky,
    Critical,
}

impl HealthStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Risky => "risky",
            Self::Critical => "critical",
        }
    }

    #[must_use]
    pub fn is_alert(&self) -> bool {
        !matches!(self, Self::Healthy)
    }
}

/// Buffer figures for one sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BufferMetrics {
    pub buffer_seconds: f64,
    pub fill_percent: f64,
    pub drain_rate: f64,
    pub seconds_to_stall: Option<f64>,
    pub status: HealthStatus,
}

/// Previous sample of the same session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PreviousSample {
    pub buffer_seconds: f64,
    pub elapsed: Duration,
}

/// Compute buffer figures for one transcoding session.
///
/// Without a usable previous sample the drain rate is 1.0 (steady state).
/// A zero `elapsed` falls back to the poll interval.
#[must_use]
pub fn compute_buffer_metrics(
    view_offset_ms: u64,
    progress: &TranscodeProgress,
    previous: Option<PreviousSample>,
    settings: &BufferHealthSettings,
) -> BufferMetrics {
    let buffer_seconds = progress.max_offset_available_ms.saturating_sub(view_offset_ms) as f64 / 1000.0;
    let capacity = if settings.capacity_secs > 0.0 { settings.capacity_secs } else { 30.0 };
    let fill_percent = (buffer_seconds / capacity * 100.0).min(100.0);

    let drain_rate = match previous {
        Some(prev) if prev.buffer_seconds > 0.0 => {
            let elapsed = if prev.elapsed.is_zero() { settings.poll_interval() } else { prev.elapsed };
            let elapsed_secs = elapsed.as_secs_f64().max(f64::EPSILON);
            (1.0 - (buffer_seconds - prev.buffer_seconds) / elapsed_secs).clamp(MIN_DRAIN_RATE, MAX_DRAIN_RATE)
        }
        _ => 1.0,
    };

    let seconds_to_stall = (drain_rate > 1.0).then(|| buffer_seconds / (drain_rate - 1.0));

    let status = if fill_percent < settings.critical_threshold {
        HealthStatus::Critical
    } else if fill_percent < settings.risky_threshold {
        HealthStatus::Risky
    } else {
        HealthStatus::Healthy
    };

    BufferMetrics { buffer_seconds, fill_percent, drain_rate, seconds_to_stall, status }
}

/// Health of one session, as broadcast to clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BufferHealth {
    pub session_key: String,
    pub username: String,
    pub title: String,
    pub transcode_speed: f64,
    #[serde(flatten)]
    pub metrics: BufferMetrics,
    pub sampled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    buffer_seconds: f64,
    at: Instant,
}

/// Polls live sessions and predicts buffer stalls.
pub struct BufferHealthMonitor {
    provider: Arc<dyn SessionProvider>,
    guard: Arc<ProtectedCall>,
    settings: BufferHealthSettings,
    broadcast: Option<Arc<dyn BroadcastSink>>,
    previous: RwLock<HashMap<String, Sample>>,
}

impl BufferHealthMonitor {
    pub fn new(
        provider: Arc<dyn SessionProvider>,
        guard: Arc<ProtectedCall>,
        settings: BufferHealthSettings,
        broadcast: Option<Arc<dyn BroadcastSink>>,
    ) -> Self {
        Self {
            provider,
            guard,
            settings,
            broadcast,
            previous: RwLock::new(HashMap::new()),
        }
    }

    /// Sessions with a cached previous sample.
    #[must_use]
    pub fn tracked_sessions(&self) -> usize {
        self.previous.read().len()
    }

    /// Poll once; returns the health of every transcoding session.
    pub async fn poll_once(&self, cancel: &CancellationToken) -> Result<Vec<BufferHealth>, GuardError<ProviderError>> {
        let sessions = self
            .guard
            .execute("active_sessions", cancel, || self.provider.active_sessions())
            .await?;

        let now = Instant::now();
        let mut report = Vec::new();
        for session in &sessions {
            let Some(progress) = &session.transcode else { continue };
            let health = self.assess(session, progress, now);
            crate::metrics::record_buffer_health(health.metrics.status.as_str());
            if progress.speed < 1.0 {
                warn!(
                    session_key = %session.session_key,
                    speed = progress.speed,
                    throttled = progress.throttled,
                    "Transcoder is not keeping up with playback"
                );
            }
            if health.metrics.status.is_alert() {
                self.alert(&health);
            }
            report.push(health);
        }

        let active: HashSet<&str> = sessions.iter().map(|s| s.session_key.as_str()).collect();
        let mut previous = self.previous.write();
        previous.retain(|key, _| active.contains(key.as_str()));
        crate::metrics::set_buffer_sessions(previous.len());

        Ok(report)
    }

    fn assess(&self, session: &ActiveSession, progress: &TranscodeProgress, now: Instant) -> BufferHealth {
        let prior = self.previous.read().get(&session.session_key).copied();
        let previous = prior.map(|sample| PreviousSample {
            buffer_seconds: sample.buffer_seconds,
            elapsed: now.saturating_duration_since(sample.at),
        });
        let metrics = compute_buffer_metrics(session.view_offset_ms, progress, previous, &self.settings);

        self.previous.write().insert(
            session.session_key.clone(),
            Sample { buffer_seconds: metrics.buffer_seconds, at: now },
        );

        BufferHealth {
            session_key: session.session_key.clone(),
            username: session.username.clone(),
            title: session.title.clone(),
            transcode_speed: progress.speed,
            metrics,
            sampled_at: Utc::now(),
        }
    }

    fn alert(&self, health: &BufferHealth) {
        warn!(
            session_key = %health.session_key,
            user = %health.username,
            title = %health.title,
            status = health.metrics.status.as_str(),
            fill_percent = health.metrics.fill_percent,
            drain_rate = health.metrics.drain_rate,
            seconds_to_stall = ?health.metrics.seconds_to_stall,
            "Buffer health alert"
        );
        if let Some(sink) = &self.broadcast {
            match serde_json::to_value(health) {
                Ok(payload) => sink.broadcast("buffer_health", payload),
                Err(e) => debug!(error = %e, "Failed to encode buffer health"),
            }
        }
    }

    /// Poll on the configured interval until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let period = self.settings.poll_interval();
        info!(interval_secs = period.as_secs(), "Buffer health monitor started");

        let mut ticker = interval_at(Instant::now(), period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => match self.poll_once(&cancel).await {
                    Ok(_) => {}
                    Err(GuardError::Cancelled) => break,
                    Err(e) => warn!(error = %e, "Buffer health poll failed"),
                },
            }
        }
        info!("Buffer health monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{PlaybackMetadata, Source};
    use crate::resilience::{CircuitConfig, RetryConfig};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    fn settings() -> BufferHealthSettings {
        BufferHealthSettings::default()
    }

    fn progress(available_ms: u64, speed: f64) -> TranscodeProgress {
        TranscodeProgress { max_offset_available_ms: available_ms, speed, throttled: false }
    }

    #[test]
    fn test_first_sample_is_steady_state() {
        let m = compute_buffer_metrics(10_000, &progress(40_000, 1.5), None, &settings());
        assert_eq!(m.buffer_seconds, 30.0);
        assert_eq!(m.fill_percent, 100.0);
        assert_eq!(m.drain_rate, 1.0);
        assert!(m.seconds_to_stall.is_none());
        assert_eq!(m.status, HealthStatus::Healthy);
    }

    #[test]
    fn test_draining_buffer_predicts_stall() {
        // 20s of buffer five seconds ago, 10s now: draining at 3x real time
        let previous = PreviousSample { buffer_seconds: 20.0, elapsed: Duration::from_secs(5) };
        let m = compute_buffer_metrics(0, &progress(10_000, 0.5), Some(previous), &settings());

        assert_eq!(m.buffer_seconds, 10.0);
        assert!((m.drain_rate - 3.0).abs() < 1e-9);
        assert!((m.seconds_to_stall.unwrap() - 5.0).abs() < 1e-9);
        assert_eq!(m.status, HealthStatus::Risky);
    }

    #[test]
    fn test_drain_rate_clamped() {
        let previous = PreviousSample { buffer_seconds: 30.0, elapsed: Duration::from_secs(1) };
        let m = compute_buffer_metrics(0, &progress(0, 0.1), Some(previous), &settings());
        assert_eq!(m.drain_rate, MAX_DRAIN_RATE);
        assert_eq!(m.seconds_to_stall, Some(0.0));
        assert_eq!(m.status, HealthStatus::Critical);

        let previous = PreviousSample { buffer_seconds: 1.0, elapsed: Duration::from_secs(1) };
        let m = compute_buffer_metrics(0, &progress(30_000, 4.0), Some(previous), &settings());
        assert_eq!(m.drain_rate, MIN_DRAIN_RATE);
    }

    #[test]
    fn test_empty_previous_buffer_ignored() {
        let previous = PreviousSample { buffer_seconds: 0.0, elapsed: Duration::from_secs(5) };
        let m = compute_buffer_metrics(0, &progress(15_000, 1.0), Some(previous), &settings());
        assert_eq!(m.drain_rate, 1.0);
    }

    #[test]
    fn test_zero_elapsed_uses_poll_interval() {
        let previous = PreviousSample { buffer_seconds: 20.0, elapsed: Duration::ZERO };
        let m = compute_buffer_metrics(0, &progress(15_000, 1.0), Some(previous), &settings());
        // (15 - 20) / 5s poll interval
        assert!((m.drain_rate - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_view_offset_past_available_is_empty() {
        let m = compute_buffer_metrics(50_000, &progress(40_000, 1.0), None, &settings());
        assert_eq!(m.buffer_seconds, 0.0);
        assert_eq!(m.status, HealthStatus::Critical);
    }

    struct ScriptedSessions {
        polls: Mutex<Vec<Vec<ActiveSession>>>,
    }

    #[async_trait]
    impl SessionProvider for ScriptedSessions {
        fn source(&self) -> Source {
            Source::Plex
        }

        async fn active_sessions(&self) -> Result<Vec<ActiveSession>, ProviderError> {
            let mut polls = self.polls.lock();
            Ok(if polls.is_empty() { Vec::new() } else { polls.remove(0) })
        }
    }

    #[derive(Default)]
    struct CapturingSink {
        messages: Mutex<Vec<(String, serde_json::Value)>>,
    }

    impl BroadcastSink for CapturingSink {
        fn broadcast(&self, message_type: &str, payload: serde_json::Value) {
            self.messages.lock().push((message_type.to_string(), payload));
        }
    }

    fn live(key: &str, view_offset_ms: u64, available_ms: Option<u64>) -> ActiveSession {
        ActiveSession {
            session_key: key.to_string(),
            started_at: Utc::now(),
            user_id: 1,
            username: "erin".into(),
            ip_address: Some("8.8.8.8".into()),
            rating_key: None,
            title: "Dune".into(),
            media_type: "movie".into(),
            machine_id: None,
            view_offset_ms,
            transcode: available_ms.map(|ms| progress(ms, 0.8)),
            metadata: PlaybackMetadata::default(),
        }
    }

    fn monitor(polls: Vec<Vec<ActiveSession>>, sink: Arc<CapturingSink>) -> BufferHealthMonitor {
        BufferHealthMonitor::new(
            Arc::new(ScriptedSessions { polls: Mutex::new(polls) }),
            Arc::new(ProtectedCall::new(
                "plex-sessions",
                CircuitConfig::default(),
                RetryConfig::upstream(1, Duration::from_millis(1)),
            )),
            settings(),
            Some(sink),
        )
    }

    #[tokio::test]
    async fn test_alerts_broadcast_for_risky_sessions() {
        let sink = Arc::new(CapturingSink::default());
        let monitor = monitor(
            vec![vec![live("a", 0, Some(3_000)), live("b", 0, Some(30_000)), live("c", 0, None)]],
            sink.clone(),
        );

        let report = monitor.poll_once(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.len(), 2);
        let messages = sink.messages.lock();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, "buffer_health");
        assert_eq!(messages[0].1["session_key"], "a");
        assert_eq!(messages[0].1["status"], "critical");
    }

    #[tokio::test]
    async fn test_departed_sessions_swept() {
        let sink = Arc::new(CapturingSink::default());
        let monitor = monitor(
            vec![
                vec![live("a", 0, Some(30_000)), live("b", 0, Some(30_000))],
                vec![live("b", 1_000, Some(31_000))],
            ],
            sink,
        );
        let cancel = CancellationToken::new();

        monitor.poll_once(&cancel).await.unwrap();
        assert_eq!(monitor.tracked_sessions(), 2);

        monitor.poll_once(&cancel).await.unwrap();
        assert_eq!(monitor.tracked_sessions(), 1);
    }

    /// Collects formatted log output.
    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogBuffer {
        type Writer = LogBuffer;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[tokio::test]
    async fn test_slow_transcode_logged_as_warning() {
        let logs = LogBuffer::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_max_level(tracing::Level::WARN)
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let monitor = monitor(vec![vec![live("slow", 0, Some(30_000))]], Arc::new(CapturingSink::default()));
        monitor.poll_once(&CancellationToken::new()).await.unwrap();

        let output = String::from_utf8(logs.0.lock().clone()).unwrap();
        assert!(output.contains("WARN"), "{output}");
        assert!(output.contains("Transcoder is not keeping up with playback"), "{output}");
    }
}
