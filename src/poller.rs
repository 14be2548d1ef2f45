// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Live session polling for real-time providers.
//!
//! Each poll fetches the provider's active sessions through the resilience
//! layer. A session not emitted within the seen-cache TTL is converted to a
//! record and sent through the shared pipeline. The seen cache only reduces
//! noise; uniqueness comes from the store's correlation-key constraint.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SessionPollingSettings;
use crate::coordinator::pipeline::RecordPipeline;
use crate::coordinator::{DedupPolicy, RecordOutcome};
use crate::correlation::SeenSessionCache;
use crate::resilience::{GuardError, ProtectedCall};
use crate::upstream::{ProviderError, SessionProvider};

/// Outcome of a single poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    /// Sessions the provider reported
    pub active: usize,
    /// Sessions sent through the pipeline
    pub emitted: usize,
    /// Sessions suppressed by the seen cache
    pub suppressed: usize,
    pub persisted: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct SessionPoller {
    provider: Arc<dyn SessionProvider>,
    guard: Arc<ProtectedCall>,
    pipeline: Arc<RecordPipeline>,
    seen: SeenSessionCache,
    interval: Duration,
    sweep_interval: Duration,
    publish_all: bool,
}

impl SessionPoller {
    pub(crate) fn new(
        provider: Arc<dyn SessionProvider>,
        guard: Arc<ProtectedCall>,
        pipeline: Arc<RecordPipeline>,
        settings: &SessionPollingSettings,
    ) -> Self {
        Self {
            provider,
            guard,
            pipeline,
            seen: SeenSessionCache::new(settings.seen_ttl(), settings.seen_max_entries),
            interval: settings.interval(),
            sweep_interval: settings.sweep_interval(),
            publish_all: settings.publish_all,
        }
    }

    /// Sessions currently held by the seen cache.
    #[must_use]
    pub fn seen_len(&self) -> usize {
        self.seen.len()
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Poll the provider once and emit every session not seen within the TTL.
    pub async fn poll_once(&self, cancel: &CancellationToken) -> Result<PollReport, GuardError<ProviderError>> {
        let source = self.provider.source();
        let sessions = self
            .guard
            .execute("active_sessions", cancel, || self.provider.active_sessions())
            .await?;

        let mut report = PollReport { active: sessions.len(), ..PollReport::default() };
        for session in &sessions {
            let record = session.to_record();
            let key = record.effective_session_key(source);

            let fresh = self.seen.check_and_mark(&key);
            if !fresh && !self.publish_all {
                report.suppressed += 1;
                continue;
            }
            report.emitted += 1;

            match self.pipeline.process(&record, source, DedupPolicy::CorrelationOnly, cancel).await {
                RecordOutcome::Persisted(_) => report.persisted += 1,
                RecordOutcome::Skipped(reason) => {
                    debug!(%source, session_key = %key, ?reason, "Live session skipped");
                    report.skipped += 1;
                }
                RecordOutcome::Failed(e) => {
                    // Emit again on the next poll
                    self.seen.forget(&key);
                    warn!(%source, session_key = %key, error = %e, "Failed to persist live session");
                    report.failed += 1;
                }
            }
        }

        crate::metrics::record_session_poll("success", report.emitted);
        crate::metrics::set_seen_cache_entries(self.seen.len());
        Ok(report)
    }

    /// Poll on the configured interval and sweep the seen cache at half its
    /// TTL until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let source = self.provider.source();
        info!(%source, interval_secs = self.interval.as_secs(), "Session poller started");

        let mut poll = interval_at(Instant::now(), self.interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut sweep = interval_at(Instant::now() + self.sweep_interval, self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = poll.tick() => match self.poll_once(&cancel).await {
                    Ok(report) if report.emitted > 0 => {
                        debug!(%source, active = report.active, emitted = report.emitted, "Session poll complete");
                    }
                    Ok(_) => {}
                    Err(GuardError::Cancelled) => break,
                    Err(e) => {
                        crate::metrics::record_session_poll("failure", 0);
                        warn!(%source, error = %e, "Session poll failed");
                    }
                },
                _ = sweep.tick() => {
                    self.seen.sweep();
                    crate::metrics::set_seen_cache_entries(self.seen.len());
                }
            }
        }
        info!(%source, "Session poller stopped");
    }
}
