//! One reconciliation pass: compute the window, page through history,
//! advance the watermark on success.

use chrono::{DateTime, Utc};
use std::time::Instant;
use tracing::{debug, error, info};

use super::types::{DedupPolicy, SyncError, SyncReport};
use super::{SyncOrchestrator, SyncStatus};
use crate::config::SyncSettings;
use crate::resilience::GuardError;

/// Clears the running flag even if the pass future is dropped.
struct RunningFlag<'a>(&'a parking_lot::RwLock<SyncStatus>);

impl<'a> RunningFlag<'a> {
    fn raise(status: &'a parking_lot::RwLock<SyncStatus>) -> Self {
        status.write().running = true;
        Self(status)
    }
}

impl Drop for RunningFlag<'_> {
    fn drop(&mut self) {
        self.0.write().running = false;
    }
}

impl SyncOrchestrator {
    /// Run one full reconciliation pass.
    ///
    /// Only one pass runs at a time; a concurrent call returns
    /// [`SyncError::PassInProgress`] immediately. Per-record failures are
    /// counted in the report. A fetch failure aborts the pass and leaves
    /// the watermark unchanged so the next pass retries the same window.
    #[tracing::instrument(skip(self), fields(source = %self.history.source()))]
    pub async fn trigger_sync(&self) -> Result<SyncReport, SyncError> {
        let Ok(_pass) = self.pass_lock.try_lock() else {
            debug!("Sync pass already in progress");
            return Err(SyncError::PassInProgress);
        };
        let _running = RunningFlag::raise(&self.status);

        let started_at = Utc::now();
        let clock = Instant::now();
        let since = self.window_start(started_at);
        info!(%since, "Starting sync pass");

        match self.run_pass(started_at, since).await {
            Ok(mut report) => {
                report.duration = clock.elapsed();
                {
                    let mut status = self.status.write();
                    // Never move the watermark backwards
                    if status.watermark.map_or(true, |w| w < started_at) {
                        status.watermark = Some(started_at);
                    }
                    status.last_report = Some(report.clone());
                }
                crate::metrics::record_sync_pass("success", report.duration);
                info!(
                    batches = report.batches,
                    fetched = report.fetched,
                    persisted = report.persisted,
                    skipped = report.skipped,
                    failed = report.failed,
                    duration_ms = report.duration.as_millis() as u64,
                    "Sync pass complete"
                );
                if let Some(sink) = &self.broadcast {
                    match serde_json::to_value(&report) {
                        Ok(payload) => sink.broadcast("sync_completed", payload),
                        Err(e) => debug!(error = %e, "Failed to encode sync report"),
                    }
                }
                self.completions.send_replace(Some(report.clone()));
                Ok(report)
            }
            Err(e) => {
                let status = if matches!(e, SyncError::Cancelled) { "cancelled" } else { "failure" };
                crate::metrics::record_sync_pass(status, clock.elapsed());
                error!(error = %e, "Sync pass aborted");
                Err(e)
            }
        }
    }

    /// Last watermark, else the full-history floor or the lookback window.
    fn window_start(&self, started_at: DateTime<Utc>) -> DateTime<Utc> {
        if let Some(watermark) = self.status.read().watermark {
            return watermark;
        }
        let sync = &self.config.sync;
        if sync.sync_all {
            return SyncSettings::history_floor();
        }
        let lookback = chrono::Duration::from_std(sync.lookback()).unwrap_or_else(|_| chrono::Duration::hours(24));
        started_at - lookback
    }

    async fn run_pass(&self, started_at: DateTime<Utc>, since: DateTime<Utc>) -> Result<SyncReport, SyncError> {
        let limit = self.config.sync.batch_size;
        let source = self.history.source();
        let mut report = SyncReport::new(started_at, since);
        let mut offset = 0;

        loop {
            if self.cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            let batch = self
                .upstream
                .execute("fetch_history", &self.cancel, || {
                    self.history.fetch_history_since(since, offset, limit)
                })
                .await
                .map_err(|source| match source {
                    GuardError::Cancelled => SyncError::Cancelled,
                    source => SyncError::Fetch { offset, source },
                })?;

            report.batches += 1;
            crate::metrics::record_batch_size(batch.len());
            if batch.is_empty() {
                break;
            }

            let result = self
                .pipeline
                .process_batch(&batch, source, DedupPolicy::Durable, &self.cancel)
                .await;
            debug!(
                offset,
                total = result.total,
                persisted = result.persisted,
                skipped = result.skipped,
                failed = result.failed,
                "Processed batch"
            );
            report.absorb(&result);

            offset += batch.len();
            if batch.len() < limit {
                break;
            }
        }

        Ok(report)
    }
}
