//! Orchestrator lifecycle management: start, run loop, stop.

use std::sync::Arc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::types::{OrchestratorState, SyncError};
use super::SyncOrchestrator;

impl SyncOrchestrator {
    /// Spawn the background tasks: the periodic sync loop (with an initial
    /// pass when configured), the live session poller and the buffer
    /// health monitor.
    ///
    /// Must be called from within a Tokio runtime. An orchestrator starts
    /// at most once.
    #[tracing::instrument(skip(self))]
    pub fn start(self: &Arc<Self>) -> Result<(), SyncError> {
        let state = self.state();
        if state != OrchestratorState::Created {
            return Err(SyncError::InvalidState { action: "start", state });
        }
        self.set_state(OrchestratorState::Starting);

        let mut tasks = self.tasks.lock();

        let this = Arc::clone(self);
        tasks.push(tokio::spawn(async move { this.run_sync_loop().await }));

        if let Some(poller) = &self.poller {
            let poller = Arc::clone(poller);
            let cancel = self.cancel.clone();
            tasks.push(tokio::spawn(async move { poller.run(cancel).await }));
        }

        if let Some(monitor) = &self.monitor {
            let monitor = Arc::clone(monitor);
            let cancel = self.cancel.clone();
            tasks.push(tokio::spawn(async move { monitor.run(cancel).await }));
        }

        info!(
            tasks = tasks.len(),
            interval_secs = self.config.sync.interval_secs,
            persistence = ?self.config.sync.persistence,
            "Sync orchestrator started"
        );
        drop(tasks);

        self.set_state(OrchestratorState::Running);
        Ok(())
    }

    /// Cancel every background task and wait for all of them to exit.
    ///
    /// In-flight retries abort their backoff wait; a pass in progress stops
    /// at its next fetch and leaves the watermark unchanged.
    #[tracing::instrument(skip(self))]
    pub async fn stop(&self) {
        match self.state() {
            OrchestratorState::Stopping | OrchestratorState::Stopped => return,
            _ => {}
        }
        info!("Stopping sync orchestrator...");
        self.set_state(OrchestratorState::Stopping);
        self.cancel.cancel();

        let handles = std::mem::take(&mut *self.tasks.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        self.set_state(OrchestratorState::Stopped);
        info!("Sync orchestrator stopped");
    }

    async fn run_sync_loop(self: Arc<Self>) {
        if self.config.sync.initial_sync {
            self.run_scheduled("initial").await;
        }

        let period = self.config.sync.interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => self.run_scheduled("periodic").await,
            }
        }
        debug!("Sync loop exited");
    }

    async fn run_scheduled(&self, trigger: &'static str) {
        match self.trigger_sync().await {
            Ok(_) => {}
            Err(SyncError::PassInProgress) => debug!(trigger, "Sync pass already running, skipping"),
            Err(SyncError::Cancelled) => debug!(trigger, "Scheduled sync cancelled"),
            Err(e) => error!(trigger, error = %e, "Scheduled sync failed"),
        }
    }
}
