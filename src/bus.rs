// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Outbound event bus.
//!
//! [`EventBus`] is the publish side consumed by the orchestrator. In
//! event-sourcing mode the bus's own consumer performs the durable write;
//! [`spawn_store_writer`] is that consumer for the in-process
//! [`BroadcastBus`].

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::event::PlaybackEvent;
use crate::storage::traits::{PlaybackStore, StorageError};

#[derive(Error, Debug)]
pub enum BusError {
    #[error("event bus has no connected consumer")]
    NotConnected,
    #[error("publish timed out after {0:?}")]
    Timeout(Duration),
    #[error("publish failed: {0}")]
    Publish(String),
}

/// Publish side of the event bus.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, event: &PlaybackEvent) -> Result<(), BusError>;
}

/// In-process bus over a tokio broadcast channel.
///
/// Publishing with no subscriber is an error, so a publisher can tell that
/// nothing will persist the event.
pub struct BroadcastBus {
    sender: broadcast::Sender<PlaybackEvent>,
}

impl BroadcastBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlaybackEvent> {
        self.sender.subscribe()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventBus for BroadcastBus {
    async fn publish(&self, event: &PlaybackEvent) -> Result<(), BusError> {
        self.sender
            .send(event.clone())
            .map(|_| ())
            .map_err(|_| BusError::NotConnected)
    }
}

/// Spawn the durable consumer: every event received from `bus` is written to
/// `store`. Duplicates count as already persisted.
pub fn spawn_store_writer(
    bus: &BroadcastBus,
    store: Arc<dyn PlaybackStore>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let mut receiver = bus.subscribe();
    tokio::spawn(async move {
        info!("Bus store writer started");
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                received = receiver.recv() => match received {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Bus store writer lagged; events dropped from the channel");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };

            match store.insert_event(&event).await {
                Ok(()) => debug!(key = %event.correlation_key, "Persisted event from bus"),
                Err(StorageError::Duplicate(key)) => debug!(%key, "Bus event already persisted"),
                Err(e) => warn!(key = %event.correlation_key, error = %e, "Bus store writer failed to persist event"),
            }
        }
        info!("Bus store writer stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{HistoryRecord, PlaybackMetadata, Source};
    use crate::geolocation::Geolocation;
    use crate::storage::memory::InMemoryStore;
    use chrono::{TimeZone, Utc};

    fn event(session: &str) -> PlaybackEvent {
        let record = HistoryRecord {
            row_id: None,
            session_key: Some(session.to_string()),
            started_at: Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
            stopped_at: None,
            user_id: 3,
            username: "carol".into(),
            ip_address: Some("8.8.8.8".into()),
            rating_key: Some("99".into()),
            title: "Alien".into(),
            media_type: "movie".into(),
            machine_id: None,
            metadata: PlaybackMetadata::default(),
        };
        PlaybackEvent::from_record(&record, Source::Tautulli, None, "8.8.8.8".into(), Geolocation::unknown("8.8.8.8"))
    }

    #[tokio::test]
    async fn test_publish_without_subscriber_fails() {
        let bus = BroadcastBus::new(8);
        let err = bus.publish(&event("s-1")).await.unwrap_err();
        assert!(matches!(err, BusError::NotConnected));
    }

    #[tokio::test]
    async fn test_subscriber_receives_event() {
        let bus = BroadcastBus::new(8);
        let mut rx = bus.subscribe();
        let sent = event("s-1");
        bus.publish(&sent).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().id, sent.id);
    }

    #[tokio::test]
    async fn test_store_writer_persists_and_ignores_duplicates() {
        let bus = BroadcastBus::new(8);
        let store = Arc::new(InMemoryStore::new());
        let cancel = CancellationToken::new();
        let handle = spawn_store_writer(&bus, store.clone(), cancel.clone());

        bus.publish(&event("s-1")).await.unwrap();
        bus.publish(&event("s-1")).await.unwrap();
        bus.publish(&event("s-2")).await.unwrap();

        for _ in 0..50 {
            if store.event_count() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(store.event_count(), 2);

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(bus.subscriber_count(), 0);
    }
}
