// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

use crate::event::PlaybackEvent;
use crate::geolocation::Geolocation;

#[derive(Error, Debug)]
pub enum StorageError {
    /// An event with this correlation key is already persisted
    #[error("Event with correlation key '{0}' already exists")]
    Duplicate(String),
    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Durable store consumed by the engine.
///
/// Implementations must enforce correlation-key uniqueness in
/// [`insert_event`](PlaybackStore::insert_event) by returning
/// [`StorageError::Duplicate`].
#[async_trait]
pub trait PlaybackStore: Send + Sync {
    /// Whether an event for this source session key was already persisted.
    async fn record_exists(&self, session_key: &str) -> Result<bool, StorageError>;

    async fn get_location(&self, ip: &str) -> Result<Option<Geolocation>, StorageError>;

    /// Bulk location lookup; missing addresses are absent from the map.
    /// Default implementation falls back to sequential gets.
    async fn get_locations(&self, ips: &[String]) -> Result<HashMap<String, Geolocation>, StorageError> {
        let mut found = HashMap::with_capacity(ips.len());
        for ip in ips {
            if let Some(geo) = self.get_location(ip).await? {
                found.insert(ip.clone(), geo);
            }
        }
        Ok(found)
    }

    async fn upsert_location(&self, geo: &Geolocation) -> Result<(), StorageError>;

    async fn insert_event(&self, event: &PlaybackEvent) -> Result<(), StorageError>;
}
