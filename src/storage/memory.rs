// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};

use super::traits::{PlaybackStore, StorageError};
use crate::event::PlaybackEvent;
use crate::geolocation::Geolocation;

/// DashMap-backed [`PlaybackStore`] for tests, demos and embedded use.
pub struct InMemoryStore {
    events: DashMap<String, PlaybackEvent>,
    session_keys: DashSet<String>,
    locations: DashMap<String, Geolocation>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            events: DashMap::new(),
            session_keys: DashSet::new(),
            locations: DashMap::new(),
        }
    }

    /// Number of persisted events
    #[must_use]
    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    /// Number of cached locations
    #[must_use]
    pub fn location_count(&self) -> usize {
        self.locations.len()
    }

    /// Look up a persisted event by correlation key
    #[must_use]
    pub fn event(&self, correlation_key: &str) -> Option<PlaybackEvent> {
        self.events.get(correlation_key).map(|r| r.value().clone())
    }

    /// Snapshot of all persisted events
    #[must_use]
    pub fn events(&self) -> Vec<PlaybackEvent> {
        self.events.iter().map(|r| r.value().clone()).collect()
    }

    /// Clear all events and locations
    pub fn clear(&self) {
        self.events.clear();
        self.session_keys.clear();
        self.locations.clear();
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PlaybackStore for InMemoryStore {
    async fn record_exists(&self, session_key: &str) -> Result<bool, StorageError> {
        Ok(self.session_keys.contains(session_key))
    }

    async fn get_location(&self, ip: &str) -> Result<Option<Geolocation>, StorageError> {
        Ok(self.locations.get(ip).map(|r| r.value().clone()))
    }

    async fn upsert_location(&self, geo: &Geolocation) -> Result<(), StorageError> {
        self.locations.insert(geo.ip_address.clone(), geo.clone());
        Ok(())
    }

    async fn insert_event(&self, event: &PlaybackEvent) -> Result<(), StorageError> {
        match self.events.entry(event.correlation_key.as_str().to_string()) {
            Entry::Occupied(entry) => Err(StorageError::Duplicate(entry.key().clone())),
            Entry::Vacant(entry) => {
                entry.insert(event.clone());
                self.session_keys.insert(event.session_key.clone());
                Ok(())
            }
        }
    }
}
