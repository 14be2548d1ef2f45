// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! TTL-bounded "recently seen" cache for poll-based session sources.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Maps session key to the instant it was first emitted within the TTL.
///
/// Bounded by `max_entries`: when full, expired entries are swept and, if
/// still full, the oldest entry is evicted.
#[derive(Debug)]
pub struct SeenSessionCache {
    entries: DashMap<String, Instant>,
    ttl: Duration,
    max_entries: usize,
}

impl SeenSessionCache {
    #[must_use]
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Record an observation. Returns `true` when the session should be
    /// emitted (never seen, or last emitted longer than the TTL ago).
    pub fn check_and_mark(&self, session_key: &str) -> bool {
        let now = Instant::now();
        if !self.entries.contains_key(session_key) {
            self.make_room();
        }
        match self.entries.entry(session_key.to_string()) {
            Entry::Occupied(mut entry) => {
                if now.duration_since(*entry.get()) < self.ttl {
                    false
                } else {
                    entry.insert(now);
                    true
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(now);
                true
            }
        }
    }

    /// Mark a session as emitted regardless of its previous state.
    pub fn mark(&self, session_key: &str) {
        if !self.entries.contains_key(session_key) {
            self.make_room();
        }
        self.entries.insert(session_key.to_string(), Instant::now());
    }

    /// Drop a session so the next observation emits it again.
    pub fn forget(&self, session_key: &str) {
        self.entries.remove(session_key);
    }

    /// Whether the session was emitted within the TTL.
    #[must_use]
    pub fn contains(&self, session_key: &str) -> bool {
        self.entries
            .get(session_key)
            .is_some_and(|seen| seen.elapsed() < self.ttl)
    }

    /// Remove expired entries, returning how many were removed.
    pub fn sweep(&self) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries.retain(|_, seen| seen.elapsed() < ttl);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(removed, remaining = self.entries.len(), "Swept seen-session cache");
        }
        removed
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn make_room(&self) {
        if self.entries.len() < self.max_entries {
            return;
        }
        self.sweep();
        if self.entries.len() < self.max_entries {
            return;
        }
        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| *entry.value())
            .map(|entry| entry.key().clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }
}
