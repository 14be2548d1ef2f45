// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Collaborator interfaces for upstream media servers and outbound broadcast.
//!
//! Clients implement these traits over their own HTTP APIs; every call the
//! engine makes through them is wrapped in a
//! [`ProtectedCall`](crate::resilience::ProtectedCall).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::net::IpAddr;
use thiserror::Error;

use crate::event::{ActiveSession, HistoryRecord, Source};
use crate::geolocation::Geolocation;

/// Failure reported by an upstream provider client.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("{provider} returned HTTP status {status}")]
    Status { provider: String, status: u16 },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("failed to decode response: {0}")]
    Decode(String),
    #[error("rate limit exceeded for {0}")]
    RateLimited(String),
    #[error("{0} is not configured")]
    NotConfigured(String),
    #[error("{provider} lookup failed: {message}")]
    Lookup { provider: String, message: String },
    #[error("{provider} returned a location without a country")]
    EmptyCountry { provider: String },
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

/// Batch history feed (the primary, authoritative source).
#[async_trait]
pub trait HistoryProvider: Send + Sync {
    fn source(&self) -> Source;

    /// Records that started at or after `since`, paged by `offset`/`limit`.
    async fn fetch_history_since(
        &self,
        since: DateTime<Utc>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<HistoryRecord>, ProviderError>;

    /// The server's own GeoIP lookup, tried before any external provider.
    async fn lookup_geoip(&self, ip: IpAddr) -> Result<Geolocation, ProviderError>;

    async fn ping(&self) -> Result<(), ProviderError>;
}

/// Live session feed of a real-time provider.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    fn source(&self) -> Source;

    async fn active_sessions(&self) -> Result<Vec<ActiveSession>, ProviderError>;
}

/// Fire-and-forget fan-out to connected clients.
pub trait BroadcastSink: Send + Sync {
    fn broadcast(&self, message_type: &str, payload: serde_json::Value);
}
