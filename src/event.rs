// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Playback records and the canonical [`PlaybackEvent`].
//!
//! Upstream clients map their payloads into [`HistoryRecord`] (batch history)
//! or [`ActiveSession`] (live sessions). The orchestrator turns a validated
//! record into exactly one [`PlaybackEvent`] carrying its correlation key and
//! resolved location.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::correlation::{CorrelationKey, CorrelationParts};
use crate::geolocation::Geolocation;

/// Upstream that reported a playback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    #[default]
    Tautulli,
    Plex,
    Jellyfin,
    Emby,
}

impl Source {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tautulli => "tautulli",
            Self::Plex => "plex",
            Self::Jellyfin => "jellyfin",
            Self::Emby => "emby",
        }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Content, device and stream details carried through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackMetadata {
    pub parent_title: Option<String>,
    pub grandparent_title: Option<String>,
    pub year: Option<i32>,
    pub platform: Option<String>,
    pub player: Option<String>,
    pub product: Option<String>,
    pub location_type: Option<String>,
    pub transcode_decision: Option<String>,
    pub video_resolution: Option<String>,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub bitrate_kbps: Option<u32>,
    pub percent_complete: Option<u8>,
    pub paused_counter: Option<u32>,
}

/// One provider-agnostic playback record from a history feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// Provider row id, when the feed has one
    pub row_id: Option<i64>,
    /// Provider session identifier, when the feed has one
    pub session_key: Option<String>,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub user_id: i64,
    pub username: String,
    /// Raw client address; may carry a port or brackets
    pub ip_address: Option<String>,
    pub rating_key: Option<String>,
    pub title: String,
    pub media_type: String,
    pub machine_id: Option<String>,
    #[serde(default)]
    pub metadata: PlaybackMetadata,
}

impl HistoryRecord {
    /// The provider session key, or a deterministic substitute.
    ///
    /// Falls back to `{source}-row-{row_id}`, then to
    /// `{source}-{started_at_unix}-{user_id}`.
    #[must_use]
    pub fn effective_session_key(&self, source: Source) -> String {
        match (self.session_key.as_deref(), self.row_id) {
            (Some(key), _) if !key.trim().is_empty() => key.to_string(),
            (_, Some(row_id)) => format!("{source}-row-{row_id}"),
            _ => format!("{source}-{}-{}", self.started_at.timestamp(), self.user_id),
        }
    }
}

/// Transcoder progress for a live session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscodeProgress {
    /// Furthest media offset the transcoder has produced
    pub max_offset_available_ms: u64,
    /// Transcode speed relative to real time (1.0 = keeping pace)
    pub speed: f64,
    #[serde(default)]
    pub throttled: bool,
}

/// A session currently playing on a real-time provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveSession {
    pub session_key: String,
    pub started_at: DateTime<Utc>,
    pub user_id: i64,
    pub username: String,
    pub ip_address: Option<String>,
    pub rating_key: Option<String>,
    pub title: String,
    pub media_type: String,
    pub machine_id: Option<String>,
    /// Current playback position
    pub view_offset_ms: u64,
    /// Present only while the session is being transcoded
    pub transcode: Option<TranscodeProgress>,
    #[serde(default)]
    pub metadata: PlaybackMetadata,
}

impl ActiveSession {
    /// View this live session as a history record for the shared pipeline.
    #[must_use]
    pub fn to_record(&self) -> HistoryRecord {
        HistoryRecord {
            row_id: None,
            session_key: Some(self.session_key.clone()),
            started_at: self.started_at,
            stopped_at: None,
            user_id: self.user_id,
            username: self.username.clone(),
            ip_address: self.ip_address.clone(),
            rating_key: self.rating_key.clone(),
            title: self.title.clone(),
            media_type: self.media_type.clone(),
            machine_id: self.machine_id.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

/// The canonical, enriched playback event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackEvent {
    pub id: Uuid,
    pub source: Source,
    pub server_id: Option<String>,
    pub session_key: String,
    pub correlation_key: CorrelationKey,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub user_id: i64,
    pub username: String,
    /// Normalized address (no port, no brackets)
    pub ip_address: String,
    pub rating_key: Option<String>,
    pub title: String,
    pub media_type: String,
    pub machine_id: Option<String>,
    pub location: Geolocation,
    pub metadata: PlaybackMetadata,
    pub created_at: DateTime<Utc>,
}

impl PlaybackEvent {
    /// Build the event for a validated record.
    ///
    /// `ip_address` must already be normalized; the correlation key is
    /// derived here, once, and never recomputed.
    #[must_use]
    pub fn from_record(
        record: &HistoryRecord,
        source: Source,
        server_id: Option<&str>,
        ip_address: String,
        location: Geolocation,
    ) -> Self {
        let session_key = record.effective_session_key(source);
        let correlation_key = CorrelationKey::derive(&CorrelationParts {
            source,
            server_id,
            user_id: record.user_id,
            rating_key: record.rating_key.as_deref(),
            title: &record.title,
            machine_id: record.machine_id.as_deref(),
            started_at: record.started_at,
            session_key: &session_key,
        });

        Self {
            id: Uuid::new_v4(),
            source,
            server_id: server_id.map(str::to_string),
            session_key,
            correlation_key,
            started_at: record.started_at,
            stopped_at: record.stopped_at,
            user_id: record.user_id,
            username: record.username.clone(),
            ip_address,
            rating_key: record.rating_key.clone(),
            title: record.title.clone(),
            media_type: record.media_type.clone(),
            machine_id: record.machine_id.clone(),
            location,
            metadata: record.metadata.clone(),
            created_at: Utc::now(),
        }
    }
}
