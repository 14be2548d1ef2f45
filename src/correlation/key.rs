// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Correlation key derivation.
//!
//! ```text
//! source : server_id : user_id : content_key : device_id : time_bucket : session_key
//! ```
//!
//! The middle five components (server through time bucket) form the
//! cross-source key: two sources reporting the same real playback agree on
//! it while their full keys still differ in the leading source and trailing
//! session key. The session key is percent-escaped (`%` and `:`) so the
//! last `:` always marks its boundary and distinct session keys never
//! collide.

use std::borrow::Cow;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::Source;

/// Server component when none is configured.
pub const DEFAULT_SERVER_ID: &str = "default";
/// Device component when the record carries no machine id.
pub const DEFAULT_DEVICE_ID: &str = "unknown";

const TIME_BUCKET_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Inputs to [`CorrelationKey::derive`].
#[derive(Debug, Clone)]
pub struct CorrelationParts<'a> {
    pub source: Source,
    pub server_id: Option<&'a str>,
    pub user_id: i64,
    /// Provider content identifier; the title is used when absent
    pub rating_key: Option<&'a str>,
    pub title: &'a str,
    pub machine_id: Option<&'a str>,
    pub started_at: DateTime<Utc>,
    pub session_key: &'a str,
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

/// Deterministic identity of one playback session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationKey(String);

impl CorrelationKey {
    #[must_use]
    pub fn derive(parts: &CorrelationParts<'_>) -> Self {
        let server = non_empty(parts.server_id).unwrap_or(DEFAULT_SERVER_ID);
        let content = non_empty(parts.rating_key).unwrap_or(parts.title);
        let device = non_empty(parts.machine_id).unwrap_or(DEFAULT_DEVICE_ID);
        let bucket = parts.started_at.format(TIME_BUCKET_FORMAT);
        let session = escape_session_key(parts.session_key);

        Self(format!(
            "{}:{}:{}:{}:{}:{}:{}",
            parts.source, server, parts.user_id, content, device, bucket, session
        ))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Leading source component.
    #[must_use]
    pub fn source(&self) -> &str {
        self.0.split_once(':').map_or(self.0.as_str(), |(source, _)| source)
    }

    /// Trailing source session key component, unescaped.
    #[must_use]
    pub fn session_key(&self) -> Cow<'_, str> {
        let raw = self.0.rsplit_once(':').map_or("", |(_, session)| session);
        unescape_session_key(raw)
    }

    /// Server, user, content, device and time bucket, without the source
    /// and session key.
    #[must_use]
    pub fn cross_source_key(&self) -> &str {
        let start = self.0.find(':').map_or(0, |i| i + 1);
        let end = self.0.rfind(':').unwrap_or(self.0.len());
        if start >= end {
            return "";
        }
        &self.0[start..end]
    }

    /// True when both keys describe the same real-world playback.
    #[must_use]
    pub fn is_cross_source_match(&self, other: &Self) -> bool {
        self.cross_source_key() == other.cross_source_key()
    }
}

fn escape_session_key(session_key: &str) -> Cow<'_, str> {
    if !session_key.contains(['%', ':']) {
        return Cow::Borrowed(session_key);
    }
    let mut escaped = String::with_capacity(session_key.len() + 4);
    for c in session_key.chars() {
        match c {
            '%' => escaped.push_str("%25"),
            ':' => escaped.push_str("%3A"),
            other => escaped.push(other),
        }
    }
    Cow::Owned(escaped)
}

fn unescape_session_key(escaped: &str) -> Cow<'_, str> {
    if !escaped.contains('%') {
        return Cow::Borrowed(escaped);
    }
    Cow::Owned(escaped.replace("%3A", ":").replace("%25", "%"))
}

impl std::fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
