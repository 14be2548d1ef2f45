// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Session identity and duplicate suppression.
//!
//! - [`CorrelationKey`]: deterministic cross-source identity of a playback
//! - [`SeenSessionCache`]: TTL-bounded noise filter for poll-based sources
//!
//! Durable dedup (the store's session-key existence check) lives in the
//! orchestrator's record pipeline; the seen cache is never relied on for
//! correctness since it is lost on restart.

mod key;
mod seen_cache;

pub use key::{CorrelationKey, CorrelationParts, DEFAULT_DEVICE_ID, DEFAULT_SERVER_ID};
pub use seen_cache::SeenSessionCache;
