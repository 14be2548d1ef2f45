// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! IP geolocation: model, address handling, providers and the resolver.
//!
//! Two sentinel locations stand in for addresses that cannot be placed:
//! [`Geolocation::local_network`] for private/loopback/link-local addresses
//! and [`Geolocation::unknown`] when every provider failed. Both sit at
//! `(0, 0)`, which is also a real coordinate, so callers tell resolved and
//! sentinel locations apart by the country field only.

pub mod address;
pub mod provider;
mod resolver;

pub use provider::{GeoProvider, IpApiProvider, MaxMindProvider, UpstreamGeoProvider};
pub use resolver::GeoResolver;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Country of the private-network sentinel.
pub const LOCAL_COUNTRY: &str = "Local";
/// City of the private-network sentinel.
pub const LOCAL_CITY: &str = "Local Network";
/// Country of the failed-lookup sentinel.
pub const UNKNOWN_COUNTRY: &str = "Unknown";

/// Location of one IP address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Geolocation {
    pub ip_address: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Empty means the lookup failed
    pub country: String,
    pub city: Option<String>,
    pub region: Option<String>,
    pub postal_code: Option<String>,
    pub timezone: Option<String>,
    pub accuracy_radius_km: Option<u32>,
    pub last_updated: DateTime<Utc>,
}

impl Geolocation {
    /// A location with only the required fields set.
    #[must_use]
    pub fn new(ip_address: impl Into<String>, latitude: f64, longitude: f64, country: impl Into<String>) -> Self {
        Self {
            ip_address: ip_address.into(),
            latitude,
            longitude,
            country: country.into(),
            city: None,
            region: None,
            postal_code: None,
            timezone: None,
            accuracy_radius_km: None,
            last_updated: Utc::now(),
        }
    }

    /// Sentinel for private, loopback and link-local addresses.
    #[must_use]
    pub fn local_network(ip_address: impl Into<String>) -> Self {
        let mut geo = Self::new(ip_address, 0.0, 0.0, LOCAL_COUNTRY);
        geo.city = Some(LOCAL_CITY.to_string());
        geo
    }

    /// Sentinel for an address no provider could place.
    #[must_use]
    pub fn unknown(ip_address: impl Into<String>) -> Self {
        Self::new(ip_address, 0.0, 0.0, UNKNOWN_COUNTRY)
    }

    /// A provider answered with a country. Coordinates are not consulted.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        !self.country.trim().is_empty()
    }

    #[must_use]
    pub fn is_local(&self) -> bool {
        self.country == LOCAL_COUNTRY && self.city.as_deref() == Some(LOCAL_CITY)
    }

    #[must_use]
    pub fn is_unknown(&self) -> bool {
        self.country == UNKNOWN_COUNTRY
    }
}
