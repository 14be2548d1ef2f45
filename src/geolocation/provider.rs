// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Geolocation providers.
//!
//! - [`UpstreamGeoProvider`]: the history source's own GeoIP endpoint
//! - [`MaxMindProvider`]: GeoLite2 web service, needs an account id and license key
//! - [`IpApiProvider`]: free ip-api.com endpoint, 45 requests per minute

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::Geolocation;
use crate::upstream::{HistoryProvider, ProviderError};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A source of IP geolocation.
#[async_trait]
pub trait GeoProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the provider is configured and enabled.
    fn is_available(&self) -> bool;

    async fn lookup(&self, ip: IpAddr) -> Result<Geolocation, ProviderError>;
}

fn http_client() -> Result<reqwest::Client, ProviderError> {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(ProviderError::from)
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

// ========================================
// History source GeoIP
// ========================================

/// Delegates to [`HistoryProvider::lookup_geoip`].
pub struct UpstreamGeoProvider {
    history: Arc<dyn HistoryProvider>,
    name: &'static str,
    enabled: bool,
}

impl UpstreamGeoProvider {
    #[must_use]
    pub fn new(history: Arc<dyn HistoryProvider>, enabled: bool) -> Self {
        let name = history.source().as_str();
        Self { history, name, enabled }
    }
}

#[async_trait]
impl GeoProvider for UpstreamGeoProvider {
    fn name(&self) -> &str {
        self.name
    }

    fn is_available(&self) -> bool {
        self.enabled
    }

    async fn lookup(&self, ip: IpAddr) -> Result<Geolocation, ProviderError> {
        self.history.lookup_geoip(ip).await
    }
}

// ========================================
// MaxMind GeoLite2
// ========================================

pub struct MaxMindProvider {
    client: reqwest::Client,
    account_id: String,
    license_key: String,
    base_url: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Names {
    names: HashMap<String, String>,
}

impl Names {
    fn english(&self) -> &str {
        self.names.get("en").map_or("", String::as_str)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MaxMindLocation {
    latitude: f64,
    longitude: f64,
    time_zone: String,
    accuracy_radius: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MaxMindPostal {
    code: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MaxMindResponse {
    city: Names,
    country: Names,
    location: MaxMindLocation,
    postal: MaxMindPostal,
    subdivisions: Vec<Names>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MaxMindErrorResponse {
    code: String,
    error: String,
}

impl MaxMindResponse {
    fn into_geolocation(self, ip: IpAddr) -> Geolocation {
        let mut geo = Geolocation::new(
            ip.to_string(),
            self.location.latitude,
            self.location.longitude,
            self.country.english(),
        );
        geo.city = non_empty(self.city.english());
        geo.region = self.subdivisions.first().and_then(|s| non_empty(s.english()));
        geo.postal_code = non_empty(&self.postal.code);
        geo.timezone = non_empty(&self.location.time_zone);
        geo.accuracy_radius_km = self.location.accuracy_radius;
        geo.last_updated = Utc::now();
        geo
    }
}

impl MaxMindProvider {
    pub const NAME: &'static str = "maxmind-geolite2";

    pub fn new(account_id: impl Into<String>, license_key: impl Into<String>) -> Result<Self, ProviderError> {
        Ok(Self {
            client: http_client()?,
            account_id: account_id.into(),
            license_key: license_key.into(),
            base_url: "https://geolite.info/geoip/v2.1/city".to_string(),
        })
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl GeoProvider for MaxMindProvider {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn is_available(&self) -> bool {
        !self.account_id.is_empty() && !self.license_key.is_empty()
    }

    async fn lookup(&self, ip: IpAddr) -> Result<Geolocation, ProviderError> {
        if !self.is_available() {
            return Err(ProviderError::NotConfigured(Self::NAME.to_string()));
        }

        let response = self
            .client
            .get(format!("{}/{}", self.base_url, ip))
            .basic_auth(&self.account_id, Some(&self.license_key))
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match serde_json::from_str::<MaxMindErrorResponse>(&body) {
                Ok(err) if !err.error.is_empty() => ProviderError::Lookup {
                    provider: Self::NAME.to_string(),
                    message: format!("{}: {}", err.code, err.error),
                },
                _ => ProviderError::Status {
                    provider: Self::NAME.to_string(),
                    status: status.as_u16(),
                },
            });
        }

        let body: MaxMindResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        Ok(body.into_geolocation(ip))
    }
}

// ========================================
// ip-api.com
// ========================================

/// Token bucket refilled one token per `refill_every`.
#[derive(Debug)]
struct RateLimiter {
    max_tokens: u32,
    refill_every: Duration,
    state: Mutex<(u32, Instant)>,
}

impl RateLimiter {
    fn new(max_tokens: u32, refill_every: Duration) -> Self {
        Self {
            max_tokens,
            refill_every,
            state: Mutex::new((max_tokens, Instant::now())),
        }
    }

    fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        let (tokens, last_refill) = &mut *state;

        let refills = (last_refill.elapsed().as_nanos() / self.refill_every.as_nanos().max(1)) as u32;
        if refills > 0 {
            *tokens = (*tokens).saturating_add(refills).min(self.max_tokens);
            *last_refill += self.refill_every * refills;
        }

        if *tokens == 0 {
            return false;
        }
        *tokens -= 1;
        true
    }
}

pub struct IpApiProvider {
    client: reqwest::Client,
    limiter: RateLimiter,
    base_url: String,
    enabled: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct IpApiResponse {
    status: String,
    message: String,
    country: String,
    region_name: String,
    city: String,
    zip: String,
    lat: f64,
    lon: f64,
    timezone: String,
}

impl IpApiResponse {
    fn into_geolocation(self, ip: IpAddr) -> Result<Geolocation, ProviderError> {
        if self.status != "success" {
            return Err(ProviderError::Lookup {
                provider: IpApiProvider::NAME.to_string(),
                message: self.message,
            });
        }
        let mut geo = Geolocation::new(ip.to_string(), self.lat, self.lon, self.country);
        geo.city = non_empty(&self.city);
        geo.region = non_empty(&self.region_name);
        geo.postal_code = non_empty(&self.zip);
        geo.timezone = non_empty(&self.timezone);
        Ok(geo)
    }
}

impl IpApiProvider {
    pub const NAME: &'static str = "ip-api.com";
    const REQUESTS_PER_MINUTE: u32 = 45;
    const FIELDS: &'static str = "status,message,country,regionName,city,zip,lat,lon,timezone";

    pub fn new(enabled: bool) -> Result<Self, ProviderError> {
        Ok(Self {
            client: http_client()?,
            limiter: RateLimiter::new(
                Self::REQUESTS_PER_MINUTE,
                Duration::from_secs(60) / Self::REQUESTS_PER_MINUTE,
            ),
            base_url: "http://ip-api.com/json".to_string(),
            enabled,
        })
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl GeoProvider for IpApiProvider {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn is_available(&self) -> bool {
        self.enabled
    }

    async fn lookup(&self, ip: IpAddr) -> Result<Geolocation, ProviderError> {
        if !self.limiter.try_acquire() {
            return Err(ProviderError::RateLimited(Self::NAME.to_string()));
        }

        let response = self
            .client
            .get(format!("{}/{}?fields={}", self.base_url, ip, Self::FIELDS))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::Status {
                provider: Self::NAME.to_string(),
                status: status.as_u16(),
            });
        }

        let body: IpApiResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        body.into_geolocation(ip)
    }
}
