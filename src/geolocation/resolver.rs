// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Geolocation resolution: in-memory cache → store → providers → sentinel.

use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::address;
use super::provider::{GeoProvider, IpApiProvider, MaxMindProvider, UpstreamGeoProvider};
use super::Geolocation;
use crate::config::GeolocationSettings;
use crate::resilience::{CircuitConfig, GuardError, ProtectedCall, RetryConfig};
use crate::storage::traits::PlaybackStore;
use crate::upstream::{HistoryProvider, ProviderError};

struct ProviderSlot {
    provider: Arc<dyn GeoProvider>,
    guard: ProtectedCall,
}

/// Resolves client addresses to locations. Never fails: an address no
/// provider can place resolves to [`Geolocation::unknown`].
///
/// Locations are treated as static; once cached (including sentinels) an
/// address is not looked up again.
pub struct GeoResolver {
    store: Arc<dyn PlaybackStore>,
    providers: Vec<ProviderSlot>,
    circuit: CircuitConfig,
    retry: RetryConfig,
    cache: RwLock<HashMap<String, Geolocation>>,
}

impl GeoResolver {
    /// A resolver with no providers; add them in priority order with
    /// [`with_provider`](Self::with_provider).
    pub fn new(store: Arc<dyn PlaybackStore>, circuit: CircuitConfig, retry: RetryConfig) -> Self {
        Self {
            store,
            providers: Vec::new(),
            circuit,
            retry,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// The history source's GeoIP lookup first (when given and enabled),
    /// then MaxMind (when credentials are set), then ip-api.com (when enabled).
    pub fn from_settings(
        store: Arc<dyn PlaybackStore>,
        settings: &GeolocationSettings,
        circuit: CircuitConfig,
        upstream: Option<Arc<dyn HistoryProvider>>,
    ) -> Result<Self, ProviderError> {
        let retry = RetryConfig::upstream(settings.retry_attempts, settings.retry_delay());
        let mut resolver = Self::new(store, circuit, retry);

        if let Some(history) = upstream {
            resolver = resolver.with_provider(Arc::new(UpstreamGeoProvider::new(history, settings.upstream_enabled)));
        }

        let maxmind = MaxMindProvider::new(
            settings.maxmind_account_id.clone().unwrap_or_default(),
            settings.maxmind_license_key.clone().unwrap_or_default(),
        )?;
        resolver = resolver.with_provider(Arc::new(maxmind));
        resolver = resolver.with_provider(Arc::new(IpApiProvider::new(settings.ip_api_enabled)?));

        info!(
            providers = ?resolver.available_providers(),
            "Geolocation resolver configured"
        );
        Ok(resolver)
    }

    /// Append a provider; each gets its own circuit breaker.
    #[must_use]
    pub fn with_provider(mut self, provider: Arc<dyn GeoProvider>) -> Self {
        let guard = ProtectedCall::new(format!("geo-{}", provider.name()), self.circuit.clone(), self.retry.clone());
        self.providers.push(ProviderSlot { provider, guard });
        self
    }

    /// Names of providers currently enabled, in lookup order.
    #[must_use]
    pub fn available_providers(&self) -> Vec<String> {
        self.providers
            .iter()
            .filter(|slot| slot.provider.is_available())
            .map(|slot| slot.provider.name().to_string())
            .collect()
    }

    /// Number of addresses held in the in-memory cache.
    #[must_use]
    pub fn cached_len(&self) -> usize {
        self.cache.read().len()
    }

    /// Resolve one address. Accepts raw reported addresses (port/brackets).
    #[tracing::instrument(skip_all, fields(ip = %raw_ip))]
    pub async fn resolve(&self, raw_ip: &str, cancel: &CancellationToken) -> Geolocation {
        let Some(ip) = address::parse(raw_ip) else {
            debug!("Unparsable address, using unknown location");
            crate::metrics::record_geolocation("invalid");
            return Geolocation::unknown(address::normalize(raw_ip));
        };
        let key = ip.to_string();

        if address::is_local(&ip) {
            debug!("Private address, using local network location");
            crate::metrics::record_geolocation("local");
            let geo = Geolocation::local_network(&key);
            self.remember(&geo).await;
            return geo;
        }

        if let Some(geo) = self.cached(&key).await {
            crate::metrics::record_geolocation("cache_hit");
            return geo;
        }

        self.lookup_providers(ip, &key, cancel).await
    }

    /// Resolve a set of addresses, bulk-loading known locations from the
    /// store first. Keys of the result are normalized addresses.
    pub async fn resolve_many(&self, raw_ips: &[String], cancel: &CancellationToken) -> HashMap<String, Geolocation> {
        let unique: BTreeSet<String> = raw_ips
            .iter()
            .filter_map(|raw| address::parse(raw))
            .map(|ip| ip.to_string())
            .collect();

        let mut resolved = HashMap::with_capacity(unique.len());
        let mut misses = Vec::new();
        {
            let cache = self.cache.read();
            for key in unique {
                match cache.get(&key) {
                    Some(geo) => {
                        resolved.insert(key, geo.clone());
                    }
                    None => misses.push(key),
                }
            }
        }

        let remote_misses: Vec<String> = misses
            .iter()
            .filter(|key| key.parse::<IpAddr>().is_ok_and(|ip| !address::is_local(&ip)))
            .cloned()
            .collect();
        if !remote_misses.is_empty() {
            match self.store.get_locations(&remote_misses).await {
                Ok(found) => {
                    let mut cache = self.cache.write();
                    for (key, geo) in found.into_iter().filter(|(_, geo)| geo.is_resolved()) {
                        cache.insert(key.clone(), geo.clone());
                        resolved.insert(key, geo);
                    }
                }
                Err(e) => {
                    warn!(error = %e, count = remote_misses.len(), "Bulk location load failed, resolving individually");
                }
            }
        }

        for key in misses {
            if !resolved.contains_key(&key) {
                let geo = self.resolve(&key, cancel).await;
                resolved.insert(key, geo);
            }
        }
        resolved
    }

    async fn cached(&self, key: &str) -> Option<Geolocation> {
        let hit = self.cache.read().get(key).cloned();
        if hit.is_some() {
            return hit;
        }
        match self.store.get_location(key).await {
            Ok(Some(geo)) if geo.is_resolved() => {
                self.cache.write().insert(key.to_string(), geo.clone());
                Some(geo)
            }
            Ok(_) => None,
            Err(e) => {
                warn!(ip = %key, error = %e, "Location store read failed, treating as miss");
                None
            }
        }
    }

    async fn remember(&self, geo: &Geolocation) {
        self.cache.write().insert(geo.ip_address.clone(), geo.clone());
        if let Err(e) = self.store.upsert_location(geo).await {
            warn!(ip = %geo.ip_address, error = %e, "Failed to persist location");
        }
    }

    async fn lookup_providers(&self, ip: IpAddr, key: &str, cancel: &CancellationToken) -> Geolocation {
        for slot in &self.providers {
            if !slot.provider.is_available() {
                continue;
            }
            let provider = slot.provider.as_ref();
            let result = slot
                .guard
                .execute("lookup", cancel, || async move {
                    let geo = provider.lookup(ip).await?;
                    if geo.is_resolved() {
                        Ok(geo)
                    } else {
                        Err(ProviderError::EmptyCountry { provider: provider.name().to_string() })
                    }
                })
                .await;

            match result {
                Ok(mut geo) => {
                    geo.ip_address = key.to_string();
                    debug!(provider = provider.name(), country = %geo.country, "Resolved location");
                    crate::metrics::record_geolocation("provider");
                    self.remember(&geo).await;
                    return geo;
                }
                Err(GuardError::Cancelled) => {
                    debug!("Lookup cancelled, returning uncached unknown location");
                    return Geolocation::unknown(key);
                }
                Err(e) => {
                    warn!(provider = provider.name(), ip = %key, error = %e, "Geolocation provider failed");
                }
            }
        }

        warn!(ip = %key, "All geolocation providers failed, caching unknown location");
        crate::metrics::record_geolocation("unknown");
        let geo = Geolocation::unknown(key);
        self.remember(&geo).await;
        geo
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{HistoryRecord, Source};
    use crate::storage::memory::InMemoryStore;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct ScriptedProvider {
        name: &'static str,
        available: bool,
        response: Option<Geolocation>,
        calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn answering(name: &'static str, geo: Geolocation) -> Arc<Self> {
            Arc::new(Self { name, available: true, response: Some(geo), calls: AtomicUsize::new(0) })
        }

        fn failing(name: &'static str) -> Arc<Self> {
            Arc::new(Self { name, available: true, response: None, calls: AtomicUsize::new(0) })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl GeoProvider for ScriptedProvider {
        fn name(&self) -> &str {
            self.name
        }

        fn is_available(&self) -> bool {
            self.available
        }

        async fn lookup(&self, _ip: IpAddr) -> Result<Geolocation, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.response.clone().ok_or(ProviderError::Status { provider: self.name.into(), status: 503 })
        }
    }

    /// History source whose GeoIP endpoint answers from a fixed result.
    struct GeoHistory {
        answer: Option<Geolocation>,
        calls: AtomicUsize,
    }

    impl GeoHistory {
        fn new(answer: Option<Geolocation>) -> Arc<Self> {
            Arc::new(Self { answer, calls: AtomicUsize::new(0) })
        }
    }

    #[async_trait]
    impl HistoryProvider for GeoHistory {
        fn source(&self) -> Source {
            Source::Tautulli
        }

        async fn fetch_history_since(
            &self,
            _since: DateTime<Utc>,
            _offset: usize,
            _limit: usize,
        ) -> Result<Vec<HistoryRecord>, ProviderError> {
            Ok(Vec::new())
        }

        async fn lookup_geoip(&self, _ip: IpAddr) -> Result<Geolocation, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answer.clone().ok_or(ProviderError::Status { provider: "tautulli".into(), status: 500 })
        }

        async fn ping(&self) -> Result<(), ProviderError> {
            Ok(())
        }
    }

    fn offline_settings() -> GeolocationSettings {
        GeolocationSettings { ip_api_enabled: false, retry_attempts: 1, retry_delay_ms: 1, ..Default::default() }
    }

    fn resolver(store: Arc<InMemoryStore>) -> GeoResolver {
        GeoResolver::new(store, CircuitConfig::default(), RetryConfig::upstream(2, Duration::from_millis(1)))
    }

    #[tokio::test]
    async fn test_private_addresses_never_reach_providers() {
        let store = Arc::new(InMemoryStore::new());
        let provider = ScriptedProvider::answering("p", Geolocation::new("x", 1.0, 1.0, "France"));
        let resolver = resolver(store.clone()).with_provider(provider.clone());
        let cancel = CancellationToken::new();

        for raw in ["192.168.1.20:32400", "10.0.0.1", "[::1]:80", "169.254.3.3"] {
            let geo = resolver.resolve(raw, &cancel).await;
            assert!(geo.is_local(), "{raw}");
        }

        assert_eq!(provider.calls(), 0);
        assert!(store.get_location("192.168.1.20").await.unwrap().unwrap().is_local());
    }

    #[tokio::test]
    async fn test_falls_through_to_next_provider() {
        let store = Arc::new(InMemoryStore::new());
        let first = ScriptedProvider::failing("first");
        let second = ScriptedProvider::answering("second", Geolocation::new("ignored", 48.8, 2.3, "France"));
        let resolver = resolver(store.clone()).with_provider(first.clone()).with_provider(second.clone());

        let geo = resolver.resolve("203.0.113.10:1234", &CancellationToken::new()).await;

        assert_eq!(geo.country, "France");
        assert_eq!(geo.ip_address, "203.0.113.10");
        assert_eq!(first.calls(), 2);
        assert_eq!(second.calls(), 1);
        assert!(store.get_location("203.0.113.10").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_all_failing_caches_unknown() {
        let store = Arc::new(InMemoryStore::new());
        let provider = ScriptedProvider::failing("only");
        let resolver = resolver(store.clone()).with_provider(provider.clone());
        let cancel = CancellationToken::new();

        let geo = resolver.resolve("198.51.100.4", &cancel).await;
        assert!(geo.is_unknown());
        let calls_after_first = provider.calls();

        let again = resolver.resolve("198.51.100.4", &cancel).await;
        assert!(again.is_unknown());
        assert_eq!(provider.calls(), calls_after_first);
    }

    #[tokio::test]
    async fn test_empty_country_is_provider_failure() {
        let store = Arc::new(InMemoryStore::new());
        let empty = ScriptedProvider::answering("empty", Geolocation::new("x", 0.0, 0.0, ""));
        let null_island = ScriptedProvider::answering("null-island", Geolocation::new("x", 0.0, 0.0, "Ghana"));
        let resolver = resolver(store).with_provider(empty.clone()).with_provider(null_island.clone());

        let geo = resolver.resolve("198.51.100.5", &CancellationToken::new()).await;

        assert_eq!(geo.country, "Ghana");
        assert_eq!((geo.latitude, geo.longitude), (0.0, 0.0));
        assert_eq!(empty.calls(), 2);
        assert_eq!(null_island.calls(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_providers_are_skipped() {
        let store = Arc::new(InMemoryStore::new());
        let disabled = Arc::new(ScriptedProvider {
            name: "disabled",
            available: false,
            response: Some(Geolocation::new("x", 1.0, 1.0, "Spain")),
            calls: AtomicUsize::new(0),
        });
        let resolver = resolver(store).with_provider(disabled.clone());

        let geo = resolver.resolve("198.51.100.6", &CancellationToken::new()).await;
        assert!(geo.is_unknown());
        assert_eq!(disabled.calls(), 0);
        assert!(resolver.available_providers().is_empty());
    }

    #[tokio::test]
    async fn test_store_hit_skips_providers() {
        let store = Arc::new(InMemoryStore::new());
        store.upsert_location(&Geolocation::new("198.51.100.7", 35.6, 139.6, "Japan")).await.unwrap();
        let provider = ScriptedProvider::failing("p");
        let resolver = resolver(store).with_provider(provider.clone());

        let geo = resolver.resolve("198.51.100.7", &CancellationToken::new()).await;
        assert_eq!(geo.country, "Japan");
        assert_eq!(provider.calls(), 0);
        assert_eq!(resolver.cached_len(), 1);
    }

    #[tokio::test]
    async fn test_resolve_many_uses_bulk_store_load() {
        let store = Arc::new(InMemoryStore::new());
        store.upsert_location(&Geolocation::new("198.51.100.8", 1.0, 1.0, "Peru")).await.unwrap();
        let provider = ScriptedProvider::answering("p", Geolocation::new("x", 2.0, 2.0, "Chile"));
        let resolver = resolver(store).with_provider(provider.clone());

        let raw = vec![
            "198.51.100.8:1000".to_string(),
            "198.51.100.8".to_string(),
            "198.51.100.9".to_string(),
            "192.168.0.2".to_string(),
            "N/A".to_string(),
        ];
        let resolved = resolver.resolve_many(&raw, &CancellationToken::new()).await;

        assert_eq!(resolved.len(), 3);
        assert_eq!(resolved["198.51.100.8"].country, "Peru");
        assert_eq!(resolved["198.51.100.9"].country, "Chile");
        assert!(resolved["192.168.0.2"].is_local());
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_lookup_is_not_cached() {
        let store = Arc::new(InMemoryStore::new());
        let provider = ScriptedProvider::answering("p", Geolocation::new("x", 2.0, 2.0, "Chile"));
        let resolver = resolver(store.clone()).with_provider(provider.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let geo = resolver.resolve("198.51.100.10", &cancel).await;
        assert!(geo.is_unknown());
        assert!(store.get_location("198.51.100.10").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_history_source_lookup_is_tried_first() {
        let history = GeoHistory::new(Some(Geolocation::new("x", 52.5, 13.4, "Germany")));
        let upstream: Arc<dyn HistoryProvider> = history.clone();
        let fallback = ScriptedProvider::answering("fallback", Geolocation::new("x", 1.0, 1.0, "France"));
        let resolver = GeoResolver::from_settings(
            Arc::new(InMemoryStore::new()),
            &offline_settings(),
            CircuitConfig::default(),
            Some(upstream),
        )
        .unwrap()
        .with_provider(fallback.clone());

        assert_eq!(resolver.available_providers(), vec!["tautulli", "fallback"]);

        let geo = resolver.resolve("198.51.100.20", &CancellationToken::new()).await;
        assert_eq!(geo.country, "Germany");
        assert_eq!(geo.ip_address, "198.51.100.20");
        assert_eq!(history.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fallback.calls(), 0);
    }

    #[tokio::test]
    async fn test_history_source_failure_falls_back() {
        let history = GeoHistory::new(None);
        let upstream: Arc<dyn HistoryProvider> = history.clone();
        let fallback = ScriptedProvider::answering("fallback", Geolocation::new("x", 1.0, 1.0, "France"));
        let resolver = GeoResolver::from_settings(
            Arc::new(InMemoryStore::new()),
            &offline_settings(),
            CircuitConfig::default(),
            Some(upstream),
        )
        .unwrap()
        .with_provider(fallback.clone());

        let geo = resolver.resolve("198.51.100.21", &CancellationToken::new()).await;
        assert_eq!(geo.country, "France");
        assert_eq!(history.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fallback.calls(), 1);
    }

    #[tokio::test]
    async fn test_history_source_lookup_can_be_disabled() {
        let history = GeoHistory::new(Some(Geolocation::new("x", 52.5, 13.4, "Germany")));
        let upstream: Arc<dyn HistoryProvider> = history.clone();
        let settings = GeolocationSettings { upstream_enabled: false, ..offline_settings() };
        let resolver =
            GeoResolver::from_settings(Arc::new(InMemoryStore::new()), &settings, CircuitConfig::default(), Some(upstream))
                .unwrap();

        let geo = resolver.resolve("198.51.100.22", &CancellationToken::new()).await;
        assert!(geo.is_unknown());
        assert_eq!(history.calls.load(Ordering::SeqCst), 0);
    }
}
