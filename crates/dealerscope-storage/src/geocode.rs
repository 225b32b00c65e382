//! Postal-code geocoding with an in-process cache and upstream call spacing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use dealerscope_core::Coordinates;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::RequestSpacer;

#[derive(Debug, Clone)]
pub struct GeocoderConfig {
    pub base_url: String,
    pub country: String,
    pub user_agent: String,
    pub timeout: Duration,
    pub min_spacing: Duration,
    pub negative_ttl: Duration,
}

impl Default for GeocoderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://nominatim.openstreetmap.org".to_string(),
            country: "Germany".to_string(),
            user_agent: "dealerscope/0.1".to_string(),
            timeout: Duration::from_secs(20),
            min_spacing: Duration::from_secs(1),
            negative_ttl: Duration::from_secs(6 * 60 * 60),
        }
    }
}

#[derive(Debug, Error)]
pub enum GeocodeError {
    #[error("geocoder request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("geocoder returned http status {status}")]
    HttpStatus { status: u16 },
    #[error("unparseable geocoder response: {0}")]
    Parse(String),
}

/// Upstream coordinate lookup. `Ok(None)` is a valid "no match" answer.
#[async_trait]
pub trait GeocodeBackend: Send + Sync {
    async fn lookup(
        &self,
        postal_code: &str,
        city: Option<&str>,
    ) -> Result<Option<Coordinates>, GeocodeError>;
}

#[derive(Debug)]
pub struct NominatimBackend {
    client: reqwest::Client,
    base_url: String,
    country: String,
}

#[derive(Debug, Deserialize)]
struct NominatimPlace {
    lat: String,
    lon: String,
}

impl NominatimBackend {
    pub fn new(config: &GeocoderConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .context("building geocoder http client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            country: config.country.clone(),
        })
    }
}

#[async_trait]
impl GeocodeBackend for NominatimBackend {
    async fn lookup(
        &self,
        postal_code: &str,
        city: Option<&str>,
    ) -> Result<Option<Coordinates>, GeocodeError> {
        let mut params = vec![
            ("postalcode", postal_code),
            ("country", self.country.as_str()),
            ("format", "json"),
            ("limit", "1"),
        ];
        if let Some(city) = city {
            params.push(("city", city));
        }

        let resp = self
            .client
            .get(format!("{}/search", self.base_url))
            .query(&params)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(GeocodeError::HttpStatus {
                status: status.as_u16(),
            });
        }

        let places: Vec<NominatimPlace> = resp
            .json()
            .await
            .map_err(|e| GeocodeError::Parse(e.to_string()))?;
        let Some(first) = places.into_iter().next() else {
            return Ok(None);
        };
        let latitude = first
            .lat
            .trim()
            .parse::<f64>()
            .map_err(|e| GeocodeError::Parse(format!("lat `{}`: {e}", first.lat)))?;
        let longitude = first
            .lon
            .trim()
            .parse::<f64>()
            .map_err(|e| GeocodeError::Parse(format!("lon `{}`: {e}", first.lon)))?;
        Ok(Some(Coordinates::new(latitude, longitude)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    postal_code: String,
    city: Option<String>,
}

impl CacheKey {
    fn new(postal_code: &str, city: Option<&str>) -> Self {
        Self {
            postal_code: postal_code.trim().to_string(),
            city: city
                .map(dealerscope_core::normalize_key_fragment)
                .filter(|c| !c.is_empty()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum CacheEntry {
    Found(Coordinates),
    Missing { expires_at: Instant },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResolverStats {
    pub cache_hits: u64,
    pub upstream_calls: u64,
    pub upstream_failures: u64,
}

impl ResolverStats {
    pub fn since(&self, earlier: &ResolverStats) -> ResolverStats {
        ResolverStats {
            cache_hits: self.cache_hits.saturating_sub(earlier.cache_hits),
            upstream_calls: self.upstream_calls.saturating_sub(earlier.upstream_calls),
            upstream_failures: self.upstream_failures.saturating_sub(earlier.upstream_failures),
        }
    }
}

#[derive(Default)]
struct ResolverCounters {
    cache_hits: AtomicU64,
    upstream_calls: AtomicU64,
    upstream_failures: AtomicU64,
}

/// Shared, serialized front for a [`GeocodeBackend`].
///
/// Successful lookups are cached for the life of the process. A valid empty
/// answer is remembered for `negative_ttl`; transport and parse failures are
/// never cached so the next call asks upstream again.
pub struct CoordinateResolver {
    backend: Box<dyn GeocodeBackend>,
    cache: Mutex<HashMap<CacheKey, CacheEntry>>,
    upstream_turn: Mutex<()>,
    spacer: RequestSpacer,
    negative_ttl: Duration,
    counters: ResolverCounters,
}

impl CoordinateResolver {
    pub fn new(backend: Box<dyn GeocodeBackend>, min_spacing: Duration, negative_ttl: Duration) -> Self {
        Self {
            backend,
            cache: Mutex::new(HashMap::new()),
            upstream_turn: Mutex::new(()),
            spacer: RequestSpacer::new(min_spacing),
            negative_ttl,
            counters: ResolverCounters::default(),
        }
    }

    pub fn nominatim(config: &GeocoderConfig) -> anyhow::Result<Self> {
        let backend = NominatimBackend::new(config)?;
        Ok(Self::new(
            Box::new(backend),
            config.min_spacing,
            config.negative_ttl,
        ))
    }

    pub async fn resolve(&self, postal_code: &str, city: Option<&str>) -> Option<Coordinates> {
        let key = CacheKey::new(postal_code, city);
        if key.postal_code.is_empty() {
            return None;
        }

        if let Some(hit) = self.cached(&key).await {
            self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            return hit;
        }

        let _turn = self.upstream_turn.lock().await;
        // Another caller may have resolved the same key while we queued.
        if let Some(hit) = self.cached(&key).await {
            self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            return hit;
        }

        self.spacer.wait_turn().await;
        self.counters.upstream_calls.fetch_add(1, Ordering::Relaxed);
        let city = city.map(str::trim).filter(|c| !c.is_empty());
        match self.backend.lookup(&key.postal_code, city).await {
            Ok(Some(coordinates)) => {
                debug!(postal_code = %key.postal_code, ?city, "geocoded");
                self.cache
                    .lock()
                    .await
                    .insert(key, CacheEntry::Found(coordinates));
                Some(coordinates)
            }
            Ok(None) => {
                debug!(postal_code = %key.postal_code, ?city, "no geocoding match");
                self.cache.lock().await.insert(
                    key,
                    CacheEntry::Missing {
                        expires_at: Instant::now() + self.negative_ttl,
                    },
                );
                None
            }
            Err(err) => {
                self.counters.upstream_failures.fetch_add(1, Ordering::Relaxed);
                warn!(postal_code = %key.postal_code, ?city, error = %err, "geocoding unavailable");
                None
            }
        }
    }

    pub fn stats(&self) -> ResolverStats {
        ResolverStats {
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            upstream_calls: self.counters.upstream_calls.load(Ordering::Relaxed),
            upstream_failures: self.counters.upstream_failures.load(Ordering::Relaxed),
        }
    }

    async fn cached(&self, key: &CacheKey) -> Option<Option<Coordinates>> {
        let mut cache = self.cache.lock().await;
        match cache.get(key).copied() {
            Some(CacheEntry::Found(c)) => Some(Some(c)),
            Some(CacheEntry::Missing { expires_at }) if Instant::now() < expires_at => Some(None),
            Some(CacheEntry::Missing { .. }) => {
                cache.remove(key);
                None
            }
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::CountingBackend;
    use std::sync::Arc;

    fn resolver(backend: CountingBackend, negative_ttl: Duration) -> (CoordinateResolver, Arc<AtomicU64>) {
        let calls = backend.calls.clone();
        (
            CoordinateResolver::new(Box::new(backend), Duration::from_millis(1), negative_ttl),
            calls,
        )
    }

    #[tokio::test]
    async fn same_postal_code_hits_upstream_once() {
        let coords = Coordinates::new(49.2354, 6.9965);
        let (resolver, calls) = resolver(CountingBackend::always(Some(coords)), Duration::from_secs(60));

        assert_eq!(resolver.resolve("66111", None).await, Some(coords));
        assert_eq!(resolver.resolve(" 66111 ", None).await, Some(coords));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(resolver.stats().cache_hits, 1);
        assert_eq!(resolver.stats().upstream_calls, 1);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_lookup() {
        let coords = Coordinates::new(52.52, 13.40);
        let (resolver, calls) = resolver(CountingBackend::always(Some(coords)), Duration::from_secs(60));
        let resolver = Arc::new(resolver);

        let mut handles = Vec::new();
        for _ in 0..4 {
            let resolver = resolver.clone();
            handles.push(tokio::spawn(async move { resolver.resolve("10115", Some("Berlin")).await }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), Some(coords));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transport_failure_is_not_cached() {
        let coords = Coordinates::new(48.13, 11.58);
        let backend = CountingBackend::scripted(
            vec![Err(GeocodeError::HttpStatus { status: 503 })],
            Some(coords),
        );
        let (resolver, calls) = resolver(backend, Duration::from_secs(60));

        assert_eq!(resolver.resolve("80331", None).await, None);
        assert_eq!(resolver.resolve("80331", None).await, Some(coords));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(resolver.stats().upstream_failures, 1);
    }

    #[tokio::test]
    async fn empty_answer_is_cached_until_ttl_expires() {
        let (resolver, calls) = resolver(CountingBackend::always(None), Duration::from_millis(30));

        assert_eq!(resolver.resolve("00000", None).await, None);
        assert_eq!(resolver.resolve("00000", None).await, None);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(resolver.resolve("00000", None).await, None);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn city_is_part_of_cache_key() {
        let (resolver, calls) = resolver(
            CountingBackend::always(Some(Coordinates::new(1.0, 2.0))),
            Duration::from_secs(60),
        );
        resolver.resolve("66111", Some("Saarbrücken")).await;
        resolver.resolve("66111", Some("SAARBRÜCKEN ")).await;
        resolver.resolve("66111", None).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn blank_postal_code_never_calls_upstream() {
        let (resolver, calls) = resolver(CountingBackend::always(None), Duration::from_secs(60));
        assert_eq!(resolver.resolve("   ", Some("Berlin")).await, None);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
