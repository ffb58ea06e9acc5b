//! JWKS fetching and caching.
//!
//! The cache is keyed by JWKS URI and bounded by `max_entries`; inserting past
//! the bound evicts the entry fetched longest ago. Freshness is judged with an
//! injected [`Clock`]:
//!
//! - an entry younger than `ttl` is served without I/O;
//! - a stale or missing entry is fetched (one fetch at a time, callers that
//!   queued behind it reuse its result);
//! - a forced refresh (unknown `kid`) is throttled by `min_refresh_interval`,
//!   measured from the last fetch *attempt*;
//! - if a fetch fails while an older entry exists, the older entry is served.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use jsonwebtoken::jwk::JwkSet;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, warn};

use super::OidcError;
use super::clock::Clock;
use crate::config::OidcConfig;

/// Where key sets come from
#[async_trait]
pub trait KeySetSource: Send + Sync {
    /// Fetch the key set published at `uri`
    async fn fetch(&self, uri: &str) -> Result<JwkSet, OidcError>;
}

/// Fetches key sets over HTTP(S)
pub struct HttpKeySetSource {
    http: reqwest::Client,
}

impl HttpKeySetSource {
    /// Build the HTTP client; `require_https` refuses plain-HTTP URIs
    pub fn new(require_https: bool, timeout: Duration) -> Result<Self, OidcError> {
        let http = reqwest::Client::builder()
            .https_only(require_https)
            .timeout(timeout)
            .build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl KeySetSource for HttpKeySetSource {
    async fn fetch(&self, uri: &str) -> Result<JwkSet, OidcError> {
        debug!(jwks_uri = %uri, "Fetching JWKS");
        let jwks = self
            .http
            .get(uri)
            .send()
            .await?
            .error_for_status()?
            .json::<JwkSet>()
            .await?;
        Ok(jwks)
    }
}

/// Serves a fixed key set; keys can be swapped and failures injected
#[derive(Debug)]
pub struct StaticKeySetSource {
    keys: RwLock<JwkSet>,
    failing: RwLock<bool>,
    fetches: AtomicUsize,
}

impl StaticKeySetSource {
    /// Serve `keys`
    #[must_use]
    pub fn new(keys: JwkSet) -> Self {
        Self {
            keys: RwLock::new(keys),
            failing: RwLock::new(false),
            fetches: AtomicUsize::new(0),
        }
    }

    /// Replace the served key set (key rotation)
    pub fn set_keys(&self, keys: JwkSet) {
        *self.keys.write() = keys;
    }

    /// Make subsequent fetches fail
    pub fn set_failing(&self, failing: bool) {
        *self.failing.write() = failing;
    }

    /// Number of fetches served so far
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl KeySetSource for StaticKeySetSource {
    async fn fetch(&self, uri: &str) -> Result<JwkSet, OidcError> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        if *self.failing.read() {
            return Err(OidcError::KeySetUnavailable(uri.to_string()));
        }
        Ok(self.keys.read().clone())
    }
}

/// Cache tuning
#[derive(Debug, Clone)]
pub struct JwksCacheSettings {
    /// Age after which an entry is refetched
    pub ttl: Duration,
    /// Maximum number of cached key sets
    pub max_entries: usize,
    /// Minimum spacing between forced refreshes
    pub min_refresh_interval: Duration,
}

impl Default for JwksCacheSettings {
    fn default() -> Self {
        Self::from(&OidcConfig::default())
    }
}

impl From<&OidcConfig> for JwksCacheSettings {
    fn from(config: &OidcConfig) -> Self {
        Self {
            ttl: config.cache_ttl,
            max_entries: config.cache_max_entries.max(1),
            min_refresh_interval: config.min_refresh_interval,
        }
    }
}

/// Cache counters
#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    refreshes: AtomicU64,
    evictions: AtomicU64,
    fetch_errors: AtomicU64,
    stale_served: AtomicU64,
}

/// Point-in-time copy of the cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JwksCacheStats {
    /// Lookups answered without fetching
    pub hits: u64,
    /// Fetches performed
    pub refreshes: u64,
    /// Entries evicted to respect `max_entries`
    pub evictions: u64,
    /// Failed fetches
    pub fetch_errors: u64,
    /// Failed fetches answered with an older entry
    pub stale_served: u64,
}

struct CachedKeySet {
    keys: Arc<JwkSet>,
    fetched_at: Instant,
    attempted_at: Instant,
}

/// Bounded, time-refreshed JWKS cache shared by all requests
pub struct JwksCache {
    entries: DashMap<String, CachedKeySet>,
    source: Arc<dyn KeySetSource>,
    clock: Arc<dyn Clock>,
    settings: JwksCacheSettings,
    refresh_lock: tokio::sync::Mutex<()>,
    counters: Counters,
}

impl JwksCache {
    /// Create an empty cache
    pub fn new(
        source: Arc<dyn KeySetSource>,
        clock: Arc<dyn Clock>,
        settings: JwksCacheSettings,
    ) -> Self {
        Self {
            entries: DashMap::new(),
            source,
            clock,
            settings,
            refresh_lock: tokio::sync::Mutex::new(()),
            counters: Counters::default(),
        }
    }

    /// Return the key set for `uri`, fetching when stale or absent.
    ///
    /// With `force_refresh` the TTL is ignored, but a fetch is only made if
    /// the last attempt is older than `min_refresh_interval`. After a failed
    /// refresh the stale entry is served without fetching for the same interval.
    pub async fn get(&self, uri: &str, force_refresh: bool) -> Result<Arc<JwkSet>, OidcError> {
        if let Some(keys) = self.usable(uri, force_refresh) {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(keys);
        }

        let _guard = self.refresh_lock.lock().await;

        // Another caller may have refreshed while we waited
        if let Some(keys) = self.usable(uri, force_refresh) {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(keys);
        }

        self.counters.refreshes.fetch_add(1, Ordering::Relaxed);
        let now = self.clock.now();
        match self.source.fetch(uri).await {
            Ok(set) => {
                let keys = Arc::new(set);
                debug!(jwks_uri = %uri, keys = keys.keys.len(), "JWKS cached");
                self.insert(uri, Arc::clone(&keys), now);
                Ok(keys)
            }
            Err(e) => {
                self.counters.fetch_errors.fetch_add(1, Ordering::Relaxed);
                let Some(mut entry) = self.entries.get_mut(uri) else {
                    return Err(e);
                };
                entry.attempted_at = now;
                self.counters.stale_served.fetch_add(1, Ordering::Relaxed);
                warn!(jwks_uri = %uri, error = %e, "JWKS refresh failed, serving cached key set");
                Ok(Arc::clone(&entry.keys))
            }
        }
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> JwksCacheStats {
        JwksCacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            refreshes: self.counters.refreshes.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            fetch_errors: self.counters.fetch_errors.load(Ordering::Relaxed),
            stale_served: self.counters.stale_served.load(Ordering::Relaxed),
        }
    }

    /// Number of cached key sets
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is cached
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn usable(&self, uri: &str, force_refresh: bool) -> Option<Arc<JwkSet>> {
        let entry = self.entries.get(uri)?;
        let now = self.clock.now();
        let recently_attempted =
            now.saturating_duration_since(entry.attempted_at) < self.settings.min_refresh_interval;
        let usable = if force_refresh {
            recently_attempted
        } else {
            // A stale entry whose refresh just failed is served until the next attempt is due
            now.saturating_duration_since(entry.fetched_at) < self.settings.ttl
                || (entry.attempted_at > entry.fetched_at && recently_attempted)
        };
        usable.then(|| Arc::clone(&entry.keys))
    }

    fn insert(&self, uri: &str, keys: Arc<JwkSet>, now: Instant) {
        if !self.entries.contains_key(uri) && self.entries.len() >= self.settings.max_entries {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|e| e.fetched_at)
                .map(|e| e.key().clone());
            if let Some(key) = oldest {
                self.entries.remove(&key);
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(jwks_uri = %key, "Evicted JWKS entry");
            }
        }

        self.entries.insert(
            uri.to_string(),
            CachedKeySet {
                keys,
                fetched_at: now,
                attempted_at: now,
            },
        );
    }
}
