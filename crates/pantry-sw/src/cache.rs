//! Versioned cache buckets.
//!
//! ```text
//! CacheStorage
//!     ├── pantry-v3 (Cache)  ← evicted on the next activation
//!     └── pantry-v4 (Cache)
//!             └── CacheKey → CachedEntry
//! ```
//!
//! Every write replaces the whole entry for its key, so concurrent writers of
//! the same URL race harmlessly: the last equivalent response wins.

use std::fmt;

use bytes::Bytes;
use hashbrown::HashMap;
use http::{HeaderMap, Method, StatusCode};
use pantry_common::now_millis;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, trace};
use url::Url;

use crate::request::{Request, Response, ResponseSource, ResponseType};

/// Errors raised by cache operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("Cache bucket {0} is not open")]
    NotOpen(CacheVersion),

    #[error("Only GET requests can be cached, got {0}")]
    UnsupportedMethod(String),

    #[error("Response is not cacheable (status {status}, opaque: {opaque})")]
    Uncacheable { status: u16, opaque: bool },
}

/// Tag of one deployment's asset set, e.g. `pantry-v4`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheVersion(String);

impl CacheVersion {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    /// The `<app>-v<N>` bucket name of a deployment.
    pub fn for_deployment(app: &str, deployment: u32) -> Self {
        Self(format!("{app}-v{deployment}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Normalized lookup key: method plus absolute URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    method: String,
    url: String,
}

impl CacheKey {
    pub fn for_url(url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self {
            method: Method::GET.to_string(),
            url: url.into(),
        }
    }

    pub fn for_request(request: &Request) -> Self {
        Self {
            method: request.method.to_string(),
            ..Self::for_url(&request.url)
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// The URL with its query string dropped.
    fn without_search(&self) -> &str {
        self.url.split('?').next().unwrap_or(&self.url)
    }
}

/// A stored response.
#[derive(Debug, Clone)]
pub struct CachedEntry {
    pub key: CacheKey,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Milliseconds since the epoch.
    pub cached_at: u64,
}

impl CachedEntry {
    /// Rebuild the response served to the page.
    pub fn to_response(&self) -> Response {
        Response {
            url: Url::parse(self.key.url()).ok(),
            status: self.status,
            headers: self.headers.clone(),
            body: self.body.clone(),
            response_type: ResponseType::Basic,
            source: ResponseSource::Cache,
        }
    }
}

/// One bucket.
#[derive(Debug)]
pub struct Cache {
    pub version: CacheVersion,
    entries: HashMap<CacheKey, CachedEntry>,
}

impl Cache {
    pub fn new(version: CacheVersion) -> Self {
        Self {
            version,
            entries: HashMap::new(),
        }
    }

    pub fn match_key(&self, key: &CacheKey) -> Option<&CachedEntry> {
        self.entries.get(key)
    }

    /// Match on method and path, ignoring the query string on both sides.
    /// Among several variants the most recently cached wins.
    pub fn match_ignoring_search(&self, key: &CacheKey) -> Option<&CachedEntry> {
        self.match_key(key).or_else(|| {
            self.entries
                .values()
                .filter(|entry| {
                    entry.key.method == key.method
                        && entry.key.without_search() == key.without_search()
                })
                .max_by(|a, b| {
                    a.cached_at
                        .cmp(&b.cached_at)
                        .then_with(|| a.key.url.cmp(&b.key.url))
                })
        })
    }

    /// Store a response, replacing any previous entry for the key.
    pub fn put(&mut self, key: CacheKey, response: &Response) -> Result<(), CacheError> {
        if key.method != Method::GET.as_str() {
            return Err(CacheError::UnsupportedMethod(key.method));
        }
        if !response.is_cacheable() {
            return Err(CacheError::Uncacheable {
                status: response.status.as_u16(),
                opaque: response.is_opaque(),
            });
        }
        let entry = CachedEntry {
            key: key.clone(),
            status: response.status,
            headers: response.headers.clone(),
            body: response.body.clone(),
            cached_at: now_millis(),
        };
        self.entries.insert(key, entry);
        Ok(())
    }

    pub fn delete(&mut self, key: &CacheKey) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn keys(&self) -> Vec<&CacheKey> {
        self.entries.keys().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// All buckets of the origin.
#[derive(Debug, Default)]
pub struct CacheStorage {
    buckets: RwLock<HashMap<CacheVersion, Cache>>,
}

impl CacheStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a bucket, creating it if needed. Returns `true` if it was created.
    pub async fn open(&self, version: &CacheVersion) -> bool {
        let mut buckets = self.buckets.write().await;
        if buckets.contains_key(version) {
            return false;
        }
        debug!(version = %version, "Opening cache bucket");
        buckets.insert(version.clone(), Cache::new(version.clone()));
        true
    }

    pub async fn has(&self, version: &CacheVersion) -> bool {
        self.buckets.read().await.contains_key(version)
    }

    /// Store a response for `request` in `version`.
    pub async fn put(
        &self,
        version: &CacheVersion,
        request: &Request,
        response: &Response,
    ) -> Result<(), CacheError> {
        let mut buckets = self.buckets.write().await;
        let cache = buckets
            .get_mut(version)
            .ok_or_else(|| CacheError::NotOpen(version.clone()))?;
        cache.put(CacheKey::for_request(request), response)?;
        trace!(version = %version, url = %request.url, "Cached response");
        Ok(())
    }

    /// Store several responses under one lock. Entries that cannot be cached
    /// are skipped and reported back with their error.
    pub async fn put_all(
        &self,
        version: &CacheVersion,
        entries: Vec<(Url, Response)>,
    ) -> Result<Vec<(Url, CacheError)>, CacheError> {
        let mut buckets = self.buckets.write().await;
        let cache = buckets
            .get_mut(version)
            .ok_or_else(|| CacheError::NotOpen(version.clone()))?;
        let mut rejected = Vec::new();
        for (url, response) in entries {
            if let Err(e) = cache.put(CacheKey::for_url(&url), &response) {
                rejected.push((url, e));
            }
        }
        Ok(rejected)
    }

    /// Look `request` up in `version` only.
    pub async fn match_request(&self, version: &CacheVersion, request: &Request) -> Option<Response> {
        let buckets = self.buckets.read().await;
        buckets
            .get(version)?
            .match_key(&CacheKey::for_request(request))
            .map(CachedEntry::to_response)
    }

    /// Like [`match_request`](Self::match_request), but falls back to an entry
    /// with the same path and a different query string.
    pub async fn match_ignoring_search(
        &self,
        version: &CacheVersion,
        request: &Request,
    ) -> Option<Response> {
        let buckets = self.buckets.read().await;
        buckets
            .get(version)?
            .match_ignoring_search(&CacheKey::for_request(request))
            .map(CachedEntry::to_response)
    }

    /// Every bucket tag, sorted.
    pub async fn list_versions(&self) -> Vec<CacheVersion> {
        let mut versions: Vec<_> = self.buckets.read().await.keys().cloned().collect();
        versions.sort();
        versions
    }

    /// Drop a bucket and every entry in it.
    pub async fn delete(&self, version: &CacheVersion) -> bool {
        self.buckets.write().await.remove(version).is_some()
    }

    /// URLs stored in `version`.
    pub async fn keys(&self, version: &CacheVersion) -> Vec<String> {
        let buckets = self.buckets.read().await;
        let mut urls: Vec<_> = buckets
            .get(version)
            .map(|cache| cache.keys().into_iter().map(|k| k.url().to_string()).collect())
            .unwrap_or_default();
        urls.sort();
        urls
    }

    /// Whether any bucket holds an entry for `url`.
    pub async fn contains_anywhere(&self, url: &Url) -> bool {
        let key = CacheKey::for_url(url);
        self.buckets
            .read()
            .await
            .values()
            .any(|cache| cache.match_key(&key).is_some())
    }
}
