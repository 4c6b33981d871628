//! Render and image cache with single-flight computation.
//!
//! One [`moka::future::Cache`] holds every artifact the proxy produces:
//!
//! | Key | Payload |
//! |-----|---------|
//! | `article:<lang>:<title>:<theme>/<images>` | rendered HTML page |
//! | `image:<url>:<transform params>` | GIF for one upstream image URL |
//! | `artifact:<sha256>:<transform params>` | GIF for one set of source bytes |
//!
//! The `artifact:` level means two URLs serving identical bytes are only
//! transcoded once.
//!
//! ## Single flight
//!
//! [`RenderCache::get_or_compute`] goes through moka's `try_get_with`, which
//! coalesces concurrent initialisations of the same key: one caller runs the
//! computation, the rest wait and receive the same `Arc`. Failed
//! computations are not stored. The computation runs on its own Tokio task,
//! so a requester that disconnects (dropping its future) does not cancel
//! work other waiters depend on, and the finished result still lands in the
//! cache.
//!
//! ## Eviction
//!
//! Each entry carries its own TTL (articles expire sooner than images),
//! read by an [`Expiry`] policy. Capacity is bounded in bytes through a
//! weigher over the payload size.

use crate::config::RenderOptions;
use crate::error::ProxyError;
use crate::pipeline::transcode::TransformParams;
use bytes::Bytes;
use moka::future::Cache;
use moka::Expiry;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, trace};

pub const CONTENT_TYPE_HTML: &str = "text/html; charset=utf-8";
pub const CONTENT_TYPE_GIF: &str = "image/gif";

/// Image facts kept next to a cached GIF.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageMeta {
    pub width: u32,
    pub height: u32,
    pub palette_size: u16,
    /// SHA-256 of the source bytes; empty for placeholders.
    pub content_hash: String,
    /// True when the payload is the placeholder rather than a transcode.
    pub placeholder: bool,
}

/// One cached artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: String,
    pub payload: Bytes,
    pub content_type: &'static str,
    pub created_at: SystemTime,
    pub ttl: Duration,
    pub image: Option<ImageMeta>,
}

impl CacheEntry {
    pub fn page(key: String, html: String, ttl: Duration) -> Self {
        Self {
            key,
            payload: Bytes::from(html),
            content_type: CONTENT_TYPE_HTML,
            created_at: SystemTime::now(),
            ttl,
            image: None,
        }
    }

    pub fn image(key: String, gif: Bytes, meta: ImageMeta, ttl: Duration) -> Self {
        Self {
            key,
            payload: gif,
            content_type: CONTENT_TYPE_GIF,
            created_at: SystemTime::now(),
            ttl,
            image: Some(meta),
        }
    }

    /// Same payload under another key.
    pub fn rekeyed(&self, key: String) -> Self {
        Self {
            key,
            ..self.clone()
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.image.as_ref().is_some_and(|m| m.placeholder)
    }
}

// ── Keys ────────────────────────────────────────────────────────────────

pub fn article_key(language: &str, title: &str, options: RenderOptions) -> String {
    format!("article:{language}:{title}:{}", options.cache_fragment())
}

pub fn image_key(url: &str, params: &TransformParams) -> String {
    format!("image:{url}:{params}")
}

pub fn artifact_key(content_hash: &str, params: &TransformParams) -> String {
    format!("artifact:{content_hash}:{params}")
}

// ── Cache ───────────────────────────────────────────────────────────────

struct EntryExpiry;

impl Expiry<String, Arc<CacheEntry>> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Arc<CacheEntry>,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Shared artifact cache. Cheap to clone.
#[derive(Clone)]
pub struct RenderCache {
    inner: Cache<String, Arc<CacheEntry>>,
}

impl RenderCache {
    pub fn new(capacity_bytes: u64) -> Self {
        let inner = Cache::builder()
            .max_capacity(capacity_bytes)
            .weigher(|key: &String, entry: &Arc<CacheEntry>| -> u32 {
                (key.len() + entry.payload.len())
                    .try_into()
                    .unwrap_or(u32::MAX)
            })
            .expire_after(EntryExpiry)
            .build();
        Self { inner }
    }

    pub async fn get(&self, key: &str) -> Option<Arc<CacheEntry>> {
        self.inner.get(key).await
    }

    pub async fn insert(&self, entry: CacheEntry) -> Arc<CacheEntry> {
        let entry = Arc::new(entry);
        self.inner.insert(entry.key.clone(), Arc::clone(&entry)).await;
        entry
    }

    /// Return the entry for `key`, computing it at most once across all
    /// concurrent callers.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: String,
        compute: F,
    ) -> Result<Arc<CacheEntry>, ProxyError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<CacheEntry, ProxyError>> + Send + 'static,
    {
        if let Some(hit) = self.inner.get(&key).await {
            trace!("cache hit: {}", key);
            return Ok(hit);
        }

        let cache = self.inner.clone();
        let task = tokio::spawn(async move {
            let k = key.clone();
            cache
                .try_get_with(key, async move {
                    debug!("cache miss, computing: {}", k);
                    compute().await.map(Arc::new)
                })
                .await
        });

        match task.await {
            Ok(Ok(entry)) => Ok(entry),
            Ok(Err(shared)) => Err((*shared).clone()),
            Err(e) => Err(ProxyError::Internal(format!("cache computation failed: {e}"))),
        }
    }

    /// Drop every entry.
    pub fn invalidate_all(&self) {
        self.inner.invalidate_all();
    }

    /// Approximate number of live entries.
    pub fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }

    /// Approximate total weight (bytes) of live entries.
    pub fn weighted_size(&self) -> u64 {
        self.inner.weighted_size()
    }

    /// Apply pending evictions and expirations now.
    pub async fn run_pending_tasks(&self) {
        self.inner.run_pending_tasks().await;
    }
}
