//! Request coordination: rate limiting, caching and the render pipelines.
//!
//! [`Proxy`] is the entry point the front end talks to. It owns the shared
//! pieces (limiter, cache, upstream, decoder registry) and exposes three
//! operations:
//!
//! * [`Proxy::admit`]: rate-limit check for a client and request class.
//! * [`Proxy::render_article`]: fetch → simplify → resolve images → emit,
//!   behind the article cache.
//! * [`Proxy::render_image`]: fetch → transcode, behind the image cache.
//!
//! ## Page budget
//!
//! A page render has one deadline (`page_timeout`), fixed when the request
//! arrives and shared by the caller's wait and the render itself. Images are
//! resolved concurrently (`image_concurrency` at a time) and each gets at
//! most `image_timeout`, further capped by the image deadline: the page
//! deadline minus a reserve for emitting the page. An image that misses its
//! budget is shown as the placeholder; its transcode keeps running in the
//! background and will be cached for later requests. Images on hosts outside
//! `allowed_image_hosts` become placeholders without being fetched.

use crate::cache::{self, CacheEntry, ImageMeta, RenderCache, CONTENT_TYPE_GIF};
use crate::config::{is_language_code, ProxyConfig, RenderOptions, Theme};
use crate::document::SimplifiedDocument;
use crate::error::{FetchError, ImageFetchError, ProxyError, TranscodeError};
use crate::limiter::{RateLimiter, RequestClass};
use crate::pipeline::decode::DecoderRegistry;
use crate::pipeline::emit::{self, ImageResolution, PageContext};
use crate::pipeline::fetch::{HttpFetcher, Upstream};
use crate::pipeline::simplify::{simplify_async, SimplifyParams};
use crate::pipeline::transcode::{
    content_hash, placeholder_gif, transcode_async, TransformParams, PLACEHOLDER_HEIGHT,
    PLACEHOLDER_WIDTH,
};
use crate::legacy;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

/// Image key that always resolves to the placeholder GIF.
pub const PLACEHOLDER_KEY: &str = "placeholder";

/// How often idle rate-limit buckets are swept.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// Upper bound on the share of the page budget kept back for emitting.
const MAX_EMIT_RESERVE: Duration = Duration::from_millis(500);

/// Longest title accepted, in bytes.
const MAX_TITLE_BYTES: usize = 255;

/// A request for one article.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArticleRequest {
    pub title: String,
    pub language: String,
    pub options: RenderOptions,
}

impl ArticleRequest {
    pub fn new(title: impl Into<String>, language: impl Into<String>, options: RenderOptions) -> Self {
        Self {
            title: title.into(),
            language: language.into(),
            options,
        }
    }
}

/// A response body ready to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub bytes: Bytes,
    pub content_type: &'static str,
}

impl Rendered {
    fn from_entry(entry: &CacheEntry) -> Self {
        Self {
            bytes: entry.payload.clone(),
            content_type: entry.content_type,
        }
    }

    fn placeholder() -> Self {
        Self {
            bytes: placeholder_gif(),
            content_type: CONTENT_TYPE_GIF,
        }
    }
}

/// Canonical title form: trimmed, spaces as underscores, runs of
/// underscores collapsed, first letter upper-case.
pub fn normalize_title(raw: &str) -> Result<String, ProxyError> {
    let joined = raw
        .split(|c: char| c.is_whitespace() || c == '_')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("_");
    if joined.is_empty() {
        return Err(ProxyError::InvalidRequest("empty title".into()));
    }
    if joined.len() > MAX_TITLE_BYTES {
        return Err(ProxyError::InvalidRequest("title too long".into()));
    }
    if let Some(bad) = joined.chars().find(|c| "<>[]{}|#".contains(*c) || c.is_control()) {
        return Err(ProxyError::InvalidRequest(format!(
            "title contains invalid character '{}'",
            bad.escape_default()
        )));
    }
    let mut chars = joined.chars();
    Ok(match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => joined,
    })
}

/// URL-safe key under which an upstream image URL is served.
pub fn encode_image_key(url: &str) -> String {
    URL_SAFE_NO_PAD.encode(url.as_bytes())
}

/// Inverse of [`encode_image_key`].
pub fn decode_image_key(key: &str) -> Option<String> {
    let raw = URL_SAFE_NO_PAD.decode(key.as_bytes()).ok()?;
    String::from_utf8(raw).ok()
}

struct Inner {
    config: ProxyConfig,
    upstream: Arc<dyn Upstream>,
    cache: RenderCache,
    limiter: Arc<RateLimiter>,
    decoders: Arc<DecoderRegistry>,
}

/// The proxy core. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Proxy {
    inner: Arc<Inner>,
}

impl Proxy {
    /// Build a proxy that talks to the configured upstream over HTTP.
    pub fn new(config: ProxyConfig) -> Result<Self, ProxyError> {
        let upstream = Arc::new(HttpFetcher::new(&config)?);
        Ok(Self::with_upstream(config, upstream))
    }

    /// Build a proxy over any [`Upstream`].
    pub fn with_upstream(config: ProxyConfig, upstream: Arc<dyn Upstream>) -> Self {
        Self {
            inner: Arc::new(Inner {
                cache: RenderCache::new(config.cache_capacity_bytes),
                limiter: Arc::new(RateLimiter::from_config(&config)),
                decoders: Arc::new(DecoderRegistry::standard()),
                upstream,
                config,
            }),
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.inner.config
    }

    pub fn cache(&self) -> &RenderCache {
        &self.inner.cache
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.inner.limiter
    }

    /// Rate-limit check for one request.
    pub fn admit(&self, client: IpAddr, class: RequestClass) -> Result<(), ProxyError> {
        self.inner.limiter.check(client, class)
    }

    /// Start periodic housekeeping (idle bucket purge).
    pub fn spawn_maintenance(&self) -> JoinHandle<()> {
        Arc::clone(&self.inner.limiter).spawn_purger(MAINTENANCE_INTERVAL)
    }

    fn language_for(&self, requested: &str) -> Result<String, ProxyError> {
        let lang = requested.trim();
        if lang.is_empty() {
            return Ok(self.inner.config.default_language.clone());
        }
        let lang = lang.to_ascii_lowercase();
        if !is_language_code(&lang) {
            return Err(ProxyError::InvalidRequest(format!(
                "'{requested}' is not a language code"
            )));
        }
        Ok(lang)
    }

    fn upstream_unavailable(&self, detail: impl Into<String>) -> ProxyError {
        ProxyError::UpstreamUnavailable {
            detail: detail.into(),
            retry_after_secs: self.inner.config.upstream_retry_after_secs,
        }
    }

    // ── Articles ────────────────────────────────────────────────────────

    /// Render an article page, from cache when possible.
    pub async fn render_article(&self, request: &ArticleRequest) -> Result<Rendered, ProxyError> {
        let title = normalize_title(&request.title)?;
        let language = self.language_for(&request.language)?;
        let options = request.options;
        let key = cache::article_key(&language, &title, options);
        let budget = self.inner.config.page_timeout();
        let deadline = Instant::now() + budget;

        info!("Article request: {} [{}] ({})", title, language, options);
        let proxy = self.clone();
        let compute_key = key.clone();
        let lookup = self.inner.cache.get_or_compute(key, move || async move {
            proxy
                .build_article(compute_key, title, language, options, deadline)
                .await
        });

        let entry = timeout_at(deadline, lookup)
            .await
            .map_err(|_| self.upstream_unavailable(format!("render exceeded {}ms", budget.as_millis())))??;
        Ok(Rendered::from_entry(&entry))
    }

    /// Fetch and simplify without caching or image resolution.
    pub async fn simplify_article(
        &self,
        request: &ArticleRequest,
    ) -> Result<SimplifiedDocument, ProxyError> {
        let title = normalize_title(&request.title)?;
        let language = self.language_for(&request.language)?;
        self.fetch_and_simplify(&title, &language, request.options)
            .await
    }

    async fn fetch_and_simplify(
        &self,
        title: &str,
        language: &str,
        options: RenderOptions,
    ) -> Result<SimplifiedDocument, ProxyError> {
        let raw = self
            .inner
            .upstream
            .fetch_article(title, language)
            .await
            .map_err(|e| match e {
                FetchError::NotFound => ProxyError::ArticleNotFound {
                    title: title.replace('_', " "),
                },
                other => self.upstream_unavailable(other.to_string()),
            })?;

        let params = SimplifyParams::new(&self.inner.config, language, options);
        simplify_async(
            raw.raw_markup,
            raw.title,
            params,
            self.inner.config.simplify_timeout(),
        )
        .await
    }

    async fn build_article(
        &self,
        key: String,
        title: String,
        language: String,
        options: RenderOptions,
        page_deadline: Instant,
    ) -> Result<CacheEntry, ProxyError> {
        let started = Instant::now();
        let images_due = image_deadline(page_deadline, self.inner.config.page_timeout());

        let doc = self.fetch_and_simplify(&title, &language, options).await?;
        let images = self.resolve_images(&doc, options.theme, images_due).await;

        let link_language =
            (language != self.inner.config.default_language).then_some(language.as_str());
        let html = emit::render_page(
            &doc,
            &images,
            &PageContext {
                title_path: &title,
                language: link_language,
                options,
            },
        );
        debug_assert!(
            legacy::validate(&html).is_ok(),
            "emitter produced non-legacy markup: {:?}",
            legacy::validate(&html)
        );

        info!(
            "Rendered '{}' ({} blocks, {} images, {} bytes) in {:?}",
            title,
            doc.blocks.len(),
            images.len(),
            html.len(),
            started.elapsed()
        );
        Ok(CacheEntry::page(
            key,
            html,
            self.inner.config.article_cache_ttl(),
        ))
    }

    /// Resolve every image of `doc` concurrently, each within its budget.
    async fn resolve_images(
        &self,
        doc: &SimplifiedDocument,
        theme: Theme,
        images_due: Instant,
    ) -> BTreeMap<usize, ImageResolution> {
        let refs: Vec<(usize, String)> = doc
            .image_refs()
            .into_iter()
            .map(|r| (r.position, r.original_url.clone()))
            .collect();
        if refs.is_empty() {
            return BTreeMap::new();
        }

        let per_image = self.inner.config.image_timeout();
        let concurrency = self.inner.config.image_concurrency;

        stream::iter(refs)
            .map(|(position, url)| async move {
                if let Err(e) = self.check_image_host(&url) {
                    debug!("Image {} skipped: {}", url, e);
                    return (position, ImageResolution::Placeholder);
                }
                let deadline = std::cmp::min(Instant::now() + per_image, images_due);
                let resolution = match timeout_at(deadline, self.resolve_image(url.clone(), theme)).await {
                    Ok(Ok(entry)) if !entry.is_placeholder() => {
                        let (width, height) = entry
                            .image
                            .as_ref()
                            .map(|m| (m.width, m.height))
                            .unwrap_or((PLACEHOLDER_WIDTH, PLACEHOLDER_HEIGHT));
                        ImageResolution::Ready {
                            key: encode_image_key(&url),
                            width,
                            height,
                        }
                    }
                    Ok(Ok(_)) => ImageResolution::Placeholder,
                    Ok(Err(e)) => {
                        warn!("Image {} unavailable: {}", url, e);
                        ImageResolution::Placeholder
                    }
                    Err(_) => {
                        warn!("Image {} missed its time budget", url);
                        ImageResolution::Placeholder
                    }
                };
                (position, resolution)
            })
            .buffer_unordered(concurrency)
            .collect()
            .await
    }

    // ── Images ──────────────────────────────────────────────────────────

    /// Serve the GIF for an image key.
    pub async fn render_image(
        &self,
        key: &str,
        options: RenderOptions,
    ) -> Result<Rendered, ProxyError> {
        if key == PLACEHOLDER_KEY {
            return Ok(Rendered::placeholder());
        }
        let url = decode_image_key(key).ok_or_else(|| ProxyError::ImageNotFound {
            detail: "malformed image key".into(),
        })?;
        self.check_image_host(&url)?;

        match self.resolve_image(url, options.theme).await {
            Ok(entry) => Ok(Rendered::from_entry(&entry)),
            Err(e @ (ProxyError::ImageNotFound { .. } | ProxyError::UpstreamUnavailable { .. })) => {
                Err(e)
            }
            Err(e) => {
                warn!("Image key {} failed, serving placeholder: {}", key, e);
                Ok(Rendered::placeholder())
            }
        }
    }

    fn check_image_host(&self, url: &str) -> Result<(), ProxyError> {
        let parsed = reqwest::Url::parse(url).map_err(|_| ProxyError::ImageNotFound {
            detail: "image key does not hold a URL".into(),
        })?;
        let allowed = matches!(parsed.scheme(), "http" | "https")
            && parsed.host_str().is_some_and(|h| {
                self.inner
                    .config
                    .allowed_image_hosts
                    .iter()
                    .any(|a| a.eq_ignore_ascii_case(h))
            });
        if allowed {
            Ok(())
        } else {
            Err(ProxyError::ImageNotFound {
                detail: format!("host of '{url}' is not proxied"),
            })
        }
    }

    /// Cached transcode of the image at `url` for `theme`.
    async fn resolve_image(&self, url: String, theme: Theme) -> Result<Arc<CacheEntry>, ProxyError> {
        let params = TransformParams::from_config(&self.inner.config, theme);
        let key = cache::image_key(&url, &params);
        let proxy = self.clone();
        let compute_key = key.clone();
        self.inner
            .cache
            .get_or_compute(key, move || async move {
                proxy.transcode_url(compute_key, url, params).await
            })
            .await
    }

    async fn transcode_url(
        &self,
        key: String,
        url: String,
        params: TransformParams,
    ) -> Result<CacheEntry, ProxyError> {
        let config = &self.inner.config;
        let bytes = match self.inner.upstream.fetch_image(&url).await {
            Ok(bytes) => bytes,
            Err(ImageFetchError::NotFound) => {
                return Err(ProxyError::ImageNotFound {
                    detail: format!("'{url}' not found upstream"),
                })
            }
            Err(e @ (ImageFetchError::Timeout { .. } | ImageFetchError::Unavailable(_))) => {
                return Err(self.upstream_unavailable(e.to_string()))
            }
            Err(e @ (ImageFetchError::TooLarge { .. } | ImageFetchError::UnsupportedFormat { .. })) => {
                warn!("Image {} rejected: {}", url, e);
                return Ok(placeholder_entry(key, config.image_cache_ttl()));
            }
        };

        let hash = content_hash(&bytes);
        let artifact_key = cache::artifact_key(&hash, &params);
        let decoders = Arc::clone(&self.inner.decoders);
        let budget = config.transcode_timeout();
        let image_ttl = config.image_cache_ttl();
        let short_ttl = config.article_cache_ttl();
        let source_url = url.clone();
        let compute_key = artifact_key.clone();

        let artifact = self
            .inner
            .cache
            .get_or_compute(artifact_key, move || async move {
                match transcode_async(bytes, source_url.clone(), params, decoders, budget).await {
                    Ok(t) => Ok(CacheEntry::image(
                        compute_key,
                        t.encoded,
                        ImageMeta {
                            width: t.width,
                            height: t.height,
                            palette_size: t.palette_size,
                            content_hash: t.content_hash,
                            placeholder: false,
                        },
                        image_ttl,
                    )),
                    Err(e @ TranscodeError::Timeout { .. }) => {
                        // Possibly load-related; retry sooner than a decode failure.
                        warn!("Transcode of {} timed out: {}", source_url, e);
                        Ok(placeholder_entry(compute_key, short_ttl))
                    }
                    Err(e) => {
                        warn!("Transcode of {} failed: {}", source_url, e);
                        Ok(placeholder_entry(compute_key, image_ttl))
                    }
                }
            })
            .await?;

        debug!("Image {} → {}", url, artifact.key);
        Ok(artifact.rekeyed(key))
    }
}

/// Deadline for image resolution: the page deadline minus time kept back
/// for emitting, at most a fifth of the page budget.
fn image_deadline(page_deadline: Instant, page_budget: Duration) -> Instant {
    let reserve = (page_budget / 5).min(MAX_EMIT_RESERVE);
    page_deadline.checked_sub(reserve).unwrap_or(page_deadline)
}

fn placeholder_entry(key: String, ttl: Duration) -> CacheEntry {
    CacheEntry::image(
        key,
        placeholder_gif(),
        ImageMeta {
            width: PLACEHOLDER_WIDTH,
            height: PLACEHOLDER_HEIGHT,
            palette_size: 2,
            content_hash: String::new(),
            placeholder: true,
        },
        ttl,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn titles_are_normalised() {
        assert_eq!(normalize_title("  lynx  (web browser) ").unwrap(), "Lynx_(web_browser)");
        assert_eq!(normalize_title("Lynx__(web_browser)").unwrap(), "Lynx_(web_browser)");
        assert_eq!(normalize_title("éclair").unwrap(), "Éclair");
        assert_eq!(normalize_title("iPod").unwrap(), "IPod");
    }

    #[test]
    fn bad_titles_are_rejected() {
        assert!(matches!(normalize_title("   "), Err(ProxyError::InvalidRequest(_))));
        assert!(matches!(normalize_title("a|b"), Err(ProxyError::InvalidRequest(_))));
        assert!(matches!(normalize_title("a#b"), Err(ProxyError::InvalidRequest(_))));
        assert!(normalize_title(&"x".repeat(300)).is_err());
    }

    #[test]
    fn image_keys_round_trip_and_reject_garbage() {
        let url = "https://upload.wikimedia.org/wikipedia/commons/a/a9/Example.jpg?x=1&y=2";
        let key = encode_image_key(url);
        assert!(key.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_eq!(decode_image_key(&key).as_deref(), Some(url));
        assert_eq!(decode_image_key("!!!"), None);
    }

    #[test]
    fn image_deadline_keeps_an_emit_reserve() {
        let now = Instant::now();
        let page = now + Duration::from_millis(500);
        assert_eq!(image_deadline(page, Duration::from_millis(500)), now + Duration::from_millis(400));

        let page = now + Duration::from_secs(30);
        assert_eq!(image_deadline(page, Duration::from_secs(30)), page - MAX_EMIT_RESERVE);
    }
}
