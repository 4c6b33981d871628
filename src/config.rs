//! Configuration types for the proxy core.
//!
//! Two kinds of configuration exist:
//!
//! * [`ProxyConfig`]: process-wide knobs (upstream address, rate limits,
//!   TTLs, image bounds), built once through [`ProxyConfigBuilder`].
//! * [`RenderOptions`]: per-request choices made by the reader (theme and
//!   image mode). They are part of every cache key.

use crate::error::ProxyError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Placeholder in [`ProxyConfig::upstream_base`] replaced by the language code.
pub const LANG_PLACEHOLDER: &str = "{lang}";

/// Configuration for a [`crate::proxy::Proxy`].
///
/// Built via [`ProxyConfig::builder()`] or [`ProxyConfig::default()`].
///
/// # Example
/// ```rust
/// use vintagepedia::ProxyConfig;
///
/// let config = ProxyConfig::builder()
///     .page_rate_limit(2)
///     .max_image_size(240, 180)
///     .max_palette_size(16)
///     .build()
///     .unwrap();
/// assert_eq!(config.max_palette_size, 16);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Upstream base address. `{lang}` is substituted with the article language.
    /// Default: `https://{lang}.wikipedia.org`.
    pub upstream_base: String,

    /// `User-Agent` sent with every outbound request.
    pub user_agent: String,

    /// Language used when a request does not name one. Default: `en`.
    pub default_language: String,

    /// Page requests admitted per client per window. Default: 1.
    pub page_rate_limit: u32,

    /// Image requests admitted per client per window. Default: 5.
    ///
    /// A single article can reference a dozen images, so this is set well
    /// above the page limit.
    pub image_rate_limit: u32,

    /// Length of a rate-limit window in milliseconds. Default: 1000.
    pub rate_window_ms: u64,

    /// Buckets untouched for this long are purged. Default: 300 s.
    pub bucket_idle_ttl_secs: u64,

    /// Lifetime of a rendered article. Default: 600 s.
    pub article_cache_ttl_secs: u64,

    /// Lifetime of a transcoded image. Default: 86 400 s.
    ///
    /// Images change far less often than article text, and re-transcoding
    /// is the most CPU-expensive thing the proxy does.
    pub image_cache_ttl_secs: u64,

    /// Upper bound on cached payload bytes across all entries. Default: 256 MiB.
    pub cache_capacity_bytes: u64,

    /// Output image bounding box. Default: 320 × 240.
    pub max_image_width: u32,
    pub max_image_height: u32,

    /// Palette entries per output image, 2–256. Default: 256.
    pub max_palette_size: u16,

    /// Apply 4×4 ordered dithering after quantization. Default: false.
    pub dither: bool,

    /// Largest upstream image body accepted, in bytes. Default: 8 MiB.
    pub max_image_bytes: u64,

    /// Simultaneous outbound requests across all clients. Default: 8.
    pub max_outbound_concurrency: usize,

    /// Images resolved in parallel while rendering one page. Default: 4.
    pub image_concurrency: usize,

    /// Per-request upstream timeout in seconds. Default: 10.
    pub fetch_timeout_secs: u64,

    /// Delay before the single retry of a transient fetch failure. Default: 500 ms.
    pub retry_backoff_ms: u64,

    /// Budget for parsing and simplifying one article. Default: 5000 ms.
    pub simplify_timeout_ms: u64,

    /// Budget for decoding, quantizing and encoding one image. Default: 3000 ms.
    pub transcode_timeout_ms: u64,

    /// Budget for resolving one image during a page render (fetch + transcode).
    /// Default: 5000 ms.
    pub image_timeout_ms: u64,

    /// Budget for a complete article render. Default: 30 000 ms.
    pub page_timeout_ms: u64,

    /// Wait suggested to clients when the upstream is unavailable. Default: 30 s.
    pub upstream_retry_after_secs: u64,

    /// Hosts images may be fetched from. Default: `upload.wikimedia.org`.
    pub allowed_image_hosts: Vec<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            upstream_base: format!("https://{LANG_PLACEHOLDER}.wikipedia.org"),
            user_agent: concat!(
                "Vintagepedia/",
                env!("CARGO_PKG_VERSION"),
                " (minimal encyclopedia proxy for vintage browsers)"
            )
            .to_string(),
            default_language: "en".to_string(),
            page_rate_limit: 1,
            image_rate_limit: 5,
            rate_window_ms: 1000,
            bucket_idle_ttl_secs: 300,
            article_cache_ttl_secs: 600,
            image_cache_ttl_secs: 86_400,
            cache_capacity_bytes: 256 * 1024 * 1024,
            max_image_width: 320,
            max_image_height: 240,
            max_palette_size: 256,
            dither: false,
            max_image_bytes: 8 * 1024 * 1024,
            max_outbound_concurrency: 8,
            image_concurrency: 4,
            fetch_timeout_secs: 10,
            retry_backoff_ms: 500,
            simplify_timeout_ms: 5000,
            transcode_timeout_ms: 3000,
            image_timeout_ms: 5000,
            page_timeout_ms: 30_000,
            upstream_retry_after_secs: 30,
            allowed_image_hosts: vec!["upload.wikimedia.org".to_string()],
        }
    }
}

impl ProxyConfig {
    /// Create a new builder for `ProxyConfig`.
    pub fn builder() -> ProxyConfigBuilder {
        ProxyConfigBuilder {
            config: Self::default(),
        }
    }

    /// Upstream base address for `language`, without a trailing slash.
    pub fn upstream_base_for(&self, language: &str) -> String {
        self.upstream_base
            .replace(LANG_PLACEHOLDER, language)
            .trim_end_matches('/')
            .to_string()
    }

    /// Host name of the upstream for `language`, if the base parses as a URL.
    pub fn upstream_host_for(&self, language: &str) -> Option<String> {
        reqwest::Url::parse(&self.upstream_base_for(language))
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_millis(self.rate_window_ms)
    }

    pub fn bucket_idle_ttl(&self) -> Duration {
        Duration::from_secs(self.bucket_idle_ttl_secs)
    }

    pub fn article_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.article_cache_ttl_secs)
    }

    pub fn image_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.image_cache_ttl_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn simplify_timeout(&self) -> Duration {
        Duration::from_millis(self.simplify_timeout_ms)
    }

    pub fn transcode_timeout(&self) -> Duration {
        Duration::from_millis(self.transcode_timeout_ms)
    }

    pub fn image_timeout(&self) -> Duration {
        Duration::from_millis(self.image_timeout_ms)
    }

    pub fn page_timeout(&self) -> Duration {
        Duration::from_millis(self.page_timeout_ms)
    }
}

/// Builder for [`ProxyConfig`].
#[derive(Debug)]
pub struct ProxyConfigBuilder {
    config: ProxyConfig,
}

impl ProxyConfigBuilder {
    pub fn upstream_base(mut self, base: impl Into<String>) -> Self {
        self.config.upstream_base = base.into();
        self
    }

    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.config.user_agent = ua.into();
        self
    }

    pub fn default_language(mut self, lang: impl Into<String>) -> Self {
        self.config.default_language = lang.into();
        self
    }

    pub fn page_rate_limit(mut self, n: u32) -> Self {
        self.config.page_rate_limit = n.max(1);
        self
    }

    pub fn image_rate_limit(mut self, n: u32) -> Self {
        self.config.image_rate_limit = n.max(1);
        self
    }

    pub fn rate_window_ms(mut self, ms: u64) -> Self {
        self.config.rate_window_ms = ms.max(1);
        self
    }

    pub fn bucket_idle_ttl_secs(mut self, secs: u64) -> Self {
        self.config.bucket_idle_ttl_secs = secs;
        self
    }

    pub fn article_cache_ttl_secs(mut self, secs: u64) -> Self {
        self.config.article_cache_ttl_secs = secs;
        self
    }

    pub fn image_cache_ttl_secs(mut self, secs: u64) -> Self {
        self.config.image_cache_ttl_secs = secs;
        self
    }

    pub fn cache_capacity_bytes(mut self, bytes: u64) -> Self {
        self.config.cache_capacity_bytes = bytes;
        self
    }

    pub fn max_image_size(mut self, width: u32, height: u32) -> Self {
        self.config.max_image_width = width.max(1);
        self.config.max_image_height = height.max(1);
        self
    }

    pub fn max_palette_size(mut self, n: u16) -> Self {
        self.config.max_palette_size = n.clamp(2, 256);
        self
    }

    pub fn dither(mut self, v: bool) -> Self {
        self.config.dither = v;
        self
    }

    pub fn max_image_bytes(mut self, bytes: u64) -> Self {
        self.config.max_image_bytes = bytes;
        self
    }

    pub fn max_outbound_concurrency(mut self, n: usize) -> Self {
        self.config.max_outbound_concurrency = n.max(1);
        self
    }

    pub fn image_concurrency(mut self, n: usize) -> Self {
        self.config.image_concurrency = n.max(1);
        self
    }

    pub fn fetch_timeout_secs(mut self, secs: u64) -> Self {
        self.config.fetch_timeout_secs = secs;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn simplify_timeout_ms(mut self, ms: u64) -> Self {
        self.config.simplify_timeout_ms = ms;
        self
    }

    pub fn transcode_timeout_ms(mut self, ms: u64) -> Self {
        self.config.transcode_timeout_ms = ms;
        self
    }

    pub fn image_timeout_ms(mut self, ms: u64) -> Self {
        self.config.image_timeout_ms = ms;
        self
    }

    pub fn page_timeout_ms(mut self, ms: u64) -> Self {
        self.config.page_timeout_ms = ms;
        self
    }

    pub fn upstream_retry_after_secs(mut self, secs: u64) -> Self {
        self.config.upstream_retry_after_secs = secs;
        self
    }

    pub fn allowed_image_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.allowed_image_hosts = hosts.into_iter().map(Into::into).collect();
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ProxyConfig, ProxyError> {
        let c = &self.config;
        let base = c.upstream_base_for(&c.default_language);
        match reqwest::Url::parse(&base) {
            Ok(u) if matches!(u.scheme(), "http" | "https") => {}
            _ => {
                return Err(ProxyError::InvalidConfig(format!(
                    "upstream base must be an http(s) URL, got '{}'",
                    c.upstream_base
                )))
            }
        }
        if !is_language_code(&c.default_language) {
            return Err(ProxyError::InvalidConfig(format!(
                "default language '{}' is not a language code",
                c.default_language
            )));
        }
        if c.page_rate_limit == 0 || c.image_rate_limit == 0 || c.rate_window_ms == 0 {
            return Err(ProxyError::InvalidConfig(
                "rate limits and window must be ≥ 1".into(),
            ));
        }
        if !(2..=256).contains(&c.max_palette_size) {
            return Err(ProxyError::InvalidConfig(format!(
                "palette size must be 2–256, got {}",
                c.max_palette_size
            )));
        }
        if c.fetch_timeout_secs == 0 {
            return Err(ProxyError::InvalidConfig(
                "fetch timeout must be ≥ 1s".into(),
            ));
        }
        if c.max_image_bytes == 0 {
            return Err(ProxyError::InvalidConfig(
                "max image bytes must be > 0".into(),
            ));
        }
        if c.transcode_timeout_ms == 0 || c.image_timeout_ms == 0 || c.page_timeout_ms == 0 {
            return Err(ProxyError::InvalidConfig(
                "stage timeouts must be > 0".into(),
            ));
        }
        if c.image_timeout_ms > c.page_timeout_ms {
            return Err(ProxyError::InvalidConfig(format!(
                "image timeout ({}ms) exceeds page timeout ({}ms)",
                c.image_timeout_ms, c.page_timeout_ms
            )));
        }
        Ok(self.config)
    }
}

/// `en`, `de`, `simple`, `zh-yue`: lowercase ASCII letters and hyphens.
pub fn is_language_code(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 16
        && s.bytes().all(|b| b.is_ascii_lowercase() || b == b'-')
        && !s.starts_with('-')
}

// ── Render options ───────────────────────────────────────────────────────

/// Colour scheme of rendered pages (and the matte behind transparent images).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    Light,
    Dark,
}

impl Theme {
    pub fn as_str(self) -> &'static str {
        match self {
            Theme::Light => "light",
            Theme::Dark => "dark",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "light" => Some(Theme::Light),
            "dark" => Some(Theme::Dark),
            _ => None,
        }
    }

    /// Background colour, used for the page body and for flattening alpha.
    pub fn background(self) -> [u8; 3] {
        match self {
            Theme::Light => [0xFF, 0xFF, 0xFF],
            Theme::Dark => [0x00, 0x00, 0x00],
        }
    }

    /// `(bgcolor, text, link, vlink)` attributes for `<body>`.
    pub fn body_colors(self) -> (&'static str, &'static str, &'static str, &'static str) {
        match self {
            Theme::Light => ("#FFFFFF", "#000000", "#0000EE", "#551A8B"),
            Theme::Dark => ("#000000", "#E0E0E0", "#80C0FF", "#C0A0FF"),
        }
    }
}

/// Which article images are shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageMode {
    /// Every image (default).
    #[default]
    All,
    /// Only the first image, usually the lead or infobox picture.
    First,
    /// Text only.
    None,
}

impl ImageMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ImageMode::All => "all",
            ImageMode::First => "first",
            ImageMode::None => "none",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "all" => Some(ImageMode::All),
            "first" => Some(ImageMode::First),
            "none" => Some(ImageMode::None),
            _ => None,
        }
    }

    /// Whether the image at `position` (0-based, document order) is shown.
    pub fn keeps(self, position: usize) -> bool {
        match self {
            ImageMode::All => true,
            ImageMode::First => position == 0,
            ImageMode::None => false,
        }
    }
}

/// Per-request rendering choices. Immutable once constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct RenderOptions {
    pub theme: Theme,
    pub image_mode: ImageMode,
}

impl RenderOptions {
    pub fn new(theme: Theme, image_mode: ImageMode) -> Self {
        Self { theme, image_mode }
    }

    /// Parse `theme=dark&images=first`-style pairs. Unknown keys and values
    /// are ignored; missing keys keep the default.
    pub fn from_query(query: &str) -> Self {
        Self::default().with_overrides(query)
    }

    /// Apply the recognised pairs in `query` on top of `self`.
    ///
    /// Used to layer explicit query parameters over a stored preference.
    pub fn with_overrides(mut self, query: &str) -> Self {
        for pair in query.split(['&', ';']) {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            match key.trim() {
                "theme" => {
                    if let Some(t) = Theme::parse(value.trim()) {
                        self.theme = t;
                    }
                }
                "images" => {
                    if let Some(m) = ImageMode::parse(value.trim()) {
                        self.image_mode = m;
                    }
                }
                _ => {}
            }
        }
        self
    }

    /// Canonical query string; default values are omitted so the
    /// default options render as the empty string.
    pub fn to_query(&self) -> String {
        let mut parts = Vec::with_capacity(2);
        if self.theme != Theme::default() {
            parts.push(format!("theme={}", self.theme.as_str()));
        }
        if self.image_mode != ImageMode::default() {
            parts.push(format!("images={}", self.image_mode.as_str()));
        }
        parts.join("&")
    }

    /// Fully explicit form used inside cache keys.
    pub fn cache_fragment(&self) -> String {
        format!("{}/{}", self.theme.as_str(), self.image_mode.as_str())
    }
}

impl fmt::Display for RenderOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.cache_fragment())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_builds() {
        let c = ProxyConfig::builder().build().expect("defaults are valid");
        assert_eq!(c.page_rate_limit, 1);
        assert_eq!(c.image_rate_limit, 5);
        assert!(c.article_cache_ttl() < c.image_cache_ttl());
    }

    #[test]
    fn builder_clamps_palette() {
        let c = ProxyConfig::builder().max_palette_size(4096).build().unwrap();
        assert_eq!(c.max_palette_size, 256);
        let c = ProxyConfig::builder().max_palette_size(0).build().unwrap();
        assert_eq!(c.max_palette_size, 2);
    }

    #[test]
    fn rejects_non_http_upstream() {
        let err = ProxyConfig::builder()
            .upstream_base("ftp://example.org")
            .build()
            .unwrap_err();
        assert!(matches!(err, ProxyError::InvalidConfig(_)));
    }

    #[test]
    fn rejects_image_budget_beyond_page_budget() {
        let err = ProxyConfig::builder()
            .image_timeout_ms(10_000)
            .page_timeout_ms(5_000)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("exceeds page timeout"));
    }

    #[test]
    fn upstream_base_substitutes_language() {
        let c = ProxyConfig::default();
        assert_eq!(c.upstream_base_for("de"), "https://de.wikipedia.org");
        assert_eq!(
            c.upstream_host_for("fr").as_deref(),
            Some("fr.wikipedia.org")
        );
    }

    #[test]
    fn language_codes() {
        assert!(is_language_code("en"));
        assert!(is_language_code("zh-yue"));
        assert!(!is_language_code(""));
        assert!(!is_language_code("EN"));
        assert!(!is_language_code("../etc"));
    }

    #[test]
    fn options_query_round_trip_is_canonical() {
        let o = RenderOptions::from_query("images=first&theme=dark&junk=1");
        assert_eq!(o, RenderOptions::new(Theme::Dark, ImageMode::First));
        assert_eq!(o.to_query(), "theme=dark&images=first");
        assert_eq!(RenderOptions::default().to_query(), "");
    }

    #[test]
    fn overrides_layer_on_preference() {
        let pref = RenderOptions::new(Theme::Dark, ImageMode::None);
        let o = pref.with_overrides("images=all");
        assert_eq!(o, RenderOptions::new(Theme::Dark, ImageMode::All));
        assert_eq!(pref.with_overrides("theme=purple"), pref);
    }

    #[test]
    fn image_mode_keeps() {
        assert!(ImageMode::All.keeps(7));
        assert!(ImageMode::First.keeps(0));
        assert!(!ImageMode::First.keeps(1));
        assert!(!ImageMode::None.keeps(0));
    }
}
