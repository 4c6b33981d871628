//! # vintagepedia
//!
//! Serve encyclopedia articles to browsers from the 1990s.
//!
//! ## Why this crate?
//!
//! Modern encyclopedia pages assume CSS layout, JavaScript, TLS 1.3, UTF-8
//! everywhere and multi-megabyte images. A Netscape 3 or Mosaic browser on
//! a period machine gets none of that right. This crate sits between the
//! two: it fetches an article, reduces its markup to a small HTML 3.2
//! subset, converts every image to a small indexed GIF, and serves the
//! result behind a per-client rate limit and a single-flight cache so a
//! room full of old machines never hammers the upstream source.
//!
//! ## Pipeline Overview
//!
//! ```text
//! request
//!  │
//!  ├─ 1. Admit     fixed-window rate limit per client and class
//!  ├─ 2. Cache     single-flight lookup keyed by title + options
//!  ├─ 3. Fetch     article markup from the upstream source
//!  ├─ 4. Simplify  tolerant parse → closed node tree (spawn_blocking)
//!  ├─ 5. Images    fetch → decode → resize → median cut → GIF (concurrent)
//!  └─ 6. Emit      legacy HTML page, cached for the article TTL
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use vintagepedia::{ArticleRequest, Proxy, ProxyConfig, RenderOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let proxy = Proxy::new(ProxyConfig::default())?;
//!     let page = proxy
//!         .render_article(&ArticleRequest::new("Lynx (web browser)", "en", RenderOptions::default()))
//!         .await?;
//!     println!("{}", String::from_utf8_lossy(&page.bytes));
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `vintagepedia` binary (clap + anyhow + tracing-subscriber + axum + serde_json) |
//!
//! Disable `cli` when embedding the proxy core in another server:
//! ```toml
//! vintagepedia = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod cache;
pub mod config;
pub mod document;
pub mod error;
pub mod legacy;
pub mod limiter;
pub mod pipeline;
pub mod proxy;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use cache::{CacheEntry, ImageMeta, RenderCache};
pub use config::{ImageMode, ProxyConfig, ProxyConfigBuilder, RenderOptions, Theme};
pub use document::{Block, ImageRef, Inline, RawArticle, SimplifiedDocument};
pub use error::{FetchError, ImageFetchError, ProxyError, ResponseStatus, TranscodeError};
pub use limiter::{RateLimitBucket, RateLimiter, RequestClass};
pub use pipeline::fetch::{HttpFetcher, Upstream};
pub use pipeline::transcode::{TranscodedImage, TransformParams};
pub use proxy::{ArticleRequest, Proxy, Rendered};
