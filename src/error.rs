//! Error types for the vintagepedia library.
//!
//! Two tiers of error reflect two failure scopes:
//!
//! * [`ProxyError`]: **Fatal** for one request: the requested artifact
//!   cannot be produced at all (article missing, upstream down, client over
//!   its rate limit). Returned as `Err(ProxyError)` from
//!   [`crate::proxy::Proxy`] and mapped to a [`ResponseStatus`] by the
//!   front end.
//!
//! * [`TranscodeError`]: **Non-fatal**: one image could not be decoded or
//!   encoded. It never leaves the transcoder; the image is replaced by the
//!   placeholder and the page render carries on.
//!
//! The fetch stage has its own enums ([`FetchError`], [`ImageFetchError`])
//! because callers treat their variants differently (an article 404 is
//! final, an image 404 only degrades one picture).

use crate::limiter::RequestClass;
use thiserror::Error;

/// All request-fatal errors returned by the proxy core.
///
/// `Clone` because single-flight waiters share one failure result.
#[derive(Debug, Clone, Error)]
pub enum ProxyError {
    // ── Lookup errors ─────────────────────────────────────────────────────
    /// The upstream source has no article with this title.
    #[error("Article '{title}' was not found")]
    ArticleNotFound { title: String },

    /// The image key is unknown, undecodable, or points at a host we do not proxy.
    #[error("Image not found: {detail}")]
    ImageNotFound { detail: String },

    /// The request itself is malformed (empty title, bad language code).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // ── Upstream errors ───────────────────────────────────────────────────
    /// Network failure, timeout or 5xx from the content source.
    #[error("Upstream source unavailable: {detail} (retry in {retry_after_secs}s)")]
    UpstreamUnavailable {
        detail: String,
        retry_after_secs: u64,
    },

    // ── Admission errors ──────────────────────────────────────────────────
    /// Client exceeded its request budget for the current window.
    #[error("Rate limit exceeded for {class} requests (retry in {retry_after_ms}ms)")]
    RateLimitExceeded {
        class: RequestClass,
        retry_after_ms: u64,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// Status class the front end should answer with.
    pub fn status(&self) -> ResponseStatus {
        match self {
            ProxyError::ArticleNotFound { .. }
            | ProxyError::ImageNotFound { .. }
            | ProxyError::InvalidRequest(_) => ResponseStatus::NotFound,
            ProxyError::UpstreamUnavailable { .. } => ResponseStatus::UpstreamUnavailable,
            ProxyError::RateLimitExceeded { .. } => ResponseStatus::RateLimited,
            ProxyError::InvalidConfig(_) | ProxyError::Internal(_) => {
                ResponseStatus::InternalError
            }
        }
    }

    /// Suggested client wait in whole seconds, when retrying makes sense.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            ProxyError::UpstreamUnavailable {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
            ProxyError::RateLimitExceeded { retry_after_ms, .. } => {
                Some(retry_after_ms.div_ceil(1000).max(1))
            }
            _ => None,
        }
    }
}

/// Outcome classes of the inbound interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Success,
    NotFound,
    RateLimited,
    UpstreamUnavailable,
    InternalError,
}

impl ResponseStatus {
    /// HTTP status code for this outcome.
    pub fn http_code(self) -> u16 {
        match self {
            ResponseStatus::Success => 200,
            ResponseStatus::NotFound => 404,
            ResponseStatus::RateLimited => 429,
            ResponseStatus::UpstreamUnavailable => 503,
            ResponseStatus::InternalError => 500,
        }
    }
}

// ── Fetch-stage errors ───────────────────────────────────────────────────

/// Failure retrieving article markup.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("article not found upstream")]
    NotFound,

    #[error("upstream error: {0}")]
    UpstreamError(String),

    #[error("upstream timed out after {secs}s")]
    Timeout { secs: u64 },
}

impl FetchError {
    /// Worth one more attempt?
    pub fn is_transient(&self) -> bool {
        !matches!(self, FetchError::NotFound)
    }
}

/// Failure retrieving raw image bytes.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ImageFetchError {
    #[error("image not found upstream")]
    NotFound,

    #[error("image exceeds {limit} bytes")]
    TooLarge { limit: u64 },

    #[error("unsupported content type '{content_type}'")]
    UnsupportedFormat { content_type: String },

    #[error("image download timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("image source unavailable: {0}")]
    Unavailable(String),
}

// ── Non-fatal errors ─────────────────────────────────────────────────────

/// A single image failed somewhere between decode and encode.
///
/// Always recovered locally as the placeholder image.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TranscodeError {
    #[error("unsupported image format")]
    UnsupportedFormat,

    #[error("decode failed ({format}): {detail}")]
    Decode { format: &'static str, detail: String },

    #[error("image dimensions {width}x{height} are unusable")]
    BadDimensions { width: u32, height: u32 },

    #[error("encode failed: {0}")]
    Encode(String),

    #[error("transcode exceeded {ms}ms")]
    Timeout { ms: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_display_and_status() {
        let e = ProxyError::RateLimitExceeded {
            class: RequestClass::Page,
            retry_after_ms: 400,
        };
        assert!(e.to_string().contains("page"), "got: {e}");
        assert_eq!(e.status(), ResponseStatus::RateLimited);
        assert_eq!(e.status().http_code(), 429);
        assert_eq!(e.retry_after_secs(), Some(1));
    }

    #[test]
    fn upstream_unavailable_is_retryable() {
        let e = ProxyError::UpstreamUnavailable {
            detail: "HTTP 502".into(),
            retry_after_secs: 30,
        };
        assert_eq!(e.status(), ResponseStatus::UpstreamUnavailable);
        assert_eq!(e.retry_after_secs(), Some(30));
        assert!(e.to_string().contains("HTTP 502"));
    }

    #[test]
    fn not_found_has_no_retry_hint() {
        let e = ProxyError::ArticleNotFound {
            title: "Nope".into(),
        };
        assert_eq!(e.status().http_code(), 404);
        assert_eq!(e.retry_after_secs(), None);
    }

    #[test]
    fn internal_maps_to_500() {
        assert_eq!(
            ProxyError::Internal("boom".into()).status().http_code(),
            500
        );
    }

    #[test]
    fn fetch_error_transience() {
        assert!(!FetchError::NotFound.is_transient());
        assert!(FetchError::Timeout { secs: 10 }.is_transient());
        assert!(FetchError::UpstreamError("HTTP 503".into()).is_transient());
    }
}
