//! Upstream retrieval: article markup and raw image bytes.
//!
//! All outbound traffic goes through [`HttpFetcher`], which owns one pooled
//! `reqwest::Client` and a global [`Semaphore`] bounding the number of
//! simultaneous upstream requests, whatever the number of clients.
//!
//! The [`Upstream`] trait is the seam the rest of the crate depends on.
//! Tests substitute an in-memory implementation.

use crate::config::ProxyConfig;
use crate::document::RawArticle;
use crate::error::{FetchError, ImageFetchError, ProxyError};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use reqwest::{StatusCode, Url};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Source of article markup and image bytes.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Retrieve the full markup of `title` in `language`.
    async fn fetch_article(&self, title: &str, language: &str) -> Result<RawArticle, FetchError>;

    /// Retrieve the raw bytes at `url`.
    async fn fetch_image(&self, url: &str) -> Result<Bytes, ImageFetchError>;
}

/// HTTP implementation of [`Upstream`].
pub struct HttpFetcher {
    client: reqwest::Client,
    permits: Arc<Semaphore>,
    upstream_base: String,
    timeout_secs: u64,
    retry_backoff: Duration,
    max_image_bytes: u64,
}

impl HttpFetcher {
    pub fn new(config: &ProxyConfig) -> Result<Self, ProxyError> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.fetch_timeout())
            .build()
            .map_err(|e| ProxyError::InvalidConfig(format!("HTTP client: {e}")))?;

        Ok(Self {
            client,
            permits: Arc::new(Semaphore::new(config.max_outbound_concurrency)),
            upstream_base: config.upstream_base.clone(),
            timeout_secs: config.fetch_timeout_secs,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            max_image_bytes: config.max_image_bytes,
        })
    }

    /// `{base}/wiki/{title}` with the title as one escaped path segment.
    pub fn article_url(&self, title: &str, language: &str) -> Result<Url, FetchError> {
        let base = self
            .upstream_base
            .replace(crate::config::LANG_PLACEHOLDER, language);
        let mut url = Url::parse(base.trim_end_matches('/'))
            .map_err(|e| FetchError::UpstreamError(format!("bad upstream base: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| FetchError::UpstreamError("upstream base cannot carry a path".into()))?
            .pop_if_empty()
            .push("wiki")
            .push(title);
        Ok(url)
    }

    async fn get_article_once(&self, url: &Url) -> Result<String, FetchError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| FetchError::UpstreamError("fetcher shut down".into()))?;

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| self.map_article_error(e))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Err(FetchError::NotFound);
        }
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(FetchError::UpstreamError(format!("HTTP {status}")));
        }
        if !status.is_success() {
            return Err(FetchError::NotFound);
        }

        response.text().await.map_err(|e| self.map_article_error(e))
    }

    fn map_article_error(&self, e: reqwest::Error) -> FetchError {
        if e.is_timeout() {
            FetchError::Timeout {
                secs: self.timeout_secs,
            }
        } else {
            FetchError::UpstreamError(e.to_string())
        }
    }

    fn map_image_error(&self, e: reqwest::Error) -> ImageFetchError {
        if e.is_timeout() {
            ImageFetchError::Timeout {
                secs: self.timeout_secs,
            }
        } else {
            ImageFetchError::Unavailable(e.to_string())
        }
    }
}

#[async_trait]
impl Upstream for HttpFetcher {
    async fn fetch_article(&self, title: &str, language: &str) -> Result<RawArticle, FetchError> {
        let url = self.article_url(title, language)?;
        info!("Fetching article: {}", url);

        let mut attempt = 0;
        let raw_markup = loop {
            match self.get_article_once(&url).await {
                Ok(body) => break body,
                Err(e) if attempt == 0 && e.is_transient() => {
                    attempt += 1;
                    warn!(
                        "Article '{}': attempt 1 failed ({}), retrying after {}ms",
                        title,
                        e,
                        self.retry_backoff.as_millis()
                    );
                    sleep(self.retry_backoff).await;
                }
                Err(e) => return Err(e),
            }
        };

        debug!("Fetched '{}': {} bytes of markup", title, raw_markup.len());
        Ok(RawArticle {
            title: title.to_string(),
            raw_markup,
            fetched_at: SystemTime::now(),
        })
    }

    async fn fetch_image(&self, url: &str) -> Result<Bytes, ImageFetchError> {
        let parsed = Url::parse(url).map_err(|_| ImageFetchError::NotFound)?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ImageFetchError::NotFound);
        }

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ImageFetchError::Unavailable("fetcher shut down".into()))?;

        debug!("Fetching image: {}", url);
        let response = self
            .client
            .get(parsed)
            .send()
            .await
            .map_err(|e| self.map_image_error(e))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Err(ImageFetchError::NotFound);
        }
        if !status.is_success() {
            return Err(ImageFetchError::Unavailable(format!("HTTP {status}")));
        }

        let limit = self.max_image_bytes;
        if response.content_length().is_some_and(|len| len > limit) {
            return Err(ImageFetchError::TooLarge { limit });
        }

        if let Some(ct) = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
        {
            if !is_image_content_type(ct) {
                return Err(ImageFetchError::UnsupportedFormat {
                    content_type: ct.to_string(),
                });
            }
        }

        // Stream so an undeclared oversize body is cut off at the limit.
        let mut body = BytesMut::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| self.map_image_error(e))?;
            if body.len() as u64 + chunk.len() as u64 > limit {
                return Err(ImageFetchError::TooLarge { limit });
            }
            body.extend_from_slice(&chunk);
        }

        Ok(body.freeze())
    }
}

/// Content types that can plausibly carry raster data.
///
/// `application/octet-stream` is let through; the decoder sniffs magic bytes.
pub fn is_image_content_type(content_type: &str) -> bool {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    mime.starts_with("image/") || mime == "application/octet-stream"
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn fetcher() -> HttpFetcher {
        HttpFetcher::new(&ProxyConfig::default()).unwrap()
    }

    // ── Scripted upstream ───────────────────────────────────────────────

    /// Local HTTP server answering each connection with the next canned
    /// response (the last one repeats). Request heads are recorded.
    struct Scripted {
        addr: SocketAddr,
        requests: Arc<Mutex<Vec<String>>>,
    }

    impl Scripted {
        async fn start(responses: Vec<Vec<u8>>) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let requests = Arc::new(Mutex::new(Vec::new()));
            let seen = Arc::clone(&requests);
            tokio::spawn(async move {
                let mut served = 0;
                while let Ok((mut socket, _)) = listener.accept().await {
                    let mut head = Vec::new();
                    let mut buf = [0u8; 1024];
                    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => head.extend_from_slice(&buf[..n]),
                        }
                    }
                    seen.lock()
                        .unwrap()
                        .push(String::from_utf8_lossy(&head).to_ascii_lowercase());
                    let reply = &responses[served.min(responses.len() - 1)];
                    served += 1;
                    let _ = socket.write_all(reply).await;
                    let _ = socket.shutdown().await;
                }
            });
            Self { addr, requests }
        }

        fn base(&self) -> String {
            format!("http://{}", self.addr)
        }

        fn url(&self, path: &str) -> String {
            format!("http://{}{path}", self.addr)
        }

        fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    fn response(status: &str, content_type: &str, body: &[u8]) -> Vec<u8> {
        let mut out = format!(
            "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\n\
             Content-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        )
        .into_bytes();
        out.extend_from_slice(body);
        out
    }

    /// Chunked body, so no length is declared up front.
    fn chunked(content_type: &str, chunks: &[&[u8]]) -> Vec<u8> {
        let mut out = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: {content_type}\r\n\
             Transfer-Encoding: chunked\r\nConnection: close\r\n\r\n"
        )
        .into_bytes();
        for chunk in chunks {
            out.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
            out.extend_from_slice(chunk);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"0\r\n\r\n");
        out
    }

    fn local_fetcher(server: &Scripted, max_image_bytes: u64) -> HttpFetcher {
        let config = ProxyConfig::builder()
            .upstream_base(server.base())
            .user_agent("RetroTest/1.0 (+http://example.test)")
            .retry_backoff_ms(20)
            .max_image_bytes(max_image_bytes)
            .build()
            .unwrap();
        HttpFetcher::new(&config).unwrap()
    }

    #[test]
    fn article_url_escapes_title_segment() {
        let f = fetcher();
        let url = f.article_url("AC/DC", "en").unwrap();
        assert_eq!(url.as_str(), "https://en.wikipedia.org/wiki/AC%2FDC");
        let url = f.article_url("Café", "fr").unwrap();
        assert_eq!(url.as_str(), "https://fr.wikipedia.org/wiki/Caf%C3%A9");
    }

    #[test]
    fn article_url_keeps_base_path() {
        let config = ProxyConfig::builder()
            .upstream_base("http://127.0.0.1:8080/mirror/")
            .build()
            .unwrap();
        let f = HttpFetcher::new(&config).unwrap();
        let url = f.article_url("Lynx", "en").unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:8080/mirror/wiki/Lynx");
    }

    #[test]
    fn image_content_types() {
        assert!(is_image_content_type("image/png"));
        assert!(is_image_content_type("IMAGE/JPEG; charset=binary"));
        assert!(is_image_content_type("application/octet-stream"));
        assert!(!is_image_content_type("text/html; charset=utf-8"));
        assert!(!is_image_content_type("application/json"));
    }

    #[tokio::test]
    async fn non_http_image_url_is_not_found() {
        let f = fetcher();
        assert_eq!(
            f.fetch_image("file:///etc/passwd").await.unwrap_err(),
            ImageFetchError::NotFound
        );
    }

    #[tokio::test]
    async fn article_is_retried_once_after_server_error() {
        let server = Scripted::start(vec![
            response("503 Service Unavailable", "text/plain", b"busy"),
            response("200 OK", "text/html; charset=utf-8", b"<html><p>Lynx</p></html>"),
        ])
        .await;
        let f = local_fetcher(&server, 1024);

        let started = std::time::Instant::now();
        let article = f.fetch_article("Lynx", "en").await.unwrap();
        assert_eq!(article.raw_markup, "<html><p>Lynx</p></html>");
        assert_eq!(article.title, "Lynx");
        assert_eq!(server.request_count(), 2);
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn persistent_server_error_gives_up_after_one_retry() {
        let server =
            Scripted::start(vec![response("500 Internal Server Error", "text/plain", b"")]).await;
        let f = local_fetcher(&server, 1024);

        let err = f.fetch_article("Lynx", "en").await.unwrap_err();
        assert!(matches!(err, FetchError::UpstreamError(ref m) if m.contains("500")), "{err:?}");
        assert_eq!(server.request_count(), 2);
    }

    #[tokio::test]
    async fn missing_article_is_not_retried() {
        let server = Scripted::start(vec![
            response("404 Not Found", "text/html", b"no such page"),
            response("200 OK", "text/html", b"<html></html>"),
        ])
        .await;
        let f = local_fetcher(&server, 1024);

        assert_eq!(f.fetch_article("Nowhere", "en").await.unwrap_err(), FetchError::NotFound);
        assert_eq!(server.request_count(), 1);
    }

    #[tokio::test]
    async fn requests_carry_the_configured_user_agent() {
        let server = Scripted::start(vec![response("200 OK", "image/png", b"\x89PNG....")]).await;
        let f = local_fetcher(&server, 1024);

        let bytes = f.fetch_image(&server.url("/a/Logo.png")).await.unwrap();
        assert_eq!(&bytes[..], b"\x89PNG....");
        let requests = server.requests.lock().unwrap();
        assert!(requests[0].starts_with("get /a/logo.png http/1.1"), "{}", requests[0]);
        assert!(
            requests[0].contains("user-agent: retrotest/1.0 (+http://example.test)"),
            "{}",
            requests[0]
        );
    }

    #[tokio::test]
    async fn declared_oversize_image_is_rejected() {
        let server = Scripted::start(vec![response("200 OK", "image/png", &[0u8; 2048])]).await;
        let f = local_fetcher(&server, 1024);

        assert_eq!(
            f.fetch_image(&server.url("/big.png")).await.unwrap_err(),
            ImageFetchError::TooLarge { limit: 1024 }
        );
    }

    #[tokio::test]
    async fn undeclared_oversize_image_is_cut_off() {
        let chunk = [7u8; 600];
        let server = Scripted::start(vec![chunked("image/jpeg", &[&chunk, &chunk, &chunk])]).await;
        let f = local_fetcher(&server, 1024);

        assert_eq!(
            f.fetch_image(&server.url("/stream.jpg")).await.unwrap_err(),
            ImageFetchError::TooLarge { limit: 1024 }
        );
    }

    #[tokio::test]
    async fn undeclared_image_within_limit_is_assembled() {
        let server = Scripted::start(vec![chunked("image/gif", &[b"GIF89a", b"rest"])]).await;
        let f = local_fetcher(&server, 1024);

        let bytes = f.fetch_image(&server.url("/small.gif")).await.unwrap();
        assert_eq!(&bytes[..], b"GIF89arest");
    }

    #[tokio::test]
    async fn html_in_place_of_an_image_is_rejected() {
        let server = Scripted::start(vec![response(
            "200 OK",
            "text/html; charset=utf-8",
            b"<html>login required</html>",
        )])
        .await;
        let f = local_fetcher(&server, 1024);

        assert_eq!(
            f.fetch_image(&server.url("/wall.png")).await.unwrap_err(),
            ImageFetchError::UnsupportedFormat {
                content_type: "text/html; charset=utf-8".into()
            }
        );
    }

    #[tokio::test]
    async fn missing_image_is_not_found() {
        let server = Scripted::start(vec![response("404 Not Found", "text/html", b"gone")]).await;
        let f = local_fetcher(&server, 1024);

        assert_eq!(
            f.fetch_image(&server.url("/gone.png")).await.unwrap_err(),
            ImageFetchError::NotFound
        );
        assert_eq!(server.request_count(), 1);
    }
}
