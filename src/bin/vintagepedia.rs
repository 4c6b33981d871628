//! CLI binary for vintagepedia.
//!
//! A thin shim over the library crate: flags map onto `ProxyConfig`,
//! `serve` exposes the proxy over HTTP, `render` and `image` run a single
//! request and write the result.

use anyhow::{Context, Result};
use axum::extract::{ConnectInfo, Path, RawQuery, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::Router;
use clap::{Parser, Subcommand};
use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::{Path as FsPath, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use vintagepedia::pipeline::emit;
use vintagepedia::proxy::encode_image_key;
use vintagepedia::{
    ArticleRequest, ImageMode, Proxy, ProxyConfig, ProxyError, RenderOptions, RequestClass, Theme,
};

/// Cookie holding the reader's theme and image preferences.
const PREFS_COOKIE: &str = "vp_prefs";

/// Fixed dates; period browsers predate `Max-Age`.
const COOKIE_KEEP: &str = "Fri, 31-Dec-2037 23:59:59 GMT";
const COOKIE_EXPIRED: &str = "Thu, 01-Jan-1970 00:00:00 GMT";

const HOME_TITLE: &str = "Main_Page";

const AFTER_HELP: &str = r#"EXAMPLES:
  # Serve on port 8080 for the whole LAN
  vintagepedia serve --bind 0.0.0.0:8080

  # Slower clients: one page every two seconds, 16-colour images
  vintagepedia --page-rate 1 --rate-window-ms 2000 --palette 16 serve

  # Render one article to a file
  vintagepedia render "Lynx (web browser)" -o lynx.html

  # Simplified node tree as JSON
  vintagepedia render Gopher_(protocol) --lang en --json

  # Transcode one image
  vintagepedia image https://upload.wikimedia.org/wikipedia/commons/a/a9/Example.jpg -o example.gif

BROWSER URLS:
  /wiki/<Title>?lang=de&theme=dark&images=first
  /image/<key>?theme=dark
  /health

  theme=light|dark and images=all|first|none are remembered in the
  vp_prefs cookie once given on the query string.

ENVIRONMENT VARIABLES:
  RUST_LOG                 Log filter (overrides -v / -q)
  VINTAGEPEDIA_*           Fallback for every long flag, e.g. VINTAGEPEDIA_PAGE_RATE
"#;

/// Serve encyclopedia articles to vintage browsers.
#[derive(Parser, Debug)]
#[command(
    name = "vintagepedia",
    version,
    about = "Serve encyclopedia articles to vintage browsers as HTML 3.2 and GIF",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Upstream base URL; `{lang}` is replaced by the language code.
    #[arg(long, global = true, env = "VINTAGEPEDIA_UPSTREAM")]
    upstream: Option<String>,

    /// Language used when a request names none.
    #[arg(long, global = true, env = "VINTAGEPEDIA_DEFAULT_LANG", default_value = "en")]
    default_lang: String,

    /// Page requests allowed per client per window.
    #[arg(long, global = true, env = "VINTAGEPEDIA_PAGE_RATE", default_value_t = 1)]
    page_rate: u32,

    /// Image requests allowed per client per window.
    #[arg(long, global = true, env = "VINTAGEPEDIA_IMAGE_RATE", default_value_t = 5)]
    image_rate: u32,

    /// Rate-limit window length in milliseconds.
    #[arg(long, global = true, env = "VINTAGEPEDIA_RATE_WINDOW_MS", default_value_t = 1000)]
    rate_window_ms: u64,

    /// Rendered article lifetime in the cache, seconds.
    #[arg(long, global = true, env = "VINTAGEPEDIA_ARTICLE_TTL", default_value_t = 600)]
    article_ttl: u64,

    /// Transcoded image lifetime in the cache, seconds.
    #[arg(long, global = true, env = "VINTAGEPEDIA_IMAGE_TTL", default_value_t = 86_400)]
    image_ttl: u64,

    /// Cache capacity in megabytes.
    #[arg(long, global = true, env = "VINTAGEPEDIA_CACHE_MB", default_value_t = 256)]
    cache_mb: u64,

    /// Largest image width served.
    #[arg(long, global = true, env = "VINTAGEPEDIA_MAX_WIDTH", default_value_t = 320)]
    max_width: u32,

    /// Largest image height served.
    #[arg(long, global = true, env = "VINTAGEPEDIA_MAX_HEIGHT", default_value_t = 240)]
    max_height: u32,

    /// Palette size for transcoded images (2-256).
    #[arg(long, global = true, env = "VINTAGEPEDIA_PALETTE", default_value_t = 256)]
    palette: u16,

    /// Apply ordered dithering when reducing colours.
    #[arg(long, global = true, env = "VINTAGEPEDIA_DITHER")]
    dither: bool,

    /// Largest upstream image accepted, in megabytes.
    #[arg(long, global = true, env = "VINTAGEPEDIA_MAX_IMAGE_MB", default_value_t = 8)]
    max_image_mb: u64,

    /// Concurrent outbound requests.
    #[arg(long, global = true, env = "VINTAGEPEDIA_OUTBOUND", default_value_t = 8)]
    outbound: usize,

    /// Outbound request timeout in seconds.
    #[arg(long, global = true, env = "VINTAGEPEDIA_FETCH_TIMEOUT", default_value_t = 10)]
    fetch_timeout: u64,

    /// Overall budget for one page render, milliseconds.
    #[arg(long, global = true, env = "VINTAGEPEDIA_PAGE_TIMEOUT_MS", default_value_t = 30_000)]
    page_timeout_ms: u64,

    /// Hosts images may be proxied from (comma separated). Replaces the defaults.
    #[arg(long, global = true, env = "VINTAGEPEDIA_IMAGE_HOSTS", value_delimiter = ',')]
    image_host: Vec<String>,

    /// Enable verbose (debug) logging.
    #[arg(short, long, global = true, env = "VINTAGEPEDIA_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "VINTAGEPEDIA_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP front end.
    Serve {
        /// Address to listen on.
        #[arg(long, env = "VINTAGEPEDIA_BIND", default_value = "127.0.0.1:8080")]
        bind: SocketAddr,
    },

    /// Render one article and write the page.
    Render {
        /// Article title, spaces or underscores.
        title: String,

        /// Language edition.
        #[arg(long, default_value = "")]
        lang: String,

        #[arg(long, value_enum, default_value = "light")]
        theme: ThemeArg,

        #[arg(long, value_enum, default_value = "all")]
        images: ImagesArg,

        /// Output file (default: stdout).
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Print the simplified node tree as JSON instead of HTML.
        #[arg(long)]
        json: bool,
    },

    /// Transcode one upstream image to GIF.
    Image {
        /// Absolute image URL on an allowed host.
        url: String,

        #[arg(long, value_enum, default_value = "light")]
        theme: ThemeArg,

        /// Output file.
        #[arg(short, long)]
        output: PathBuf,
    },
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum ThemeArg {
    Light,
    Dark,
}

impl From<ThemeArg> for Theme {
    fn from(v: ThemeArg) -> Self {
        match v {
            ThemeArg::Light => Theme::Light,
            ThemeArg::Dark => Theme::Dark,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum ImagesArg {
    All,
    First,
    None,
}

impl From<ImagesArg> for ImageMode {
    fn from(v: ImagesArg) -> Self {
        match v {
            ImagesArg::All => ImageMode::All,
            ImagesArg::First => ImageMode::First,
            ImagesArg::None => ImageMode::None,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let filter = if cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Build config ─────────────────────────────────────────────────────
    let config = build_config(&cli)?;
    let proxy = Proxy::new(config).context("failed to initialise proxy")?;

    match cli.command {
        Command::Serve { bind } => serve(proxy, bind).await,
        Command::Render {
            title,
            lang,
            theme,
            images,
            output,
            json,
        } => {
            let request = ArticleRequest::new(
                title,
                lang,
                RenderOptions::new(theme.into(), images.into()),
            );
            let started = Instant::now();
            let bytes = if json {
                let doc = proxy.simplify_article(&request).await?;
                let mut s = serde_json::to_string_pretty(&doc)?;
                s.push('\n');
                s.into_bytes()
            } else {
                proxy.render_article(&request).await?.bytes.to_vec()
            };
            match output {
                Some(path) => {
                    write_atomic(&path, &bytes).await?;
                    if !cli.quiet {
                        eprintln!(
                            "Wrote {} bytes to {} in {:.1}s",
                            bytes.len(),
                            path.display(),
                            started.elapsed().as_secs_f64()
                        );
                    }
                }
                None => io::stdout().write_all(&bytes)?,
            }
            Ok(())
        }
        Command::Image { url, theme, output } => {
            let options = RenderOptions::new(theme.into(), ImageMode::All);
            let rendered = proxy.render_image(&encode_image_key(&url), options).await?;
            write_atomic(&output, &rendered.bytes).await?;
            if !cli.quiet {
                eprintln!("Wrote {} bytes to {}", rendered.bytes.len(), output.display());
            }
            Ok(())
        }
    }
}

fn build_config(cli: &Cli) -> Result<ProxyConfig> {
    let mut builder = ProxyConfig::builder()
        .default_language(cli.default_lang.clone())
        .page_rate_limit(cli.page_rate)
        .image_rate_limit(cli.image_rate)
        .rate_window_ms(cli.rate_window_ms)
        .article_cache_ttl_secs(cli.article_ttl)
        .image_cache_ttl_secs(cli.image_ttl)
        .cache_capacity_bytes(cli.cache_mb.saturating_mul(1024 * 1024))
        .max_image_size(cli.max_width, cli.max_height)
        .max_palette_size(cli.palette)
        .dither(cli.dither)
        .max_image_bytes(cli.max_image_mb.saturating_mul(1024 * 1024))
        .max_outbound_concurrency(cli.outbound)
        .fetch_timeout_secs(cli.fetch_timeout)
        .page_timeout_ms(cli.page_timeout_ms);
    if let Some(upstream) = &cli.upstream {
        builder = builder.upstream_base(upstream.clone());
    }
    if !cli.image_host.is_empty() {
        builder = builder.allowed_image_hosts(cli.image_host.iter().map(|h| h.trim().to_string()));
    }
    builder.build().context("invalid configuration")
}

/// Write via a temp file and rename so readers never see a partial file.
async fn write_atomic(path: &FsPath, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("cannot create {}", parent.display()))?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, bytes)
        .await
        .with_context(|| format!("cannot write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("cannot move output to {}", path.display()))?;
    Ok(())
}

// ── HTTP front end ───────────────────────────────────────────────────────

async fn serve(proxy: Proxy, bind: SocketAddr) -> Result<()> {
    let _maintenance = proxy.spawn_maintenance();

    let app = Router::new()
        .route("/", get(home))
        .route("/wiki/{*title}", get(article))
        .route("/image/{key}", get(image))
        .route("/health", get(health))
        .with_state(proxy);

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("cannot bind {bind}"))?;
    info!("Listening on http://{}", bind);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

    info!("Shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("cannot listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

async fn home(RawQuery(query): RawQuery) -> Redirect {
    match query.filter(|q| !q.is_empty()) {
        Some(q) => Redirect::to(&format!("/wiki/{HOME_TITLE}?{q}")),
        None => Redirect::to(&format!("/wiki/{HOME_TITLE}")),
    }
}

async fn health() -> &'static str {
    "OK"
}

async fn article(
    State(proxy): State<Proxy>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(title): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    let query = query.unwrap_or_default();
    let options = request_options(&headers, &query);

    if let Err(e) = proxy.admit(peer.ip(), RequestClass::Page) {
        debug!("{} refused: {}", peer, e);
        return error_response(&e, options);
    }

    let request = ArticleRequest::new(title, query_value(&query, "lang").unwrap_or_default(), options);
    let mut response = match proxy.render_article(&request).await {
        Ok(page) => ([(header::CONTENT_TYPE, page.content_type)], page.bytes).into_response(),
        Err(e) => error_response(&e, options),
    };
    if sets_options(&query) {
        if let Ok(cookie) = HeaderValue::from_str(&prefs_cookie(options)) {
            response.headers_mut().insert(header::SET_COOKIE, cookie);
        }
    }
    response
}

async fn image(
    State(proxy): State<Proxy>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(key): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    let options = request_options(&headers, &query.unwrap_or_default());

    if let Err(e) = proxy.admit(peer.ip(), RequestClass::Image) {
        debug!("{} refused: {}", peer, e);
        return plain_error(&e);
    }

    match proxy.render_image(&key, options).await {
        Ok(gif) => (
            [
                (header::CONTENT_TYPE, gif.content_type),
                (header::CACHE_CONTROL, "public, max-age=86400"),
            ],
            gif.bytes,
        )
            .into_response(),
        Err(e) => plain_error(&e),
    }
}

// ── Request helpers ──────────────────────────────────────────────────────

/// Stored cookie preferences overlaid with anything on the query string.
fn request_options(headers: &HeaderMap, query: &str) -> RenderOptions {
    let stored = headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == PREFS_COOKIE)
        .map(|(_, value)| RenderOptions::from_query(value))
        .unwrap_or_default();
    stored.with_overrides(query)
}

fn query_value(query: &str, key: &str) -> Option<String> {
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

fn sets_options(query: &str) -> bool {
    url::form_urlencoded::parse(query.as_bytes()).any(|(k, _)| k == "theme" || k == "images")
}

fn prefs_cookie(options: RenderOptions) -> String {
    let value = options.to_query();
    if value.is_empty() {
        format!("{PREFS_COOKIE}=; path=/; expires={COOKIE_EXPIRED}")
    } else {
        format!("{PREFS_COOKIE}={value}; path=/; expires={COOKIE_KEEP}")
    }
}

fn status_of(e: &ProxyError) -> StatusCode {
    StatusCode::from_u16(e.status().http_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

fn with_retry_after(mut response: Response, e: &ProxyError) -> Response {
    if let Some(secs) = e.retry_after_secs() {
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(secs));
    }
    response
}

fn public_message(e: &ProxyError) -> String {
    match e {
        ProxyError::Internal(_) | ProxyError::InvalidConfig(_) => {
            warn!("internal failure: {}", e);
            "Something went wrong while preparing this page.".to_string()
        }
        other => other.to_string(),
    }
}

fn error_response(e: &ProxyError, options: RenderOptions) -> Response {
    let body = emit::error_page(&public_message(e), options);
    let response = (
        status_of(e),
        [(header::CONTENT_TYPE, vintagepedia::cache::CONTENT_TYPE_HTML)],
        body,
    )
        .into_response();
    with_retry_after(response, e)
}

fn plain_error(e: &ProxyError) -> Response {
    let response = (
        status_of(e),
        [(header::CONTENT_TYPE, "text/plain")],
        public_message(e),
    )
        .into_response();
    with_retry_after(response, e)
}
