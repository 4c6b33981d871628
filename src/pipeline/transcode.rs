//! Image transcoding: any supported raster → small indexed GIF.
//!
//! ```text
//! bytes ──▶ decode ──▶ flatten alpha ──▶ resize ──▶ quantize ──▶ GIF/LZW
//!          (sniffed)   (theme matte)     (fit box)   (≤256 cols)
//! ```
//!
//! Decoding, resampling and quantization are CPU-bound and run inside
//! `spawn_blocking` via [`transcode_async`], bounded by a timeout. The
//! output depends only on the source bytes and [`TransformParams`], which
//! is what makes content-addressed caching of the result sound.

use crate::config::{ProxyConfig, Theme};
use crate::error::TranscodeError;
use crate::pipeline::decode::DecoderRegistry;
use crate::pipeline::quantize::{quantize, IndexedImage};
use bytes::Bytes;
use image::imageops::FilterType;
use image::{Rgb, RgbImage, RgbaImage};
use once_cell::sync::Lazy;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

pub const PLACEHOLDER_WIDTH: u32 = 32;
pub const PLACEHOLDER_HEIGHT: u32 = 24;

/// Everything besides the source bytes that determines the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TransformParams {
    pub max_width: u32,
    pub max_height: u32,
    pub max_palette: u16,
    pub dither: bool,
    /// Matte colour for transparent pixels.
    pub background: [u8; 3],
}

impl TransformParams {
    pub fn from_config(config: &ProxyConfig, theme: Theme) -> Self {
        Self {
            max_width: config.max_image_width,
            max_height: config.max_image_height,
            max_palette: config.max_palette_size,
            dither: config.dither,
            background: theme.background(),
        }
    }
}

/// Canonical form used inside cache keys, e.g. `320x240/p256/d0/bgffffff`.
impl fmt::Display for TransformParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [r, g, b] = self.background;
        write!(
            f,
            "{}x{}/p{}/d{}/bg{r:02x}{g:02x}{b:02x}",
            self.max_width,
            self.max_height,
            self.max_palette,
            u8::from(self.dither)
        )
    }
}

/// A successfully transcoded image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscodedImage {
    pub source_url: String,
    pub width: u32,
    pub height: u32,
    pub palette_size: u16,
    pub encoded: Bytes,
    /// SHA-256 of the *source* bytes, lowercase hex.
    pub content_hash: String,
}

/// Lowercase hex SHA-256 of `bytes`.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Largest size with the same aspect ratio that fits in `max_w × max_h`.
/// Never upscales; never returns a zero dimension.
pub fn fit_within(width: u32, height: u32, max_w: u32, max_h: u32) -> (u32, u32) {
    if width <= max_w && height <= max_h {
        return (width, height);
    }
    let scale = f64::min(
        f64::from(max_w) / f64::from(width),
        f64::from(max_h) / f64::from(height),
    );
    let w = (f64::from(width) * scale).round().clamp(1.0, f64::from(max_w)) as u32;
    let h = (f64::from(height) * scale).round().clamp(1.0, f64::from(max_h)) as u32;
    (w, h)
}

/// Composite RGBA over `background`, dropping the alpha channel.
pub fn flatten_alpha(img: &RgbaImage, background: [u8; 3]) -> RgbImage {
    RgbImage::from_fn(img.width(), img.height(), |x, y| {
        let p = img.get_pixel(x, y).0;
        let a = u16::from(p[3]);
        let blend = |c: u8, bg: u8| -> u8 {
            ((u16::from(c) * a + u16::from(bg) * (255 - a) + 127) / 255) as u8
        };
        Rgb([
            blend(p[0], background[0]),
            blend(p[1], background[1]),
            blend(p[2], background[2]),
        ])
    })
}

/// GIF89a, single frame, global palette, non-interlaced.
pub fn encode_gif(indexed: &IndexedImage) -> Result<Vec<u8>, TranscodeError> {
    let w = u16::try_from(indexed.width).map_err(|_| TranscodeError::BadDimensions {
        width: indexed.width,
        height: indexed.height,
    })?;
    let h = u16::try_from(indexed.height).map_err(|_| TranscodeError::BadDimensions {
        width: indexed.width,
        height: indexed.height,
    })?;

    let palette = indexed.palette_bytes();
    let mut out = Vec::new();
    {
        let mut encoder = gif::Encoder::new(&mut out, w, h, &palette)
            .map_err(|e| TranscodeError::Encode(e.to_string()))?;
        let frame = gif::Frame {
            width: w,
            height: h,
            buffer: Cow::Borrowed(&indexed.indices),
            ..gif::Frame::default()
        };
        encoder
            .write_frame(&frame)
            .map_err(|e| TranscodeError::Encode(e.to_string()))?;
    }
    Ok(out)
}

/// Run the full pipeline synchronously.
pub fn transcode(
    bytes: &[u8],
    source_url: &str,
    params: &TransformParams,
    decoders: &DecoderRegistry,
) -> Result<TranscodedImage, TranscodeError> {
    let start = Instant::now();
    let (format, rgba) = decoders.decode(bytes)?;
    let (src_w, src_h) = rgba.dimensions();

    let flat = flatten_alpha(&rgba, params.background);
    let (w, h) = fit_within(src_w, src_h, params.max_width, params.max_height);
    let resized = if (w, h) == (src_w, src_h) {
        flat
    } else {
        image::imageops::resize(&flat, w, h, FilterType::Triangle)
    };

    let indexed = quantize(&resized, usize::from(params.max_palette), params.dither);
    let encoded = encode_gif(&indexed)?;

    debug!(
        "Transcoded {} {}x{} → gif {}x{} ({} colours, {} bytes) in {:?}",
        format,
        src_w,
        src_h,
        w,
        h,
        indexed.palette.len(),
        encoded.len(),
        start.elapsed()
    );

    Ok(TranscodedImage {
        source_url: source_url.to_string(),
        width: w,
        height: h,
        palette_size: indexed.palette.len() as u16,
        encoded: Bytes::from(encoded),
        content_hash: content_hash(bytes),
    })
}

/// Run [`transcode`] on the blocking pool under `budget`.
pub async fn transcode_async(
    bytes: Bytes,
    source_url: String,
    params: TransformParams,
    decoders: Arc<DecoderRegistry>,
    budget: Duration,
) -> Result<TranscodedImage, TranscodeError> {
    let task = tokio::task::spawn_blocking(move || {
        transcode(&bytes, &source_url, &params, &decoders)
    });
    match tokio::time::timeout(budget, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => Err(TranscodeError::Encode(format!("transcode task failed: {e}"))),
        Err(_) => Err(TranscodeError::Timeout {
            ms: budget.as_millis() as u64,
        }),
    }
}

/// 1×1 white GIF, used only if the drawn placeholder cannot be encoded.
const MINIMAL_GIF: &[u8] = &[
    0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0xFF, 0xFF,
    0xFF, 0x00, 0x00, 0x00, 0x2C, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x02,
    0x02, 0x44, 0x01, 0x00, 0x3B,
];

static PLACEHOLDER: Lazy<Bytes> = Lazy::new(|| {
    // Grey box, dark border, one diagonal.
    let (w, h) = (PLACEHOLDER_WIDTH, PLACEHOLDER_HEIGHT);
    let indices = (0..h)
        .flat_map(|y| {
            (0..w).map(move |x| {
                let border = x == 0 || y == 0 || x == w - 1 || y == h - 1;
                let diagonal = x * h / w == y;
                u8::from(border || diagonal)
            })
        })
        .collect();
    let indexed = IndexedImage {
        width: w,
        height: h,
        palette: vec![[0xC0, 0xC0, 0xC0], [0x60, 0x60, 0x60]],
        indices,
    };
    encode_gif(&indexed)
        .map(Bytes::from)
        .unwrap_or_else(|_| Bytes::from_static(MINIMAL_GIF))
});

/// The static "image unavailable" GIF.
pub fn placeholder_gif() -> Bytes {
    PLACEHOLDER.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, ImageFormat, Rgba};
    use std::io::Cursor;

    fn params() -> TransformParams {
        TransformParams::from_config(&ProxyConfig::default(), Theme::Light)
    }

    fn png(w: u32, h: u32) -> Vec<u8> {
        let img: RgbaImage = ImageBuffer::from_fn(w, h, |x, y| {
            Rgba([(x % 256) as u8, (y % 256) as u8, ((x * y) % 256) as u8, 255])
        });
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    fn gif_palette_len(bytes: &[u8]) -> usize {
        let mut opts = gif::DecodeOptions::new();
        opts.set_color_output(gif::ColorOutput::Indexed);
        let decoder = opts.read_info(Cursor::new(bytes)).unwrap();
        decoder.global_palette().map(|p| p.len() / 3).unwrap_or(0)
    }

    #[test]
    fn fit_within_preserves_aspect_and_never_upscales() {
        assert_eq!(fit_within(640, 480, 320, 240), (320, 240));
        assert_eq!(fit_within(1000, 100, 320, 240), (320, 32));
        assert_eq!(fit_within(100, 1000, 320, 240), (24, 240));
        assert_eq!(fit_within(50, 40, 320, 240), (50, 40));
        assert_eq!(fit_within(10_000, 1, 320, 240), (320, 1));
    }

    #[test]
    fn flatten_uses_background_for_transparency() {
        let img: RgbaImage = ImageBuffer::from_pixel(1, 1, Rgba([255, 0, 0, 0]));
        assert_eq!(flatten_alpha(&img, [0, 0, 0]).get_pixel(0, 0).0, [0, 0, 0]);
        assert_eq!(
            flatten_alpha(&img, [255, 255, 255]).get_pixel(0, 0).0,
            [255, 255, 255]
        );
        let opaque: RgbaImage = ImageBuffer::from_pixel(1, 1, Rgba([10, 20, 30, 255]));
        assert_eq!(flatten_alpha(&opaque, [0, 0, 0]).get_pixel(0, 0).0, [10, 20, 30]);
    }

    #[test]
    fn output_is_bounded_gif() {
        let out = transcode(&png(800, 600), "u", &params(), &DecoderRegistry::standard()).unwrap();
        assert!(out.width <= 320 && out.height <= 240);
        assert_eq!((out.width, out.height), (320, 240));
        assert!(out.palette_size <= 256);
        assert!(out.encoded.starts_with(b"GIF89a"));
        assert!(gif_palette_len(&out.encoded) <= 256);

        let decoded = image::load_from_memory_with_format(&out.encoded, ImageFormat::Gif).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (out.width, out.height));
    }

    #[test]
    fn small_palette_budget_is_respected() {
        let mut p = params();
        p.max_palette = 16;
        let out = transcode(&png(64, 64), "u", &p, &DecoderRegistry::standard()).unwrap();
        assert!(out.palette_size <= 16);
        assert!(gif_palette_len(&out.encoded) <= 16);
    }

    #[test]
    fn same_input_same_bytes() {
        let src = png(200, 150);
        let r = DecoderRegistry::standard();
        let a = transcode(&src, "u", &params(), &r).unwrap();
        let b = transcode(&src, "u", &params(), &r).unwrap();
        assert_eq!(a.encoded, b.encoded);
        assert_eq!(a.content_hash, content_hash(&src));
    }

    #[test]
    fn garbage_is_an_error() {
        let err = transcode(b"not an image", "u", &params(), &DecoderRegistry::standard())
            .unwrap_err();
        assert_eq!(err, TranscodeError::UnsupportedFormat);
    }

    #[test]
    fn params_display_is_canonical() {
        let p = TransformParams::from_config(&ProxyConfig::default(), Theme::Dark);
        assert_eq!(p.to_string(), "320x240/p256/d0/bg000000");
    }

    #[test]
    fn placeholder_is_valid_gif() {
        let bytes = placeholder_gif();
        let img = image::load_from_memory_with_format(&bytes, ImageFormat::Gif).unwrap();
        assert_eq!((img.width(), img.height()), (PLACEHOLDER_WIDTH, PLACEHOLDER_HEIGHT));
    }

    #[test]
    fn content_hash_is_sha256_hex() {
        assert_eq!(
            content_hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn async_transcode_times_out_cleanly() {
        let err = transcode_async(
            Bytes::from(png(1200, 900)),
            "u".into(),
            params(),
            Arc::new(DecoderRegistry::standard()),
            Duration::from_nanos(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TranscodeError::Timeout { .. }));
    }
}
