//! Source-format decoding behind a capability interface.
//!
//! Each supported input format is one [`RasterDecoder`] implementation
//! registered in a [`DecoderRegistry`]. The registry picks a decoder by
//! sniffing the leading bytes, never by file extension or the upstream
//! `Content-Type`, both of which are regularly wrong.
//!
//! All decoders enforce [`DecodeLimits`] so a small file declaring a huge
//! canvas cannot exhaust memory.

use crate::error::TranscodeError;
use image::{ImageFormat, ImageReader, Limits, RgbaImage};
use std::io::Cursor;

/// Bounds applied while decoding untrusted input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeLimits {
    pub max_width: u32,
    pub max_height: u32,
    pub max_alloc_bytes: u64,
}

impl Default for DecodeLimits {
    fn default() -> Self {
        Self {
            max_width: 12_000,
            max_height: 12_000,
            max_alloc_bytes: 256 * 1024 * 1024,
        }
    }
}

/// A decoder for one source format.
pub trait RasterDecoder: Send + Sync {
    /// Short format name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Whether `bytes` start with this format's signature.
    fn sniff(&self, bytes: &[u8]) -> bool;

    /// Decode the first frame to RGBA.
    fn decode(&self, bytes: &[u8], limits: &DecodeLimits) -> Result<RgbaImage, TranscodeError>;
}

fn decode_with(
    bytes: &[u8],
    format: ImageFormat,
    name: &'static str,
    limits: &DecodeLimits,
) -> Result<RgbaImage, TranscodeError> {
    let mut image_limits = Limits::default();
    image_limits.max_image_width = Some(limits.max_width);
    image_limits.max_image_height = Some(limits.max_height);
    image_limits.max_alloc = Some(limits.max_alloc_bytes);

    let mut reader = ImageReader::with_format(Cursor::new(bytes), format);
    reader.limits(image_limits);
    let decoded = reader.decode().map_err(|e| TranscodeError::Decode {
        format: name,
        detail: e.to_string(),
    })?;
    let rgba = decoded.to_rgba8();
    if rgba.width() == 0 || rgba.height() == 0 {
        return Err(TranscodeError::BadDimensions {
            width: rgba.width(),
            height: rgba.height(),
        });
    }
    Ok(rgba)
}

pub struct PngDecoder;

impl RasterDecoder for PngDecoder {
    fn name(&self) -> &'static str {
        "png"
    }

    fn sniff(&self, bytes: &[u8]) -> bool {
        bytes.starts_with(b"\x89PNG\r\n\x1a\n")
    }

    fn decode(&self, bytes: &[u8], limits: &DecodeLimits) -> Result<RgbaImage, TranscodeError> {
        decode_with(bytes, ImageFormat::Png, self.name(), limits)
    }
}

pub struct JpegDecoder;

impl RasterDecoder for JpegDecoder {
    fn name(&self) -> &'static str {
        "jpeg"
    }

    fn sniff(&self, bytes: &[u8]) -> bool {
        bytes.starts_with(&[0xFF, 0xD8, 0xFF])
    }

    fn decode(&self, bytes: &[u8], limits: &DecodeLimits) -> Result<RgbaImage, TranscodeError> {
        decode_with(bytes, ImageFormat::Jpeg, self.name(), limits)
    }
}

/// First frame only; animation is not carried over.
pub struct GifDecoder;

impl RasterDecoder for GifDecoder {
    fn name(&self) -> &'static str {
        "gif"
    }

    fn sniff(&self, bytes: &[u8]) -> bool {
        bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a")
    }

    fn decode(&self, bytes: &[u8], limits: &DecodeLimits) -> Result<RgbaImage, TranscodeError> {
        decode_with(bytes, ImageFormat::Gif, self.name(), limits)
    }
}

pub struct BmpDecoder;

impl RasterDecoder for BmpDecoder {
    fn name(&self) -> &'static str {
        "bmp"
    }

    fn sniff(&self, bytes: &[u8]) -> bool {
        bytes.starts_with(b"BM")
    }

    fn decode(&self, bytes: &[u8], limits: &DecodeLimits) -> Result<RgbaImage, TranscodeError> {
        decode_with(bytes, ImageFormat::Bmp, self.name(), limits)
    }
}

pub struct WebpDecoder;

impl RasterDecoder for WebpDecoder {
    fn name(&self) -> &'static str {
        "webp"
    }

    fn sniff(&self, bytes: &[u8]) -> bool {
        bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP"
    }

    fn decode(&self, bytes: &[u8], limits: &DecodeLimits) -> Result<RgbaImage, TranscodeError> {
        decode_with(bytes, ImageFormat::WebP, self.name(), limits)
    }
}

/// Ordered set of decoders; the first whose signature matches wins.
pub struct DecoderRegistry {
    decoders: Vec<Box<dyn RasterDecoder>>,
    limits: DecodeLimits,
}

impl Default for DecoderRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl DecoderRegistry {
    /// An empty registry.
    pub fn empty(limits: DecodeLimits) -> Self {
        Self {
            decoders: Vec::new(),
            limits,
        }
    }

    /// PNG, JPEG, GIF, BMP and WebP with default limits.
    pub fn standard() -> Self {
        let mut r = Self::empty(DecodeLimits::default());
        r.register(Box::new(PngDecoder));
        r.register(Box::new(JpegDecoder));
        r.register(Box::new(GifDecoder));
        r.register(Box::new(BmpDecoder));
        r.register(Box::new(WebpDecoder));
        r
    }

    pub fn register(&mut self, decoder: Box<dyn RasterDecoder>) {
        self.decoders.push(decoder);
    }

    /// Names of the registered formats, in selection order.
    pub fn formats(&self) -> Vec<&'static str> {
        self.decoders.iter().map(|d| d.name()).collect()
    }

    pub fn select(&self, bytes: &[u8]) -> Option<&dyn RasterDecoder> {
        self.decoders
            .iter()
            .find(|d| d.sniff(bytes))
            .map(|d| d.as_ref())
    }

    /// Sniff and decode. Returns the format name alongside the pixels.
    pub fn decode(&self, bytes: &[u8]) -> Result<(&'static str, RgbaImage), TranscodeError> {
        let decoder = self.select(bytes).ok_or(TranscodeError::UnsupportedFormat)?;
        let image = decoder.decode(bytes, &self.limits)?;
        Ok((decoder.name(), image))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgba};

    fn encoded(format: ImageFormat) -> Vec<u8> {
        let img: RgbaImage = ImageBuffer::from_fn(8, 6, |x, y| Rgba([x as u8 * 30, y as u8 * 40, 90, 255]));
        let mut buf = Cursor::new(Vec::new());
        image::DynamicImage::ImageRgba8(img)
            .to_rgb8()
            .write_to(&mut buf, format)
            .unwrap();
        buf.into_inner()
    }

    #[test]
    fn selects_by_signature_not_extension() {
        let r = DecoderRegistry::standard();
        assert_eq!(r.select(&encoded(ImageFormat::Png)).unwrap().name(), "png");
        assert_eq!(r.select(&encoded(ImageFormat::Jpeg)).unwrap().name(), "jpeg");
        assert_eq!(r.select(&encoded(ImageFormat::Gif)).unwrap().name(), "gif");
        assert_eq!(r.select(&encoded(ImageFormat::Bmp)).unwrap().name(), "bmp");
        assert!(r.select(b"<html>not an image</html>").is_none());
    }

    #[test]
    fn webp_signature() {
        let mut header = b"RIFF\0\0\0\0WEBPVP8 ".to_vec();
        header.extend_from_slice(&[0; 8]);
        assert_eq!(DecoderRegistry::standard().select(&header).unwrap().name(), "webp");
    }

    #[test]
    fn decodes_png() {
        let (name, img) = DecoderRegistry::standard()
            .decode(&encoded(ImageFormat::Png))
            .unwrap();
        assert_eq!(name, "png");
        assert_eq!(img.dimensions(), (8, 6));
    }

    #[test]
    fn unknown_format_is_unsupported() {
        assert_eq!(
            DecoderRegistry::standard().decode(b"plain text").unwrap_err(),
            TranscodeError::UnsupportedFormat
        );
    }

    #[test]
    fn truncated_input_is_a_decode_error() {
        let mut png = encoded(ImageFormat::Png);
        png.truncate(40);
        assert!(matches!(
            DecoderRegistry::standard().decode(&png),
            Err(TranscodeError::Decode { format: "png", .. })
        ));
    }

    #[test]
    fn limits_reject_oversized_canvas() {
        let mut r = DecoderRegistry::empty(DecodeLimits {
            max_width: 4,
            max_height: 4,
            max_alloc_bytes: 1024 * 1024,
        });
        r.register(Box::new(PngDecoder));
        assert!(matches!(
            r.decode(&encoded(ImageFormat::Png)),
            Err(TranscodeError::Decode { .. })
        ));
        assert_eq!(r.formats(), vec!["png"]);
    }
}
