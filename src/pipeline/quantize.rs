//! Colour reduction to an indexed palette of at most 256 entries.
//!
//! ## Algorithm
//!
//! 1. Build a histogram of the distinct colours. If there are no more
//!    distinct colours than palette slots, they become the palette as-is.
//! 2. Otherwise run median cut: start with one box holding every colour,
//!    repeatedly split the box with the widest channel extent at the
//!    pixel-weighted median of that channel, until the palette budget is
//!    reached or no box can be split.
//! 3. Each box contributes its pixel-weighted mean colour.
//! 4. Pixels map to the nearest palette entry (squared RGB distance). With
//!    dithering on, a 4×4 Bayer threshold is added before the lookup.
//!
//! Every step is deterministic: the histogram is sorted, ties between
//! boxes go to the lower index, and ties between palette entries go to the
//! lower index. Identical input always yields an identical palette and
//! identical indices.

use image::RgbImage;
use std::collections::HashMap;

/// An image expressed as palette indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedImage {
    pub width: u32,
    pub height: u32,
    pub palette: Vec<[u8; 3]>,
    /// One index per pixel, row-major.
    pub indices: Vec<u8>,
}

impl IndexedImage {
    /// Palette flattened to `r, g, b, r, g, b, …` as GIF expects.
    pub fn palette_bytes(&self) -> Vec<u8> {
        self.palette.iter().flatten().copied().collect()
    }
}

const BAYER_4X4: [[u8; 4]; 4] = [[0, 8, 2, 10], [12, 4, 14, 6], [3, 11, 1, 9], [15, 7, 13, 5]];

#[derive(Debug, Clone, Copy)]
struct ColorBox {
    /// Range into the shared, per-box-sorted histogram.
    start: usize,
    end: usize,
}

/// Reduce `img` to at most `max_colors` colours (clamped to 1–256).
pub fn quantize(img: &RgbImage, max_colors: usize, dither: bool) -> IndexedImage {
    let max_colors = max_colors.clamp(1, 256);
    let histogram = histogram(img);

    let palette = if histogram.len() <= max_colors {
        histogram.iter().map(|(c, _)| *c).collect()
    } else {
        median_cut(histogram, max_colors)
    };

    let indices = if dither && palette.len() > 1 {
        map_dithered(img, &palette)
    } else {
        map_nearest(img, &palette)
    };

    IndexedImage {
        width: img.width(),
        height: img.height(),
        palette,
        indices,
    }
}

/// Distinct colours with their pixel counts, sorted by colour.
fn histogram(img: &RgbImage) -> Vec<([u8; 3], u32)> {
    let mut counts: HashMap<[u8; 3], u32> = HashMap::new();
    for p in img.pixels() {
        *counts.entry(p.0).or_insert(0) += 1;
    }
    let mut entries: Vec<_> = counts.into_iter().collect();
    entries.sort_unstable_by_key(|(c, _)| *c);
    entries
}

fn channel_extent(entries: &[([u8; 3], u32)]) -> (usize, u8) {
    let mut lo = [u8::MAX; 3];
    let mut hi = [u8::MIN; 3];
    for (c, _) in entries {
        for ch in 0..3 {
            lo[ch] = lo[ch].min(c[ch]);
            hi[ch] = hi[ch].max(c[ch]);
        }
    }
    let mut best = (0, 0);
    for ch in 0..3 {
        let range = hi[ch] - lo[ch];
        if range > best.1 {
            best = (ch, range);
        }
    }
    best
}

fn median_cut(mut entries: Vec<([u8; 3], u32)>, max_colors: usize) -> Vec<[u8; 3]> {
    let mut boxes = vec![ColorBox {
        start: 0,
        end: entries.len(),
    }];

    while boxes.len() < max_colors {
        // Widest box first; ties resolved by lowest index.
        let mut pick: Option<(usize, usize, u8)> = None;
        for (i, b) in boxes.iter().enumerate() {
            if b.end - b.start < 2 {
                continue;
            }
            let (ch, range) = channel_extent(&entries[b.start..b.end]);
            if range > 0 && pick.is_none_or(|(_, _, best)| range > best) {
                pick = Some((i, ch, range));
            }
        }
        let Some((i, ch, _)) = pick else {
            break;
        };

        let b = boxes[i];
        let slice = &mut entries[b.start..b.end];
        slice.sort_unstable_by_key(|(c, _)| (c[ch], *c));

        let total: u64 = slice.iter().map(|(_, n)| u64::from(*n)).sum();
        let mut acc = 0u64;
        let mut split = slice.len() / 2;
        for (k, (_, n)) in slice.iter().enumerate() {
            acc += u64::from(*n);
            if acc * 2 >= total {
                split = k + 1;
                break;
            }
        }
        let split = split.clamp(1, slice.len() - 1);

        boxes[i] = ColorBox {
            start: b.start,
            end: b.start + split,
        };
        boxes.insert(
            i + 1,
            ColorBox {
                start: b.start + split,
                end: b.end,
            },
        );
    }

    boxes
        .iter()
        .map(|b| weighted_mean(&entries[b.start..b.end]))
        .collect()
}

fn weighted_mean(entries: &[([u8; 3], u32)]) -> [u8; 3] {
    let mut sum = [0u64; 3];
    let mut total = 0u64;
    for (c, n) in entries {
        let n = u64::from(*n);
        for ch in 0..3 {
            sum[ch] += u64::from(c[ch]) * n;
        }
        total += n;
    }
    if total == 0 {
        return [0, 0, 0];
    }
    [
        ((sum[0] + total / 2) / total) as u8,
        ((sum[1] + total / 2) / total) as u8,
        ((sum[2] + total / 2) / total) as u8,
    ]
}

fn nearest(palette: &[[u8; 3]], c: [u8; 3]) -> u8 {
    let mut best = 0usize;
    let mut best_dist = u32::MAX;
    for (i, p) in palette.iter().enumerate() {
        let d: u32 = (0..3)
            .map(|ch| {
                let diff = i32::from(p[ch]) - i32::from(c[ch]);
                (diff * diff) as u32
            })
            .sum();
        if d < best_dist {
            best = i;
            best_dist = d;
            if d == 0 {
                break;
            }
        }
    }
    best as u8
}

fn map_nearest(img: &RgbImage, palette: &[[u8; 3]]) -> Vec<u8> {
    let mut memo: HashMap<[u8; 3], u8> = HashMap::new();
    img.pixels()
        .map(|p| *memo.entry(p.0).or_insert_with(|| nearest(palette, p.0)))
        .collect()
}

fn map_dithered(img: &RgbImage, palette: &[[u8; 3]]) -> Vec<u8> {
    // Threshold amplitude shrinks as the palette grows.
    let spread = (256.0 / (palette.len() as f32).cbrt()).min(64.0);
    let mut memo: HashMap<[u8; 3], u8> = HashMap::new();
    let mut out = Vec::with_capacity((img.width() * img.height()) as usize);
    for (x, y, p) in img.enumerate_pixels() {
        let threshold = f32::from(BAYER_4X4[(y % 4) as usize][(x % 4) as usize]) / 16.0 - 0.5;
        let offset = (threshold * spread).round() as i16;
        let shifted = [
            (i16::from(p.0[0]) + offset).clamp(0, 255) as u8,
            (i16::from(p.0[1]) + offset).clamp(0, 255) as u8,
            (i16::from(p.0[2]) + offset).clamp(0, 255) as u8,
        ];
        out.push(*memo.entry(shifted).or_insert_with(|| nearest(palette, shifted)));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};

    fn gradient(w: u32, h: u32) -> RgbImage {
        ImageBuffer::from_fn(w, h, |x, y| {
            Rgb([(x * 255 / w) as u8, (y * 255 / h) as u8, ((x + y) % 256) as u8])
        })
    }

    #[test]
    fn few_colours_are_kept_exactly() {
        let img: RgbImage = ImageBuffer::from_fn(4, 4, |x, _| {
            if x < 2 {
                Rgb([255, 0, 0])
            } else {
                Rgb([0, 0, 255])
            }
        });
        let q = quantize(&img, 256, false);
        assert_eq!(q.palette, vec![[0, 0, 255], [255, 0, 0]]);
        assert_eq!(q.indices[0], 1);
        assert_eq!(q.indices[3], 0);
    }

    #[test]
    fn palette_never_exceeds_budget() {
        let img = gradient(64, 48);
        for budget in [2usize, 16, 256] {
            let q = quantize(&img, budget, false);
            assert!(q.palette.len() <= budget, "{} > {}", q.palette.len(), budget);
            assert!(q.indices.iter().all(|&i| (i as usize) < q.palette.len()));
            assert_eq!(q.indices.len(), 64 * 48);
        }
    }

    #[test]
    fn budget_above_256_is_clamped() {
        let q = quantize(&gradient(80, 80), 10_000, false);
        assert!(q.palette.len() <= 256);
    }

    #[test]
    fn deterministic_with_and_without_dither() {
        let img = gradient(50, 30);
        assert_eq!(quantize(&img, 32, false), quantize(&img, 32, false));
        assert_eq!(quantize(&img, 32, true), quantize(&img, 32, true));
    }

    #[test]
    fn dithering_changes_indices_but_not_palette() {
        let img = gradient(32, 32);
        let plain = quantize(&img, 4, false);
        let dithered = quantize(&img, 4, true);
        assert_eq!(plain.palette, dithered.palette);
        assert_ne!(plain.indices, dithered.indices);
    }

    #[test]
    fn median_cut_separates_distinct_clusters() {
        let img: RgbImage = ImageBuffer::from_fn(20, 10, |x, y| {
            let jitter = ((x + y) % 3) as u8;
            if x < 10 {
                Rgb([10 + jitter, 10, 10])
            } else {
                Rgb([240 - jitter, 240, 240])
            }
        });
        let q = quantize(&img, 2, false);
        assert_eq!(q.palette.len(), 2);
        assert_ne!(q.indices[0], q.indices[19]);
    }
}
