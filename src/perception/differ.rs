//! Perceptual frame differencing.
//!
//! Two detectors with different cost/precision tradeoffs gate the paid
//! vision calls:
//! - a bit-string perceptual hash ("is this the same screen?") for accuracy
//!   before spending an API call, and
//! - an encoded-byte-length proxy ("did something huge just pop up?") cheap
//!   enough for a 1–5 second background poll. Only trustworthy for large
//!   deltas like a new dialog, never for small UI changes.
use serde::{Deserialize, Serialize};

/// Compact bit-string summary of a frame's coarse visual structure.
/// Stored as ASCII '0'/'1' so mismatched lengths are trivially detectable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn empty() -> Self {
        Self(String::new())
    }

    pub fn from_bits(bits: String) -> Self {
        Self(bits)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashStrategy {
    /// Downscale to 8×8, one bit per cell against the global mean. 64 bits.
    Coarse,
    /// Downscale to 32×32, mean per 4×4 block against the global mean.
    /// Still 64 bits, but each bit averages 16 samples, so small localized
    /// changes shift block means that a straight 8×8 downscale would blur away.
    Fine,
}

impl HashStrategy {
    pub fn from_name(name: &str) -> Self {
        match name {
            "fine" => Self::Fine,
            "coarse" => Self::Coarse,
            other => {
                tracing::warn!(strategy = other, "unknown hash strategy, using coarse");
                Self::Coarse
            }
        }
    }
}

pub struct FrameDiffer {
    strategy: HashStrategy,
}

impl FrameDiffer {
    pub fn new(strategy: HashStrategy) -> Self {
        Self { strategy }
    }

    /// Fingerprint an encoded frame. Undecodable input yields the empty
    /// fingerprint, which distances as maximal against anything. A bad
    /// frame reads as "changed" rather than silently skipping an update.
    pub fn fingerprint(&self, encoded: &[u8]) -> Fingerprint {
        let img = match image::load_from_memory(encoded) {
            Ok(img) => img,
            Err(e) => {
                tracing::warn!(error = %e, "frame undecodable, emitting empty fingerprint");
                return Fingerprint::empty();
            }
        };

        match self.strategy {
            HashStrategy::Coarse => hash_grid(&img, 8, 1),
            HashStrategy::Fine => hash_grid(&img, 32, 4),
        }
    }
}

/// Downscale to `grid`×`grid`, grayscale with luma weights, then emit one bit
/// per `block`×`block` cell: 1 if the block mean exceeds the global mean.
fn hash_grid(img: &image::DynamicImage, grid: u32, block: u32) -> Fingerprint {
    let small = img
        .resize_exact(grid, grid, image::imageops::FilterType::Triangle)
        .to_rgb8();

    let mut luma = vec![0f64; (grid * grid) as usize];
    for (i, px) in small.pixels().enumerate() {
        let [r, g, b] = px.0;
        luma[i] = 0.299 * r as f64 + 0.587 * g as f64 + 0.114 * b as f64;
    }
    let global_mean: f64 = luma.iter().sum::<f64>() / luma.len() as f64;

    let cells = grid / block;
    let mut bits = String::with_capacity((cells * cells) as usize);
    for by in 0..cells {
        for bx in 0..cells {
            let mut sum = 0f64;
            for dy in 0..block {
                for dx in 0..block {
                    let x = bx * block + dx;
                    let y = by * block + dy;
                    sum += luma[(y * grid + x) as usize];
                }
            }
            let block_mean = sum / (block * block) as f64;
            bits.push(if block_mean > global_mean { '1' } else { '0' });
        }
    }
    Fingerprint::from_bits(bits)
}

/// Hamming distance between two fingerprints. Empty or unequal-length inputs
/// return `u32::MAX` so the caller's threshold check always fires (fail open).
pub fn hamming_distance(a: &Fingerprint, b: &Fingerprint) -> u32 {
    if a.is_empty() || b.is_empty() || a.len() != b.len() {
        return u32::MAX;
    }
    a.as_str()
        .bytes()
        .zip(b.as_str().bytes())
        .filter(|(x, y)| x != y)
        .count() as u32
}

pub fn is_major_change(a: &Fingerprint, b: &Fingerprint, threshold: u32) -> bool {
    hamming_distance(a, b) > threshold
}

/// Cheap string-length proxy: absolute difference in serialized frame size.
/// A new dialog or popup changes the encoded size by tens of kilobytes;
/// cursor blinks and small repaints do not.
pub fn byte_delta_exceeds(prev_len: u64, next_len: u64, threshold: u64) -> bool {
    prev_len.abs_diff(next_len) > threshold
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png_of_color(w: u32, h: u32, rgb: [u8; 3]) -> Vec<u8> {
        let img = image::RgbImage::from_pixel(w, h, image::Rgb(rgb));
        let mut out = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Png)
            .unwrap();
        out
    }

    fn png_half_split(w: u32, h: u32) -> Vec<u8> {
        let mut img = image::RgbImage::from_pixel(w, h, image::Rgb([0, 0, 0]));
        for y in 0..h {
            for x in 0..w / 2 {
                img.put_pixel(x, y, image::Rgb([255, 255, 255]));
            }
        }
        let mut out = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Png)
            .unwrap();
        out
    }

    #[test]
    fn test_fingerprint_deterministic() {
        let differ = FrameDiffer::new(HashStrategy::Coarse);
        let png = png_half_split(64, 64);
        assert_eq!(differ.fingerprint(&png), differ.fingerprint(&png));
    }

    #[test]
    fn test_fingerprint_is_64_bits_for_both_strategies() {
        let png = png_half_split(64, 64);
        assert_eq!(FrameDiffer::new(HashStrategy::Coarse).fingerprint(&png).len(), 64);
        assert_eq!(FrameDiffer::new(HashStrategy::Fine).fingerprint(&png).len(), 64);
    }

    #[test]
    fn test_distance_symmetric() {
        let differ = FrameDiffer::new(HashStrategy::Fine);
        let a = differ.fingerprint(&png_half_split(64, 64));
        let b = differ.fingerprint(&png_of_color(64, 64, [200, 200, 200]));
        assert_eq!(hamming_distance(&a, &b), hamming_distance(&b, &a));
    }

    #[test]
    fn test_identical_frames_distance_zero() {
        let differ = FrameDiffer::new(HashStrategy::Coarse);
        let png = png_half_split(64, 64);
        let a = differ.fingerprint(&png);
        let b = differ.fingerprint(&png);
        assert_eq!(hamming_distance(&a, &b), 0);
    }

    #[test]
    fn test_max_distance_on_empty_or_mismatch() {
        let a = Fingerprint::from_bits("0101".into());
        let b = Fingerprint::from_bits("010101".into());
        assert_eq!(hamming_distance(&a, &b), u32::MAX);
        assert_eq!(hamming_distance(&a, &Fingerprint::empty()), u32::MAX);
        assert_eq!(hamming_distance(&Fingerprint::empty(), &Fingerprint::empty()), u32::MAX);
    }

    #[test]
    fn test_undecodable_frame_reads_as_changed() {
        let differ = FrameDiffer::new(HashStrategy::Coarse);
        let garbage = differ.fingerprint(b"not a png");
        assert!(garbage.is_empty());
        let real = differ.fingerprint(&png_half_split(64, 64));
        assert!(is_major_change(&garbage, &real, 10));
    }

    #[test]
    fn test_layout_change_exceeds_threshold() {
        let differ = FrameDiffer::new(HashStrategy::Coarse);
        let a = differ.fingerprint(&png_half_split(64, 64));
        let b = differ.fingerprint(&png_of_color(64, 64, [10, 10, 10]));
        assert!(hamming_distance(&a, &b) > 10);
    }

    #[test]
    fn test_byte_delta_thresholds() {
        assert!(!byte_delta_exceeds(50_000, 50_200, 12_288));
        assert!(byte_delta_exceeds(50_000, 70_000, 12_288));
        // symmetric in direction
        assert!(byte_delta_exceeds(70_000, 50_000, 12_288));
    }
}
