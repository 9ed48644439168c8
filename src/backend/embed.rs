use std::path::Path;

use image::ImageError;

use super::{EmbedError, FeatureExtractor};

/// Joint RGB color-histogram embedding.
///
/// Deterministic, runtime-free stand-in for a neural feature extractor: for
/// diversity sampling only the relative spread of the vectors matters, and a
/// normalized color distribution separates visually dissimilar photos well
/// enough to spread a labeling batch.
pub struct HistogramExtractor {
    bits: u32,
}

impl HistogramExtractor {
    /// `bits` per channel; the embedding has `2^(3*bits)` dimensions.
    pub fn new(bits: u32) -> Self {
        assert!((1..=8).contains(&bits));
        Self { bits }
    }
}

impl Default for HistogramExtractor {
    fn default() -> Self {
        // 8 bins per channel, 512 dimensions.
        Self::new(3)
    }
}

impl FeatureExtractor for HistogramExtractor {
    fn embed(&self, path: &Path) -> Result<Vec<f32>, EmbedError> {
        let img = image::open(path).map_err(|e| match e {
            ImageError::IoError(source) => EmbedError::Io { path: path.to_path_buf(), source },
            _ => EmbedError::Unreadable { path: path.to_path_buf() },
        })?;
        let rgb = img.to_rgb8();

        let shift = 8 - self.bits;
        let mut hist = vec![0f32; 1 << (3 * self.bits)];
        for pixel in rgb.pixels() {
            let [r, g, b] = pixel.0;
            let index = (((r >> shift) as usize) << (2 * self.bits))
                | (((g >> shift) as usize) << self.bits)
                | ((b >> shift) as usize);
            hist[index] += 1.0;
        }

        let total = (rgb.width() * rgb.height()) as f32;
        if total > 0.0 {
            for v in &mut hist {
                *v /= total;
            }
        }
        Ok(hist)
    }
}
