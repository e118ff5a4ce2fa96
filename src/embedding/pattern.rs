//! Coat-pattern descriptor.
//!
//! A handcrafted, network-free modality: the crop is resized to a fixed
//! grid and each cell contributes a histogram of gradient orientations
//! weighted by gradient magnitude. Stripes, spots and rosettes dominate
//! the descriptor while flat background contributes little.

use crate::constants::extractor::{PATTERN_BINS, PATTERN_CELL, PATTERN_GRID};
use crate::embedding::Extractor;
use crate::error::{Error, Result};
use image::imageops::{self, FilterType};
use image::{GrayImage, RgbImage};
use std::f32::consts::PI;

/// Crops smaller than this on either side carry no usable pattern.
const MIN_CROP_SIDE: u32 = 8;

/// Gradient-orientation histogram extractor.
#[derive(Debug, Clone)]
pub struct CoatPatternExtractor {
    name: String,
    version: String,
}

impl CoatPatternExtractor {
    /// Create an extractor with a name and version tag.
    pub fn new(name: &str, version: &str) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
        }
    }

    /// Descriptor length.
    pub const fn dimension() -> usize {
        (PATTERN_GRID * PATTERN_GRID) as usize * PATTERN_BINS
    }
}

impl Extractor for CoatPatternExtractor {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn embed(&self, crop: &RgbImage) -> Result<Vec<f32>> {
        if crop.width() < MIN_CROP_SIDE || crop.height() < MIN_CROP_SIDE {
            return Err(Error::Extraction {
                extractor: self.name.clone(),
                reason: format!(
                    "crop {}x{} is smaller than {MIN_CROP_SIDE}x{MIN_CROP_SIDE}",
                    crop.width(),
                    crop.height()
                ),
            });
        }

        let side = PATTERN_GRID * PATTERN_CELL;
        let gray = imageops::grayscale(crop);
        let gray = imageops::resize(&gray, side, side, FilterType::Triangle);

        let descriptor = orientation_histograms(&gray);
        if descriptor.iter().all(|v| *v <= f32::EPSILON) {
            return Err(Error::Extraction {
                extractor: self.name.clone(),
                reason: "crop has no texture".to_string(),
            });
        }
        Ok(descriptor)
    }
}

/// Per-cell orientation histograms, each cell L2-normalized.
fn orientation_histograms(gray: &GrayImage) -> Vec<f32> {
    let (width, height) = gray.dimensions();
    let mut cells = vec![0.0f32; CoatPatternExtractor::dimension()];

    let pixel = |x: u32, y: u32| f32::from(gray.get_pixel(x, y)[0]);

    for y in 0..height {
        for x in 0..width {
            let gx = pixel((x + 1).min(width - 1), y) - pixel(x.saturating_sub(1), y);
            let gy = pixel(x, (y + 1).min(height - 1)) - pixel(x, y.saturating_sub(1));
            let magnitude = gx.hypot(gy);
            if magnitude <= f32::EPSILON {
                continue;
            }

            // Unsigned orientation in [0, PI).
            let angle = gy.atan2(gx).rem_euclid(PI);
            #[allow(
                clippy::cast_possible_truncation,
                clippy::cast_sign_loss,
                clippy::cast_precision_loss
            )]
            let bin = ((angle / PI * PATTERN_BINS as f32) as usize).min(PATTERN_BINS - 1);

            let cell = (y / PATTERN_CELL) * PATTERN_GRID + x / PATTERN_CELL;
            cells[cell as usize * PATTERN_BINS + bin] += magnitude;
        }
    }

    for cell in cells.chunks_mut(PATTERN_BINS) {
        let norm = cell.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for v in cell {
                *v /= norm;
            }
        }
    }
    cells
}
