//! Extractor trait and the outcome of one extraction.

use crate::embedding::Embedding;
use crate::error::Result;
use image::RgbImage;

/// Name, version and fusion weight of one configured extractor.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractorSpec {
    /// Extractor name.
    pub name: String,
    /// Version tag carried by every embedding it produces.
    pub version: String,
    /// Fusion weight.
    pub weight: f32,
}

impl ExtractorSpec {
    /// Create a spec.
    pub fn new(name: &str, version: &str, weight: f32) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            weight,
        }
    }
}

/// Turns a cropped detection image into an appearance vector.
///
/// Implementations must be deterministic for a given version and input.
/// The returned vector need not be normalized; a zero vector is treated as
/// a failure.
pub trait Extractor: Send + Sync {
    /// Extractor name.
    fn name(&self) -> &str;

    /// Version tag.
    fn version(&self) -> &str;

    /// Compute a raw vector for a crop.
    fn embed(&self, crop: &RgbImage) -> Result<Vec<f32>>;
}

/// Outcome of running one extractor for one detection.
#[derive(Debug, Clone, PartialEq)]
pub enum Extraction {
    /// A usable, normalized embedding.
    Vector(Embedding),
    /// The extractor is unavailable for this detection.
    Unavailable {
        /// Extractor name.
        extractor: String,
        /// Why no embedding was produced.
        reason: String,
    },
}
