//! Embedding vectors and the math used to compare them.

use serde::{Deserialize, Serialize};

/// A fixed-length appearance vector tagged with the extractor that produced it.
///
/// Vectors are stored L2-normalized. Two embeddings are only comparable when
/// both extractor name and version agree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    /// Extractor name.
    pub extractor: String,
    /// Extractor version tag.
    pub version: String,
    /// L2-normalized vector.
    pub vector: Vec<f32>,
}

impl Embedding {
    /// Build an embedding, normalizing the vector.
    ///
    /// Returns `None` for empty, non-finite or all-zero vectors: a zero vector
    /// is never a valid embedding.
    pub fn new(extractor: &str, version: &str, vector: Vec<f32>) -> Option<Self> {
        let vector = l2_normalize(vector)?;
        Some(Self {
            extractor: extractor.to_string(),
            version: version.to_string(),
            vector,
        })
    }

    /// Whether this embedding was produced by the given extractor version.
    pub fn is_from(&self, extractor: &str, version: &str) -> bool {
        self.extractor == extractor && self.version == version
    }

    /// Vector dimension.
    pub fn dimension(&self) -> usize {
        self.vector.len()
    }
}

/// Normalize a vector to unit L2 length.
pub fn l2_normalize(mut vector: Vec<f32>) -> Option<Vec<f32>> {
    if vector.is_empty() || vector.iter().any(|v| !v.is_finite()) {
        return None;
    }

    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm <= f32::EPSILON {
        return None;
    }

    for v in &mut vector {
        *v /= norm;
    }
    Some(vector)
}

/// Cosine similarity between two vectors.
///
/// Returns `None` when the dimensions differ or either vector has zero length.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom <= f32::EPSILON {
        return None;
    }
    Some((dot / denom).clamp(-1.0, 1.0))
}

/// Blend a new sample into a running representative vector.
///
/// The sample weight is `max(1 / (samples + 1), min_weight)` where `samples`
/// counts the vectors already folded into `running`. The result is
/// re-normalized, so the cost is O(dimension) regardless of how many
/// sightings the identity has.
pub fn blend(running: &[f32], sample: &[f32], samples: u64, min_weight: f32) -> Option<Vec<f32>> {
    if running.len() != sample.len() {
        return None;
    }

    #[allow(clippy::cast_precision_loss)]
    let alpha = (1.0 / (samples as f32 + 1.0)).max(min_weight).min(1.0);
    weighted_mean(running, sample, alpha)
}

/// Weighted mean of two vectors, `(1 - w) * a + w * b`, re-normalized.
pub fn weighted_mean(a: &[f32], b: &[f32], w: f32) -> Option<Vec<f32>> {
    if a.len() != b.len() {
        return None;
    }
    let w = w.clamp(0.0, 1.0);
    l2_normalize(
        a.iter()
            .zip(b)
            .map(|(x, y)| (1.0 - w).mul_add(*x, w * y))
            .collect(),
    )
}
