//! Weighted similarity fusion.

use crate::embedding::ExtractorSpec;
use std::collections::BTreeMap;

/// Fused score of one detection/candidate pair.
#[derive(Debug, Clone, PartialEq)]
pub struct Fused {
    /// Weighted mean of clamped similarities over available extractors.
    pub score: f32,
    /// Clamped similarity per extractor that contributed.
    pub breakdown: BTreeMap<String, f32>,
}

/// Fuse per-extractor similarities into one score.
///
/// `similarity` returns the raw cosine for an extractor, or `None` when
/// either side has no comparable vector. Negative similarities clamp to
/// zero and weights are re-normalized over the extractors that produced a
/// value, so a single available extractor yields exactly its similarity.
/// Returns `None` when no extractor is available for the pair.
pub fn fuse(
    specs: &[ExtractorSpec],
    similarity: impl Fn(&ExtractorSpec) -> Option<f32>,
) -> Option<Fused> {
    let mut weighted = 0.0f32;
    let mut total_weight = 0.0f32;
    let mut breakdown = BTreeMap::new();

    for spec in specs {
        let Some(raw) = similarity(spec) else {
            continue;
        };
        let clamped = raw.clamp(0.0, 1.0);
        weighted += spec.weight * clamped;
        total_weight += spec.weight;
        breakdown.insert(spec.name.clone(), clamped);
    }

    if total_weight <= 0.0 {
        return None;
    }

    Some(Fused {
        score: weighted / total_weight,
        breakdown,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;

    fn specs() -> Vec<ExtractorSpec> {
        vec![
            ExtractorSpec::new("body", "v1", 0.6),
            ExtractorSpec::new("head", "v1", 0.3),
            ExtractorSpec::new("coat", "v1", 0.1),
        ]
    }

    #[test]
    fn test_weighted_mean() {
        let fused = fuse(&specs(), |s| match s.name.as_str() {
            "body" => Some(0.9),
            "head" => Some(0.6),
            _ => Some(0.3),
        })
        .unwrap();
        let expected = 0.6f32.mul_add(0.9, 0.3f32.mul_add(0.6, 0.1 * 0.3));
        assert!((fused.score - expected).abs() < 1e-6);
        assert_eq!(fused.breakdown.len(), 3);
    }

    #[test]
    fn test_single_available_extractor_equals_its_similarity() {
        let fused = fuse(&specs(), |s| (s.name == "head").then_some(0.83)).unwrap();
        assert_eq!(fused.score, 0.83);
        assert_eq!(fused.breakdown.keys().collect::<Vec<_>>(), vec!["head"]);
    }

    #[test]
    fn test_negative_similarity_clamps_to_zero() {
        let fused = fuse(&specs(), |s| match s.name.as_str() {
            "body" => Some(-0.8),
            "head" => Some(0.9),
            _ => None,
        })
        .unwrap();
        let expected = 0.3 * 0.9 / 0.9;
        assert!((fused.score - expected).abs() < 1e-6);
        assert_eq!(fused.breakdown["body"], 0.0);
    }

    #[test]
    fn test_no_available_extractor() {
        assert!(fuse(&specs(), |_| None).is_none());
    }

    #[test]
    fn test_fusion_is_deterministic() {
        let sim = |s: &ExtractorSpec| Some(s.weight * 1.3);
        assert_eq!(fuse(&specs(), sim), fuse(&specs(), sim));
    }
}
