//! Shortlisting and scoring registry candidates for one detection.

use crate::embedding::cosine_similarity;
use crate::fusion::{Scored, category, fuse, rank};
use crate::registry::{Detection, IdentityId, RegistryState, SightingPolicy};
use crate::season::{SeasonScope, archive};
use std::collections::{BTreeSet, HashSet};

/// Score every gated candidate for a detection, best first.
///
/// Each season-invariant embedding the detection carries queries the index
/// for its top `shortlist` neighbours; the union is then scored with every
/// available extractor. Seasonal trait vectors are compared only against
/// the candidate's record for the detection's own season tag.
///
/// Returns `None` when the detection has no embedding that can query the
/// index.
pub fn score_candidates(
    state: &RegistryState,
    policy: &SightingPolicy,
    detection: &Detection,
    shortlist: usize,
) -> Option<Vec<Scored>> {
    let scope = policy.scope(detection);
    let exclude: HashSet<IdentityId> = detection.rejected.iter().copied().collect();

    let mut queried = false;
    let mut ids = BTreeSet::new();
    for spec in &policy.specs {
        if SeasonScope::routes(scope.as_ref(), &spec.name) {
            continue;
        }
        let Some(embedding) = detection.embedding(&spec.name, &spec.version) else {
            continue;
        };
        queried = true;
        for hit in state.index.search(
            &spec.name,
            &spec.version,
            &detection.category,
            &embedding.vector,
            shortlist,
            &exclude,
        ) {
            ids.insert(hit.identity);
        }
    }
    if !queried {
        return None;
    }

    let mut scored: Vec<Scored> = ids
        .into_iter()
        .filter_map(|id| state.identities.get(&id))
        .filter(|identity| !identity.quarantined)
        .filter(|identity| category::compatible(&detection.category, &identity.category))
        .filter_map(|identity| {
            let fused = fuse(&policy.specs, |spec| {
                let embedding = detection.embedding(&spec.name, &spec.version)?;
                let stored = match scope.as_ref() {
                    Some(scope) if scope.extractor == spec.name => {
                        archive::trait_vector(state, identity.id, scope)?
                    }
                    _ => identity.vector(&spec.name, &spec.version)?,
                };
                cosine_similarity(&embedding.vector, stored)
            })?;
            Some(Scored {
                identity: identity.id,
                score: fused.score,
                sightings: identity.sightings,
                breakdown: fused.breakdown,
            })
        })
        .collect();

    rank(&mut scored);
    Some(scored)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use crate::config::SeasonalConfig;
    use crate::embedding::{Embedding, ExtractorSpec};
    use crate::registry::sighting;
    use crate::registry::{
        AgeClass, BoundingBox, Category, DetectionId, DetectionState, Mutation, Sex,
    };
    use chrono::{TimeZone, Utc};
    use std::path::PathBuf;

    fn policy() -> SightingPolicy {
        let seasonal = SeasonalConfig {
            extractor: Some("antler".to_string()),
            species: vec!["red_deer".to_string()],
            ..SeasonalConfig::default()
        };
        SightingPolicy::new(
            vec![
                ExtractorSpec::new("body", "v1", 0.6),
                ExtractorSpec::new("coat", "v1", 0.2),
                ExtractorSpec::new("antler", "v1", 0.2),
            ],
            seasonal,
            0.05,
        )
    }

    fn detection(id: u64, species: &str, sex: Sex, month: u32) -> Detection {
        Detection {
            id: DetectionId(id),
            image: PathBuf::from("img.jpg"),
            crop: PathBuf::from("crop.jpg"),
            bbox: BoundingBox {
                x1: 0.0,
                y1: 0.0,
                x2: 1.0,
                y2: 1.0,
            },
            category: Category {
                species: species.to_string(),
                sex,
                age: AgeClass::Adult,
            },
            confidence: 0.9,
            timestamp: Utc.with_ymd_and_hms(2024, month, 5, 12, 0, 0).unwrap(),
            camera: "cam-1".to_string(),
            viewpoint: None,
            embeddings: vec![
                Embedding::new("body", "v1", vec![1.0, 0.0, 0.0]).unwrap(),
                Embedding::new("coat", "v1", vec![0.0, 1.0, 0.0]).unwrap(),
                Embedding::new("antler", "v1", vec![0.0, 0.0, 1.0]).unwrap(),
            ],
            state: DetectionState::Embedded,
            assignment: None,
            review: Vec::new(),
            candidates: Vec::new(),
            linked_to: None,
            rejected: Vec::new(),
            last_error: None,
            attempts: 0,
        }
    }

    fn seeded(detections: &[(u64, Detection)]) -> RegistryState {
        let mut state = RegistryState::default();
        let policy = policy();
        for (id, d) in detections {
            for m in sighting::seed(IdentityId(*id), d, &policy) {
                state.apply(m);
            }
        }
        state
    }

    #[test]
    fn test_identical_candidate_scores_one() {
        let state = seeded(&[(1, detection(1, "lynx", Sex::Male, 3))]);
        let scored =
            score_candidates(&state, &policy(), &detection(2, "lynx", Sex::Male, 3), 10).unwrap();
        assert_eq!(scored.len(), 1);
        assert!((scored[0].score - 1.0).abs() < 1e-6);
        assert_eq!(scored[0].breakdown.len(), 3);
    }

    #[test]
    fn test_category_gating_is_hard() {
        let state = seeded(&[
            (1, detection(1, "lynx", Sex::Female, 3)),
            (2, detection(2, "wolf", Sex::Male, 3)),
            (3, detection(3, "lynx", Sex::Unknown, 3)),
        ]);
        let scored =
            score_candidates(&state, &policy(), &detection(4, "lynx", Sex::Male, 3), 10).unwrap();
        let ids: Vec<_> = scored.iter().map(|s| s.identity).collect();
        assert_eq!(ids, vec![IdentityId(3)]);
    }

    #[test]
    fn test_rejected_and_quarantined_are_excluded() {
        let mut state = seeded(&[
            (1, detection(1, "lynx", Sex::Male, 3)),
            (2, detection(2, "lynx", Sex::Male, 3)),
        ]);
        let mut quarantined = state.identities[&IdentityId(2)].clone();
        quarantined.quarantined = true;
        state.apply(Mutation::identity(quarantined));

        let mut d = detection(3, "lynx", Sex::Male, 3);
        assert_eq!(score_candidates(&state, &policy(), &d, 10).unwrap().len(), 1);
        d.rejected.push(IdentityId(1));
        assert!(score_candidates(&state, &policy(), &d, 10).unwrap().is_empty());
    }

    #[test]
    fn test_missing_extractor_uses_single_similarity() {
        let state = seeded(&[(1, detection(1, "lynx", Sex::Male, 3))]);
        let mut d = detection(2, "lynx", Sex::Male, 3);
        d.embeddings = vec![Embedding::new("coat", "v1", vec![0.0, 0.6, 0.8]).unwrap()];
        let scored = score_candidates(&state, &policy(), &d, 10).unwrap();
        assert!((scored[0].score - 0.6).abs() < 1e-6);
        assert_eq!(scored[0].breakdown.keys().collect::<Vec<_>>(), vec!["coat"]);
    }

    #[test]
    fn test_seasonal_trait_scoped_to_current_season() {
        let state = seeded(&[(1, detection(1, "red_deer", Sex::Male, 3))]);

        let same_season =
            score_candidates(&state, &policy(), &detection(2, "red_deer", Sex::Male, 4), 10)
                .unwrap();
        assert!(same_season[0].breakdown.contains_key("antler"));

        let other_season =
            score_candidates(&state, &policy(), &detection(3, "red_deer", Sex::Male, 9), 10)
                .unwrap();
        assert_eq!(other_season.len(), 1);
        assert!(!other_season[0].breakdown.contains_key("antler"));
        assert!((other_season[0].score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_no_query_embedding() {
        let state = seeded(&[(1, detection(1, "red_deer", Sex::Male, 3))]);
        let mut d = detection(2, "red_deer", Sex::Male, 3);
        d.embeddings.retain(|e| e.extractor == "antler");
        assert!(score_candidates(&state, &policy(), &d, 10).is_none());
    }

    #[test]
    fn test_empty_registry_yields_no_candidates() {
        let state = RegistryState::default();
        let scored =
            score_candidates(&state, &policy(), &detection(1, "lynx", Sex::Male, 3), 10).unwrap();
        assert!(scored.is_empty());
    }
}
