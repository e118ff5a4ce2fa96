//! Folding a detection into an identity.
//!
//! Both automatic matching and manual assignment go through these helpers
//! so the running embedding, activity summary and seasonal archive are
//! updated the same way regardless of who made the decision.

use crate::config::SeasonalConfig;
use crate::embedding::{ExtractorSpec, blend};
use crate::registry::{
    Detection, Identity, IdentityId, Mutation, RegistryState, Sex, StoredEmbedding,
};
use crate::season::{SeasonCalendar, SeasonScope, archive};

/// Everything needed to fold sightings consistently.
#[derive(Debug, Clone)]
pub struct SightingPolicy {
    /// Configured extractors in fusion order.
    pub specs: Vec<ExtractorSpec>,
    /// Seasonal archive settings.
    pub seasonal: SeasonalConfig,
    /// Calendar derived from the seasonal settings.
    pub calendar: SeasonCalendar,
    /// Floor for the weight of a new sample.
    pub min_blend_weight: f32,
}

impl SightingPolicy {
    /// Build a policy.
    pub fn new(
        specs: Vec<ExtractorSpec>,
        seasonal: SeasonalConfig,
        min_blend_weight: f32,
    ) -> Self {
        let calendar = SeasonCalendar::new(&seasonal.periods);
        Self {
            specs,
            seasonal,
            calendar,
            min_blend_weight,
        }
    }

    /// Primary extractor spec.
    pub fn primary(&self) -> Option<&ExtractorSpec> {
        self.specs.first()
    }

    /// Seasonal scope of a detection.
    pub fn scope(&self, detection: &Detection) -> Option<SeasonScope> {
        SeasonScope::for_detection(&self.seasonal, &self.calendar, &self.specs, detection)
    }

    /// Whether the detection carries the primary embedding at the
    /// configured version, which seeding requires.
    pub fn can_seed(&self, detection: &Detection) -> bool {
        self.primary()
            .is_some_and(|p| detection.embedding(&p.name, &p.version).is_some())
    }
}

/// Mutations seeding a new identity from a detection.
///
/// Seasonal trait vectors go to the archive, not onto the identity.
pub fn seed(id: IdentityId, detection: &Detection, policy: &SightingPolicy) -> Vec<Mutation> {
    let scope = policy.scope(detection);
    let mut identity = Identity::seed(id, detection);
    identity
        .embeddings
        .retain(|name, _| !SeasonScope::routes(scope.as_ref(), name));

    let mut mutations = vec![Mutation::identity(identity)];
    if let Some(scope) = scope
        && let Some(record) =
            archive::observe(None, id, detection, &scope, policy.min_blend_weight)
    {
        mutations.push(Mutation::seasonal(record));
    }
    mutations
}

/// Mutations adding one sighting of `detection` to an existing identity.
pub fn join(
    state: &RegistryState,
    identity: &Identity,
    detection: &Detection,
    policy: &SightingPolicy,
) -> Vec<Mutation> {
    let scope = policy.scope(detection);
    let mut updated = identity.clone();

    for embedding in &detection.embeddings {
        if SeasonScope::routes(scope.as_ref(), &embedding.extractor) {
            continue;
        }
        let entry = updated.embeddings.get(&embedding.extractor);
        let next = match entry {
            Some(stored) if stored.version == embedding.version => StoredEmbedding {
                version: stored.version.clone(),
                vector: blend(
                    &stored.vector,
                    &embedding.vector,
                    stored.samples,
                    policy.min_blend_weight,
                )
                .unwrap_or_else(|| stored.vector.clone()),
                samples: stored.samples + 1,
            },
            // A newer extractor version replaces the stale vector.
            _ => StoredEmbedding {
                version: embedding.version.clone(),
                vector: embedding.vector.clone(),
                samples: 1,
            },
        };
        updated.embeddings.insert(embedding.extractor.clone(), next);
    }

    if updated.category.sex == Sex::Unknown {
        updated.category.sex = detection.category.sex;
    }
    updated.sightings += 1;
    updated.extend_span(detection.timestamp);
    updated.activity.record(&detection.camera, detection.timestamp);
    updated.offer_exemplar(detection);

    let mut mutations = vec![Mutation::identity(updated)];
    if let Some(scope) = scope {
        let existing = archive::lookup(state, identity.id, &scope.tag);
        if let Some(record) = archive::observe(
            existing,
            identity.id,
            detection,
            &scope,
            policy.min_blend_weight,
        ) {
            mutations.push(Mutation::seasonal(record));
        }
    }
    mutations
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::embedding::Embedding;
    use crate::registry::{
        AgeClass, BoundingBox, Category, DetectionId, DetectionState, SeasonalTrait,
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
                ExtractorSpec::new("body", "v1", 0.7),
                ExtractorSpec::new("antler", "v1", 0.3),
            ],
            seasonal,
            0.05,
        )
    }

    fn detection(id: u64, species: &str, month: u32) -> Detection {
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
                sex: Sex::Male,
                age: AgeClass::Adult,
            },
            confidence: 0.9,
            timestamp: Utc.with_ymd_and_hms(2024, month, 5, 12, 0, 0).unwrap(),
            camera: "cam-1".to_string(),
            viewpoint: None,
            embeddings: vec![
                Embedding::new("body", "v1", vec![1.0, 0.0]).unwrap(),
                Embedding::new("antler", "v1", vec![0.0, 1.0]).unwrap(),
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

    fn apply(state: &mut RegistryState, mutations: Vec<Mutation>) {
        for m in mutations {
            state.apply(m);
        }
    }

    #[test]
    fn test_seed_routes_seasonal_vector_to_archive() {
        let mut state = RegistryState::default();
        apply(
            &mut state,
            seed(IdentityId(1), &detection(1, "red_deer", 3), &policy()),
        );

        let identity = &state.identities[&IdentityId(1)];
        assert!(identity.embeddings.contains_key("body"));
        assert!(!identity.embeddings.contains_key("antler"));
        let record: &SeasonalTrait = archive::lookup(&state, IdentityId(1), "2024-early").unwrap();
        assert_eq!(record.sightings, 1);
    }

    #[test]
    fn test_seed_keeps_all_vectors_for_other_species() {
        let mut state = RegistryState::default();
        apply(
            &mut state,
            seed(IdentityId(1), &detection(1, "lynx", 3), &policy()),
        );
        let identity = &state.identities[&IdentityId(1)];
        assert!(identity.embeddings.contains_key("antler"));
        assert!(state.seasonal.is_empty());
    }

    #[test]
    fn test_join_blends_and_counts() {
        let mut state = RegistryState::default();
        let policy = policy();
        apply(
            &mut state,
            seed(IdentityId(1), &detection(1, "red_deer", 3), &policy),
        );

        let mut second = detection(2, "red_deer", 8);
        second.embeddings[0] = Embedding::new("body", "v1", vec![0.0, 1.0]).unwrap();
        let identity = state.identities[&IdentityId(1)].clone();
        let mutations = join(&state, &identity, &second, &policy);
        apply(&mut state, mutations);

        let identity = &state.identities[&IdentityId(1)];
        assert_eq!(identity.sightings, 2);
        assert_eq!(identity.embeddings["body"].samples, 2);
        let v = &identity.embeddings["body"].vector;
        assert!((v[0] - v[1]).abs() < 1e-6);
        assert_eq!(identity.last_seen, second.timestamp);

        // August falls in the late period: a new row, the early one untouched.
        assert!(archive::lookup(&state, IdentityId(1), "2024-late").is_some());
        assert_eq!(
            archive::lookup(&state, IdentityId(1), "2024-early")
                .unwrap()
                .sightings,
            1
        );
    }

    #[test]
    fn test_join_replaces_stale_version() {
        let mut state = RegistryState::default();
        let policy = policy();
        apply(
            &mut state,
            seed(IdentityId(1), &detection(1, "lynx", 3), &policy),
        );
        let mut newer = detection(2, "lynx", 3);
        newer.embeddings = vec![Embedding::new("body", "v2", vec![0.0, 1.0]).unwrap()];
        let identity = state.identities[&IdentityId(1)].clone();
        let mutations = join(&state, &identity, &newer, &policy);
        apply(&mut state, mutations);

        let stored = &state.identities[&IdentityId(1)].embeddings["body"];
        assert_eq!(stored.version, "v2");
        assert_eq!(stored.samples, 1);
    }

    #[test]
    fn test_join_narrows_unknown_sex() {
        let mut state = RegistryState::default();
        let policy = policy();
        let mut first = detection(1, "lynx", 3);
        first.category.sex = Sex::Unknown;
        apply(&mut state, seed(IdentityId(1), &first, &policy));

        let mut female = detection(2, "lynx", 3);
        female.category.sex = Sex::Female;
        let identity = state.identities[&IdentityId(1)].clone();
        let joined = join(&state, &identity, &female, &policy);
        apply(&mut state, joined);
        assert_eq!(state.identities[&IdentityId(1)].category.sex, Sex::Female);

        // Once known, the sex is never changed by a later sighting.
        let mut unsexed = detection(3, "lynx", 3);
        unsexed.category.sex = Sex::Unknown;
        let identity = state.identities[&IdentityId(1)].clone();
        let joined = join(&state, &identity, &unsexed, &policy);
        apply(&mut state, joined);
        assert_eq!(state.identities[&IdentityId(1)].category.sex, Sex::Female);
    }

    #[test]
    fn test_can_seed_requires_primary() {
        let policy = policy();
        let mut d = detection(1, "lynx", 3);
        assert!(policy.can_seed(&d));
        d.embeddings.remove(0);
        assert!(!policy.can_seed(&d));
    }
}
