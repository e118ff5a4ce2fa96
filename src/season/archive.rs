//! Seasonal archive: one trait record per (identity, season tag).
//!
//! Seasonal traits (antlers, winter coat) are compared only within the same
//! season tag. Records are never deleted implicitly; merges move them.

use crate::config::SeasonalConfig;
use crate::embedding::{ExtractorSpec, blend, weighted_mean};
use crate::registry::{Detection, IdentityId, RegistryState, SeasonalTrait};
use crate::season::SeasonCalendar;

/// Where a detection's seasonal trait belongs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeasonScope {
    /// Extractor describing the trait.
    pub extractor: String,
    /// Its version.
    pub version: String,
    /// Season tag of the detection.
    pub tag: String,
}

impl SeasonScope {
    /// Seasonal scope of a detection, when its species carries a seasonal
    /// trait and the trait extractor is configured.
    pub fn for_detection(
        seasonal: &SeasonalConfig,
        calendar: &SeasonCalendar,
        specs: &[ExtractorSpec],
        detection: &Detection,
    ) -> Option<Self> {
        if !seasonal.applies_to(&detection.category.species) {
            return None;
        }
        let name = seasonal.extractor.as_deref()?;
        let spec = specs.iter().find(|s| s.name == name)?;
        Some(Self {
            extractor: spec.name.clone(),
            version: spec.version.clone(),
            tag: calendar.tag(detection.timestamp),
        })
    }

    /// Whether an extractor's vectors are routed to the archive.
    pub fn routes(scope: Option<&Self>, extractor: &str) -> bool {
        scope.is_some_and(|s| s.extractor == extractor)
    }
}

/// Trait record of an identity for exactly one season tag.
pub fn lookup<'a>(
    state: &'a RegistryState,
    identity: IdentityId,
    tag: &str,
) -> Option<&'a SeasonalTrait> {
    state.seasonal.get(&(identity, tag.to_string()))
}

/// Trait vector to compare against, scoped to the detection's season.
pub fn trait_vector<'a>(
    state: &'a RegistryState,
    identity: IdentityId,
    scope: &SeasonScope,
) -> Option<&'a [f32]> {
    lookup(state, identity, &scope.tag)
        .filter(|r| r.extractor == scope.extractor && r.version == scope.version)
        .map(|r| r.vector.as_slice())
}

/// Fold a detection into the season record of an identity.
///
/// Returns `None` when the detection has no trait embedding for the scope.
pub fn observe(
    existing: Option<&SeasonalTrait>,
    identity: IdentityId,
    detection: &Detection,
    scope: &SeasonScope,
    min_blend_weight: f32,
) -> Option<SeasonalTrait> {
    let embedding = detection.embedding(&scope.extractor, &scope.version)?;

    let Some(current) = existing.filter(|r| r.version == scope.version) else {
        return Some(SeasonalTrait {
            identity,
            season: scope.tag.clone(),
            extractor: scope.extractor.clone(),
            version: scope.version.clone(),
            vector: embedding.vector.clone(),
            representative: detection.id,
            representative_confidence: detection.confidence,
            first_seen: detection.timestamp,
            last_seen: detection.timestamp,
            sightings: 1,
        });
    };

    let mut record = current.clone();
    if let Some(vector) = blend(
        &current.vector,
        &embedding.vector,
        current.sightings,
        min_blend_weight,
    ) {
        record.vector = vector;
    }
    record.sightings += 1;
    record.first_seen = record.first_seen.min(detection.timestamp);
    record.last_seen = record.last_seen.max(detection.timestamp);
    if detection.confidence > record.representative_confidence {
        record.representative = detection.id;
        record.representative_confidence = detection.confidence;
    }
    Some(record)
}

/// Combine two records of the same season when merging identities.
///
/// The result belongs to `target.identity`; vectors are averaged by
/// sighting count.
pub fn combine(target: &SeasonalTrait, source: &SeasonalTrait) -> SeasonalTrait {
    let mut record = target.clone();

    if target.version == source.version {
        #[allow(clippy::cast_precision_loss)]
        let total = (target.sightings + source.sightings).max(1) as f32;
        #[allow(clippy::cast_precision_loss)]
        let w = source.sightings as f32 / total;
        if let Some(vector) = weighted_mean(&target.vector, &source.vector, w) {
            record.vector = vector;
        }
    }

    record.sightings = target.sightings + source.sightings;
    record.first_seen = target.first_seen.min(source.first_seen);
    record.last_seen = target.last_seen.max(source.last_seen);
    if source.representative_confidence > target.representative_confidence {
        record.representative = source.representative;
        record.representative_confidence = source.representative_confidence;
    }
    record
}
