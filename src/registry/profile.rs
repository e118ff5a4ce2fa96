//! Read-side views of the registry: identity profiles, detection reports and
//! the review queue.

use crate::error::{Error, Result};
use crate::registry::{
    AssignmentMethod, CandidateScore, Detection, DetectionId, DetectionState, Exemplar, Identity,
    IdentityId, RegistryState, ReviewFlag, SeasonalTrait,
};
use crate::season::archive;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// One line of the identity list.
#[derive(Debug, Clone, Serialize)]
pub struct IdentitySummary {
    /// Identity id.
    pub id: IdentityId,
    /// Name or id.
    pub label: String,
    /// Species.
    pub species: String,
    /// Sex label.
    pub sex: String,
    /// Age class.
    pub age: String,
    /// Sightings.
    pub sightings: u64,
    /// First sighting.
    pub first_seen: DateTime<Utc>,
    /// Last sighting.
    pub last_seen: DateTime<Utc>,
    /// Most frequent camera.
    pub top_location: Option<String>,
    /// Excluded from matching.
    pub quarantined: bool,
}

impl IdentitySummary {
    fn of(identity: &Identity) -> Self {
        Self {
            id: identity.id,
            label: identity.label(),
            species: identity.category.species.clone(),
            sex: identity.category.sex.to_string(),
            age: identity.category.age.to_string(),
            sightings: identity.sightings,
            first_seen: identity.first_seen,
            last_seen: identity.last_seen,
            top_location: identity.activity.top_location().map(str::to_string),
            quarantined: identity.quarantined,
        }
    }
}

/// Running embedding metadata.
#[derive(Debug, Clone, Serialize)]
pub struct EmbeddingInfo {
    /// Extractor name.
    pub extractor: String,
    /// Extractor version.
    pub version: String,
    /// Samples blended in.
    pub samples: u64,
}

/// Seasonal row metadata.
#[derive(Debug, Clone, Serialize)]
pub struct SeasonInfo {
    /// Season tag.
    pub season: String,
    /// Trait extractor.
    pub extractor: String,
    /// Sightings in the season.
    pub sightings: u64,
    /// First sighting in the season.
    pub first_seen: DateTime<Utc>,
    /// Last sighting in the season.
    pub last_seen: DateTime<Utc>,
    /// Representative detection.
    pub representative: DetectionId,
}

impl From<&SeasonalTrait> for SeasonInfo {
    fn from(record: &SeasonalTrait) -> Self {
        Self {
            season: record.season.clone(),
            extractor: record.extractor.clone(),
            sightings: record.sightings,
            first_seen: record.first_seen,
            last_seen: record.last_seen,
            representative: record.representative,
        }
    }
}

/// Full profile of one identity.
#[derive(Debug, Clone, Serialize)]
pub struct IdentityProfile {
    /// Summary fields.
    #[serde(flatten)]
    pub summary: IdentitySummary,
    /// Sightings per camera.
    pub locations: BTreeMap<String, u64>,
    /// Sightings per UTC hour.
    pub hours: Vec<u64>,
    /// Busiest hour of day.
    pub peak_hour: Option<usize>,
    /// Best exemplar per viewpoint.
    pub exemplars: BTreeMap<String, Exemplar>,
    /// Running embeddings.
    pub embeddings: Vec<EmbeddingInfo>,
    /// Seasonal rows, oldest tag first.
    pub seasons: Vec<SeasonInfo>,
    /// Identities merged into this one.
    pub merged_from: Vec<IdentityId>,
    /// Assigned detections.
    pub detections: Vec<DetectionId>,
    /// Open incident ids.
    pub open_incidents: Vec<u64>,
}

/// Everything a reviewer needs about one detection.
#[derive(Debug, Clone, Serialize)]
pub struct DetectionReport {
    /// Detection id.
    pub id: DetectionId,
    /// Processing state.
    pub state: DetectionState,
    /// Camera.
    pub camera: String,
    /// Capture time.
    pub timestamp: DateTime<Utc>,
    /// Category label.
    pub category: String,
    /// Detector confidence.
    pub confidence: f32,
    /// Assigned identity.
    pub identity: Option<IdentityId>,
    /// Label of the assigned identity.
    pub label: Option<String>,
    /// How the assignment was made.
    pub method: Option<AssignmentMethod>,
    /// Score behind the assignment.
    pub score: Option<f32>,
    /// Review flags.
    pub review: Vec<ReviewFlag>,
    /// Candidate scores behind the decision.
    pub candidates: Vec<CandidateScore>,
    /// Linked detection (duplicate or continued sighting).
    pub linked_to: Option<DetectionId>,
    /// Negative examples.
    pub rejected: Vec<IdentityId>,
    /// Last processing error.
    pub last_error: Option<String>,
    /// Embeddings as `name@version`.
    pub embeddings: Vec<String>,
}

impl DetectionReport {
    fn of(state: &RegistryState, detection: &Detection) -> Self {
        let identity = detection.identity();
        Self {
            id: detection.id,
            state: detection.state,
            camera: detection.camera.clone(),
            timestamp: detection.timestamp,
            category: detection.category.to_string(),
            confidence: detection.confidence,
            identity,
            label: identity.map(|id| {
                state
                    .identities
                    .get(&id)
                    .map_or_else(|| id.to_string(), Identity::label)
            }),
            method: detection.assignment.as_ref().map(|a| a.method),
            score: detection.assignment.as_ref().and_then(|a| a.score),
            review: detection.review.clone(),
            candidates: detection.candidates.clone(),
            linked_to: detection.linked_to,
            rejected: detection.rejected.clone(),
            last_error: detection.last_error.clone(),
            embeddings: detection
                .embeddings
                .iter()
                .map(|e| format!("{}@{}", e.extractor, e.version))
                .collect(),
        }
    }
}

/// Identities, optionally restricted to one species, in id order.
pub fn identities(state: &RegistryState, species: Option<&str>) -> Vec<IdentitySummary> {
    state
        .identities
        .values()
        .filter(|i| species.is_none_or(|s| i.category.species == s))
        .map(IdentitySummary::of)
        .collect()
}

/// Profile of one identity.
pub fn identity_profile(state: &RegistryState, id: IdentityId) -> Result<IdentityProfile> {
    let identity = state
        .identities
        .get(&id)
        .ok_or(Error::IdentityNotFound { id })?;

    Ok(IdentityProfile {
        summary: IdentitySummary::of(identity),
        locations: identity.activity.locations.clone(),
        hours: identity.activity.hours.to_vec(),
        peak_hour: identity.activity.peak_hour(),
        exemplars: identity.exemplars.clone(),
        embeddings: identity
            .embeddings
            .iter()
            .map(|(name, stored)| EmbeddingInfo {
                extractor: name.clone(),
                version: stored.version.clone(),
                samples: stored.samples,
            })
            .collect(),
        seasons: state.seasonal_of(id).map(SeasonInfo::from).collect(),
        merged_from: identity.merged_from.clone(),
        detections: state.detections_of(id).map(|d| d.id).collect(),
        open_incidents: state
            .open_incidents()
            .filter(|i| i.identity == id)
            .map(|i| i.id)
            .collect(),
    })
}

/// Report for one detection.
pub fn detection_report(state: &RegistryState, id: DetectionId) -> Result<DetectionReport> {
    let detection = state
        .detections
        .get(&id)
        .ok_or(Error::DetectionNotFound { id })?;
    Ok(DetectionReport::of(state, detection))
}

/// Detections reviewers should look at, in id order.
pub fn review_queue(state: &RegistryState) -> Vec<DetectionReport> {
    state
        .detections
        .values()
        .filter(|d| d.needs_review())
        .map(|d| DetectionReport::of(state, d))
        .collect()
}

/// Seasonal row of an identity for exactly one season tag.
pub fn season(state: &RegistryState, id: IdentityId, tag: &str) -> Result<Option<SeasonInfo>> {
    if !state.identities.contains_key(&id) {
        return Err(Error::IdentityNotFound { id });
    }
    Ok(archive::lookup(state, id, tag).map(SeasonInfo::from))
}

/// Record counts of a registry.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    /// Last applied commit.
    pub seq: u64,
    /// Identities.
    pub identities: usize,
    /// Quarantined identities.
    pub quarantined: usize,
    /// Detections.
    pub detections: usize,
    /// Detections per processing state.
    pub by_state: BTreeMap<String, usize>,
    /// Seasonal rows.
    pub seasonal_records: usize,
    /// Unresolved incidents.
    pub open_incidents: usize,
}

/// Record counts of the registry.
pub fn stats(state: &RegistryState) -> RegistryStats {
    let mut by_state = BTreeMap::new();
    for detection in state.detections.values() {
        *by_state.entry(detection.state.to_string()).or_default() += 1;
    }

    RegistryStats {
        seq: state.seq,
        identities: state.identities.len(),
        quarantined: state.identities.values().filter(|i| i.quarantined).count(),
        detections: state.detections.len(),
        by_state,
        seasonal_records: state.seasonal.len(),
        open_incidents: state.open_incidents().count(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::SeasonalConfig;
    use crate::embedding::{Embedding, ExtractorSpec};
    use crate::registry::sighting::{self, SightingPolicy};
    use crate::registry::{AgeClass, Assignment, BoundingBox, Category, Mutation, Sex};
    use chrono::TimeZone;
    use std::path::PathBuf;

    fn detection(id: u64, month: u32) -> Detection {
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
                species: "red_deer".to_string(),
                sex: Sex::Male,
                age: AgeClass::Adult,
            },
            confidence: 0.9,
            timestamp: Utc.with_ymd_and_hms(2023, month, 2, 21, 0, 0).unwrap(),
            camera: "ridge".to_string(),
            viewpoint: Some("left".to_string()),
            embeddings: vec![
                Embedding::new("body", "v1", vec![1.0, 0.0]).unwrap(),
                Embedding::new("antler", "v1", vec![0.0, 1.0]).unwrap(),
            ],
            state: DetectionState::NewIdentity,
            assignment: Some(Assignment {
                identity: IdentityId(1),
                method: AssignmentMethod::Created,
                score: None,
            }),
            review: Vec::new(),
            candidates: Vec::new(),
            linked_to: None,
            rejected: Vec::new(),
            last_error: None,
            attempts: 0,
        }
    }

    fn state() -> RegistryState {
        let policy = SightingPolicy::new(
            vec![
                ExtractorSpec::new("body", "v1", 0.8),
                ExtractorSpec::new("antler", "v1", 0.2),
            ],
            SeasonalConfig {
                extractor: Some("antler".to_string()),
                species: vec!["red_deer".to_string()],
                ..SeasonalConfig::default()
            },
            0.05,
        );
        let mut state = RegistryState::default();
        let d = detection(10, 2);
        for m in sighting::seed(IdentityId(1), &d, &policy) {
            state.apply(m);
        }
        state.apply(Mutation::detection(d));

        let mut unresolved = detection(11, 2);
        unresolved.state = DetectionState::Unresolved;
        unresolved.assignment = None;
        unresolved.flag(ReviewFlag::NoCandidates);
        state.apply(Mutation::detection(unresolved));
        state
    }

    #[test]
    fn test_identity_profile() {
        let state = state();
        let profile = identity_profile(&state, IdentityId(1)).unwrap();
        assert_eq!(profile.summary.label, "ind-00001");
        assert_eq!(profile.summary.top_location.as_deref(), Some("ridge"));
        assert_eq!(profile.peak_hour, Some(21));
        assert_eq!(profile.detections, vec![DetectionId(10)]);
        assert_eq!(profile.seasons.len(), 1);
        assert_eq!(profile.seasons[0].season, "2023-early");
        assert_eq!(profile.embeddings.len(), 1);
        assert!(identity_profile(&state, IdentityId(2)).is_err());
    }

    #[test]
    fn test_review_queue_lists_flagged() {
        let state = state();
        let queue = review_queue(&state);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].id, DetectionId(11));
        assert_eq!(queue[0].review, vec![ReviewFlag::NoCandidates]);
    }

    #[test]
    fn test_season_lookup_is_exact() {
        let state = state();
        assert!(season(&state, IdentityId(1), "2023-early").unwrap().is_some());
        assert!(season(&state, IdentityId(1), "2023-late").unwrap().is_none());
        assert!(season(&state, IdentityId(5), "2023-early").is_err());
    }

    #[test]
    fn test_list_filters_species() {
        let state = state();
        assert_eq!(identities(&state, None).len(), 1);
        assert!(identities(&state, Some("wolf")).is_empty());
    }

    #[test]
    fn test_detection_report() {
        let state = state();
        let report = detection_report(&state, DetectionId(10)).unwrap();
        assert_eq!(report.label.as_deref(), Some("ind-00001"));
        assert_eq!(report.method, Some(AssignmentMethod::Created));
        assert_eq!(report.embeddings, vec!["body@v1", "antler@v1"]);
    }

    #[test]
    fn test_stats_counts_states() {
        let stats = stats(&state());
        assert_eq!(stats.identities, 1);
        assert_eq!(stats.detections, 2);
        assert_eq!(stats.by_state["new-identity"], 1);
        assert_eq!(stats.by_state["unresolved"], 1);
        assert_eq!(stats.seasonal_records, 1);
        assert_eq!(stats.open_incidents, 0);
    }
}
