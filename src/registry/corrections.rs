//! Reviewer corrections: rename, merge, reject and manual assignment.
//!
//! Each correction is one registry commit, so a correction either lands
//! completely or not at all.

use crate::embedding::weighted_mean;
use crate::error::{Error, Result};
use crate::fusion::category;
use crate::registry::integrity::resolve_incidents;
use crate::registry::sighting::{self, SightingPolicy};
use crate::registry::{
    Assignment, AssignmentMethod, Detection, DetectionId, DetectionState, Identity, IdentityId,
    Mutation, Registry, RegistryState, SeasonalTrait, Sex,
};
use crate::season::archive;
use serde::Serialize;
use tracing::info;

/// Outcome of a merge.
#[derive(Debug, Clone, Serialize)]
pub struct MergeSummary {
    /// The surviving identity after the merge.
    pub target: Identity,
    /// Detections reassigned from the source.
    pub moved_detections: usize,
    /// Seasonal rows moved or combined.
    pub moved_seasons: usize,
}

fn invalid(message: String) -> Error {
    Error::InvalidCorrection { message }
}

/// Set or clear the display name of an identity.
pub fn rename(registry: &Registry, id: IdentityId, name: Option<&str>) -> Result<Identity> {
    let name = name.map(str::trim).filter(|n| !n.is_empty());
    registry.commit(|state| {
        let mut identity = state
            .identities
            .get(&id)
            .cloned()
            .ok_or(Error::IdentityNotFound { id })?;
        identity.name = name.map(str::to_string);
        Ok((vec![Mutation::identity(identity.clone())], identity))
    })
}

/// Merge `source` into `target`.
///
/// All detections and seasonal rows of the source move to the target,
/// sighting counts add up and the source is removed.
pub fn merge(registry: &Registry, source: IdentityId, target: IdentityId) -> Result<MergeSummary> {
    if source == target {
        return Err(invalid(format!("cannot merge {source} into itself")));
    }

    let summary = registry.commit(|state| {
        let src = state
            .identities
            .get(&source)
            .ok_or(Error::IdentityNotFound { id: source })?;
        let dst = state
            .identities
            .get(&target)
            .ok_or(Error::IdentityNotFound { id: target })?;
        if !category::compatible(&src.category, &dst.category) {
            return Err(invalid(format!(
                "cannot merge {source} ({}) into {target} ({})",
                src.category, dst.category
            )));
        }

        let merged = merged_identity(dst, src);
        let conflict = state
            .detections_of(source)
            .chain(state.detections_of(target))
            .find(|d| !category::compatible(&d.category, &merged.category));
        if let Some(detection) = conflict {
            return Err(invalid(format!(
                "cannot merge {source} into {target}: detection {} ({}) does not fit {}",
                detection.id, detection.category, merged.category
            )));
        }
        let mut mutations = vec![Mutation::identity(merged.clone())];

        let mut moved_detections = 0;
        for detection in state.detections.values() {
            if let Some(updated) = retarget(detection, source, target) {
                if detection.identity() == Some(source) {
                    moved_detections += 1;
                }
                mutations.push(Mutation::detection(updated));
            }
        }

        let source_rows: Vec<&SeasonalTrait> = state.seasonal_of(source).collect();
        for row in &source_rows {
            let moved = match archive::lookup(state, target, &row.season) {
                Some(existing) => archive::combine(existing, row),
                None => SeasonalTrait {
                    identity: target,
                    ..(*row).clone()
                },
            };
            mutations.push(Mutation::seasonal(moved));
            mutations.push(Mutation::RemoveSeasonal {
                identity: source,
                season: row.season.clone(),
            });
        }

        mutations.push(Mutation::RemoveIdentity { id: source });
        mutations.extend(resolve_incidents(state, source));

        Ok((
            mutations,
            MergeSummary {
                target: merged,
                moved_detections,
                moved_seasons: source_rows.len(),
            },
        ))
    })?;

    info!(
        "Merged {source} into {target}: {} detections, {} seasonal rows",
        summary.moved_detections, summary.moved_seasons
    );
    Ok(summary)
}

fn merged_identity(target: &Identity, source: &Identity) -> Identity {
    let mut merged = target.clone();

    if merged.category.sex == Sex::Unknown {
        merged.category.sex = source.category.sex;
    }
    if merged.name.is_none() {
        merged.name.clone_from(&source.name);
    }

    for (name, theirs) in &source.embeddings {
        match merged.embeddings.get_mut(name) {
            None => {
                merged.embeddings.insert(name.clone(), theirs.clone());
            }
            Some(ours) if ours.version == theirs.version => {
                let total = ours.samples + theirs.samples;
                #[allow(clippy::cast_precision_loss)]
                let w = theirs.samples as f32 / total.max(1) as f32;
                if let Some(vector) = weighted_mean(&ours.vector, &theirs.vector, w) {
                    ours.vector = vector;
                }
                ours.samples = total;
            }
            // Different versions are never averaged; the target keeps its own.
            Some(_) => {}
        }
    }

    merged.sightings += source.sightings;
    merged.first_seen = merged.first_seen.min(source.first_seen);
    merged.last_seen = merged.last_seen.max(source.last_seen);
    merged.activity.absorb(&source.activity);

    for (viewpoint, theirs) in &source.exemplars {
        let better = merged.exemplars.get(viewpoint).is_none_or(|ours| {
            theirs.confidence > ours.confidence
                || (theirs.confidence == ours.confidence && theirs.detection < ours.detection)
        });
        if better {
            merged.exemplars.insert(viewpoint.clone(), theirs.clone());
        }
    }

    merged.merged_from.push(source.id);
    merged.merged_from.extend(source.merged_from.iter().copied());
    merged.merged_from.sort();
    merged.merged_from.dedup();
    merged
}

/// Rewrite every reference to `source` in a detection. `None` when nothing
/// refers to it.
fn retarget(detection: &Detection, source: IdentityId, target: IdentityId) -> Option<Detection> {
    let assigned = detection.identity() == Some(source);
    let rejected = detection.rejected.contains(&source);
    let candidate = detection.candidates.iter().any(|c| c.identity == source);
    if !(assigned || rejected || candidate) {
        return None;
    }

    let mut updated = detection.clone();
    if assigned && let Some(assignment) = updated.assignment.as_mut() {
        assignment.identity = target;
        // A reviewer merged the two; an old negative example against the
        // target no longer holds for detections that now belong to it.
        updated.rejected.retain(|id| *id != target);
    }
    if rejected {
        for id in &mut updated.rejected {
            if *id == source {
                *id = target;
            }
        }
        updated.rejected.sort();
        updated.rejected.dedup();
    }
    if candidate {
        let mut seen = false;
        updated.candidates.retain_mut(|c| {
            if c.identity == source {
                c.identity = target;
            }
            if c.identity != target {
                return true;
            }
            let keep = !seen;
            seen = true;
            keep
        });
    }
    Some(updated)
}

/// Mutations removing one detection's sighting from its identity.
///
/// The running embedding is not un-blended. The span and exemplars are
/// rebuilt from the identity's remaining detections. An identity left with
/// no sightings is removed together with its seasonal rows.
fn detach(state: &RegistryState, detection: &Detection) -> Result<Vec<Mutation>> {
    let Some(id) = detection.identity() else {
        return Ok(Vec::new());
    };
    let identity = state
        .identities
        .get(&id)
        .ok_or(Error::IdentityNotFound { id })?;

    let mut updated = identity.clone();
    updated.sightings = updated.sightings.saturating_sub(1);
    if updated.sightings == 0 {
        let mut mutations: Vec<Mutation> = state
            .seasonal_of(id)
            .map(|row| Mutation::RemoveSeasonal {
                identity: id,
                season: row.season.clone(),
            })
            .collect();
        mutations.push(Mutation::RemoveIdentity { id });
        mutations.extend(resolve_incidents(state, id));
        return Ok(mutations);
    }

    updated
        .activity
        .forget(&detection.camera, detection.timestamp);

    let remaining: Vec<&Detection> = state
        .detections_of(id)
        .filter(|d| d.id != detection.id)
        .collect();
    if let Some(first) = remaining.iter().map(|d| d.timestamp).min()
        && let Some(last) = remaining.iter().map(|d| d.timestamp).max()
    {
        updated.first_seen = first;
        updated.last_seen = last;
    }
    updated
        .exemplars
        .retain(|_, exemplar| exemplar.detection != detection.id);
    for d in &remaining {
        updated.offer_exemplar(d);
    }

    Ok(vec![Mutation::identity(updated)])
}

/// Mark a detection's assignment incorrect and return it to `pending`.
///
/// With `negative`, the detection will never be assigned to that identity
/// again.
pub fn reject(registry: &Registry, id: DetectionId, negative: bool) -> Result<Detection> {
    let detection = registry.commit(|state| {
        let detection = state
            .detections
            .get(&id)
            .ok_or(Error::DetectionNotFound { id })?;
        let Some(identity) = detection.identity() else {
            return Err(invalid(format!("detection {id} is not assigned")));
        };

        let mut mutations = detach(state, detection)?;

        let mut updated = detection.clone();
        updated.clear_decision();
        updated.state = DetectionState::Pending;
        updated.attempts = 0;
        if negative && !updated.rejected.contains(&identity) {
            updated.rejected.push(identity);
            updated.rejected.sort();
        }
        mutations.push(Mutation::detection(updated.clone()));
        Ok((mutations, updated))
    })?;

    info!("Detached detection {id}; now pending");
    Ok(detection)
}

/// Assign a detection to an identity by hand.
pub fn assign(
    registry: &Registry,
    id: DetectionId,
    identity: IdentityId,
    policy: &SightingPolicy,
) -> Result<Detection> {
    let detection = registry.commit(|state| {
        let detection = state
            .detections
            .get(&id)
            .ok_or(Error::DetectionNotFound { id })?;
        let target = state
            .identities
            .get(&identity)
            .ok_or(Error::IdentityNotFound { id: identity })?;

        if detection.state == DetectionState::Duplicate {
            return Err(invalid(format!("detection {id} is a duplicate")));
        }
        if !category::compatible(&detection.category, &target.category) {
            return Err(invalid(format!(
                "detection {id} ({}) is not compatible with {identity} ({})",
                detection.category, target.category
            )));
        }

        let mut mutations = Vec::new();
        if detection.identity() != Some(identity) {
            mutations.extend(detach(state, detection)?);
            mutations.extend(sighting::join(state, target, detection, policy));
        }

        let mut updated = detection.clone();
        updated.clear_decision();
        updated.rejected.retain(|r| *r != identity);
        updated.state = DetectionState::Matched;
        updated.assignment = Some(Assignment {
            identity,
            method: AssignmentMethod::Manual,
            score: None,
        });
        mutations.push(Mutation::detection(updated.clone()));
        Ok((mutations, updated))
    })?;

    info!("Assigned detection {id} to {identity}");
    Ok(detection)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::SeasonalConfig;
    use crate::embedding::{Embedding, ExtractorSpec};
    use crate::registry::{AgeClass, BoundingBox, CandidateScore, Category};
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn policy() -> SightingPolicy {
        let seasonal = SeasonalConfig {
            extractor: Some("antler".to_string()),
            species: vec!["red_deer".to_string()],
            ..SeasonalConfig::default()
        };
        SightingPolicy::new(
            vec![
                ExtractorSpec::new("body", "v1", 0.8),
                ExtractorSpec::new("antler", "v1", 0.2),
            ],
            seasonal,
            0.05,
        )
    }

    fn detection(id: u64, month: u32, body: Vec<f32>) -> Detection {
        Detection {
            id: DetectionId(id),
            image: PathBuf::from(format!("img-{id}.jpg")),
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
            confidence: 0.5 + 0.01 * id as f32,
            timestamp: Utc.with_ymd_and_hms(2024, month, 1, 6, 0, 0).unwrap(),
            camera: format!("cam-{id}"),
            viewpoint: None,
            embeddings: vec![
                Embedding::new("body", "v1", body).unwrap(),
                Embedding::new("antler", "v1", vec![1.0, 1.0]).unwrap(),
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

    /// Seed identity `id` from `first` and attach every detection in `rest`.
    fn populate(registry: &Registry, id: u64, first: Detection, rest: Vec<Detection>) {
        let policy = policy();
        registry
            .commit(|_| {
                let mut d = first.clone();
                d.state = DetectionState::NewIdentity;
                d.assignment = Some(Assignment {
                    identity: IdentityId(id),
                    method: AssignmentMethod::Created,
                    score: None,
                });
                let mut m = sighting::seed(IdentityId(id), &d, &policy);
                m.push(Mutation::detection(d));
                Ok((m, ()))
            })
            .unwrap();
        for d in rest {
            registry
                .commit(|state| {
                    let identity = &state.identities[&IdentityId(id)];
                    let mut m = sighting::join(state, identity, &d, &policy);
                    let mut d = d.clone();
                    d.state = DetectionState::Matched;
                    d.assignment = Some(Assignment {
                        identity: IdentityId(id),
                        method: AssignmentMethod::Matched,
                        score: Some(0.9),
                    });
                    m.push(Mutation::detection(d));
                    Ok((m, ()))
                })
                .unwrap();
        }
    }

    #[test]
    fn test_rename_trims_and_clears() {
        let registry = Registry::in_memory();
        populate(&registry, 1, detection(1, 3, vec![1.0, 0.0]), vec![]);
        let named = rename(&registry, IdentityId(1), Some("  Odin ")).unwrap();
        assert_eq!(named.name.as_deref(), Some("Odin"));
        let cleared = rename(&registry, IdentityId(1), Some("")).unwrap();
        assert!(cleared.name.is_none());
        assert!(rename(&registry, IdentityId(9), Some("x")).is_err());
    }

    #[test]
    fn test_merge_moves_everything() {
        let registry = Registry::in_memory();
        populate(
            &registry,
            1,
            detection(1, 3, vec![1.0, 0.0]),
            vec![detection(2, 8, vec![1.0, 0.1])],
        );
        populate(
            &registry,
            2,
            detection(3, 3, vec![0.9, 0.2]),
            vec![detection(4, 4, vec![0.8, 0.3])],
        );

        // A third detection rejected the source and listed it as candidate.
        registry
            .commit(|_| {
                let mut d = detection(5, 5, vec![0.0, 1.0]);
                d.rejected = vec![IdentityId(2)];
                d.candidates = vec![CandidateScore {
                    identity: IdentityId(2),
                    score: 0.4,
                    sightings: 2,
                    breakdown: BTreeMap::new(),
                }];
                Ok((vec![Mutation::detection(d)], ()))
            })
            .unwrap();

        let summary = merge(&registry, IdentityId(2), IdentityId(1)).unwrap();
        assert_eq!(summary.moved_detections, 2);
        assert_eq!(summary.target.sightings, 4);
        assert_eq!(summary.target.merged_from, vec![IdentityId(2)]);
        assert_eq!(summary.target.embeddings["body"].samples, 4);

        registry
            .read(|state| {
                assert!(!state.identities.contains_key(&IdentityId(2)));
                assert_eq!(state.detections_of(IdentityId(2)).count(), 0);
                assert_eq!(state.detections_of(IdentityId(1)).count(), 4);
                assert_eq!(state.seasonal_of(IdentityId(2)).count(), 0);
                assert!(state.detections.values().all(|d| {
                    !d.rejected.contains(&IdentityId(2))
                        && d.candidates.iter().all(|c| c.identity != IdentityId(2))
                }));
                // Both had a 2024-early row; they combine.
                let early = archive::lookup(state, IdentityId(1), "2024-early").unwrap();
                assert_eq!(early.sightings, 3);
                assert_eq!(state.identities[&IdentityId(1)].sightings, 4);
                assert_eq!(state.index.len("body"), 1);
            })
            .unwrap();
    }

    #[test]
    fn test_merge_rejects_self_and_incompatible() {
        let registry = Registry::in_memory();
        populate(&registry, 1, detection(1, 3, vec![1.0, 0.0]), vec![]);
        let mut female = detection(2, 3, vec![1.0, 0.0]);
        female.category.sex = Sex::Female;
        populate(&registry, 2, female, vec![]);

        assert!(merge(&registry, IdentityId(1), IdentityId(1)).is_err());
        assert!(matches!(
            merge(&registry, IdentityId(2), IdentityId(1)),
            Err(Error::InvalidCorrection { .. })
        ));
    }

    #[test]
    fn test_merge_keeps_every_detection_in_category() {
        let registry = Registry::in_memory();
        let mut unsexed = detection(1, 3, vec![1.0, 0.0]);
        unsexed.category.sex = Sex::Unknown;
        let mut female = detection(2, 3, vec![1.0, 0.1]);
        female.category.sex = Sex::Female;
        populate(&registry, 1, unsexed, vec![female]);
        assert_eq!(
            registry.identity(IdentityId(1)).unwrap().category.sex,
            Sex::Female
        );

        // An unsexed identity holding a male sighting, as older journals
        // can contain. Its category is compatible with the female target.
        let mut seed = detection(3, 3, vec![0.9, 0.2]);
        seed.category.sex = Sex::Unknown;
        populate(&registry, 2, seed, vec![detection(4, 3, vec![0.9, 0.3])]);
        registry
            .commit(|state| {
                let mut identity = state.identities[&IdentityId(2)].clone();
                identity.category.sex = Sex::Unknown;
                Ok((vec![Mutation::identity(identity)], ()))
            })
            .unwrap();

        assert!(matches!(
            merge(&registry, IdentityId(2), IdentityId(1)),
            Err(Error::InvalidCorrection { .. })
        ));
        registry
            .read(|state| {
                assert_eq!(state.detections_of(IdentityId(1)).count(), 2);
                assert_eq!(state.detections_of(IdentityId(2)).count(), 2);
                for detection in state.detections.values() {
                    let owner = &state.identities[&detection.identity().unwrap()];
                    assert!(category::compatible(&detection.category, &owner.category));
                }
            })
            .unwrap();
    }

    #[test]
    fn test_reject_detaches_to_pending() {
        let registry = Registry::in_memory();
        populate(
            &registry,
            1,
            detection(1, 3, vec![1.0, 0.0]),
            vec![detection(2, 5, vec![1.0, 0.1])],
        );

        let d = reject(&registry, DetectionId(2), true).unwrap();
        assert_eq!(d.state, DetectionState::Pending);
        assert!(d.assignment.is_none());
        assert_eq!(d.rejected, vec![IdentityId(1)]);
        assert_eq!(d.embeddings.len(), 2);

        let identity = registry.identity(IdentityId(1)).unwrap();
        assert_eq!(identity.sightings, 1);
        assert_eq!(identity.last_seen, detection(1, 3, vec![1.0]).timestamp);
        assert!(!identity.activity.locations.contains_key("cam-2"));

        assert!(reject(&registry, DetectionId(2), false).is_err());
    }

    #[test]
    fn test_reject_last_sighting_removes_identity() {
        let registry = Registry::in_memory();
        populate(&registry, 1, detection(1, 3, vec![1.0, 0.0]), vec![]);
        reject(&registry, DetectionId(1), false).unwrap();
        registry
            .read(|state| {
                assert!(state.identities.is_empty());
                assert!(state.seasonal.is_empty());
                assert!(state.index.is_empty());
            })
            .unwrap();
    }

    #[test]
    fn test_manual_assign_moves_between_identities() {
        let registry = Registry::in_memory();
        populate(
            &registry,
            1,
            detection(1, 3, vec![1.0, 0.0]),
            vec![detection(2, 3, vec![1.0, 0.1])],
        );
        populate(&registry, 2, detection(3, 3, vec![0.0, 1.0]), vec![]);

        let d = assign(&registry, DetectionId(2), IdentityId(2), &policy()).unwrap();
        assert_eq!(d.state, DetectionState::Matched);
        let assignment = d.assignment.unwrap();
        assert_eq!(assignment.method, AssignmentMethod::Manual);
        assert_eq!(assignment.identity, IdentityId(2));

        assert_eq!(registry.identity(IdentityId(1)).unwrap().sightings, 1);
        assert_eq!(registry.identity(IdentityId(2)).unwrap().sightings, 2);

        // Assigning again to the same identity changes no counts.
        assign(&registry, DetectionId(2), IdentityId(2), &policy()).unwrap();
        assert_eq!(registry.identity(IdentityId(2)).unwrap().sightings, 2);
    }

    #[test]
    fn test_manual_assign_respects_category() {
        let registry = Registry::in_memory();
        populate(&registry, 1, detection(1, 3, vec![1.0, 0.0]), vec![]);
        let mut wolf = detection(2, 3, vec![1.0, 0.0]);
        wolf.category.species = "wolf".to_string();
        registry
            .commit(|_| Ok((vec![Mutation::detection(wolf)], ())))
            .unwrap();
        assert!(assign(&registry, DetectionId(2), IdentityId(1), &policy()).is_err());
    }
}
