//! Administrative re-matching: selecting detections and returning them to
//! `pending` so the worker pool decides them again.

use crate::error::Result;
use crate::registry::{DetectionId, DetectionState, Mutation, Registry, RegistryState, corrections};
use tracing::info;

/// Which detections to re-match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// Every detection that is not a duplicate.
    All,
    /// Unresolved detections and ones left pending by failures.
    Unresolved,
    /// Explicit ids.
    Ids(Vec<DetectionId>),
}

/// Resolve a selection against the registry.
pub fn select(state: &RegistryState, selection: &Selection) -> Vec<DetectionId> {
    match selection {
        Selection::All => state
            .detections
            .values()
            .filter(|d| d.state != DetectionState::Duplicate)
            .map(|d| d.id)
            .collect(),
        Selection::Unresolved => state
            .detections
            .values()
            .filter(|d| matches!(d.state, DetectionState::Unresolved | DetectionState::Pending))
            .map(|d| d.id)
            .collect(),
        Selection::Ids(ids) => ids.clone(),
    }
}

/// Return detections to `pending`.
///
/// Assigned detections are detached from their identity first. Embeddings
/// and negative examples are kept, so re-matching does not recompute
/// vectors and never revisits a rejected identity.
pub fn reset(registry: &Registry, ids: &[DetectionId]) -> Result<usize> {
    let mut reset = 0;
    for &id in ids {
        let detection = registry.detection(id)?;
        if detection.identity().is_some() {
            corrections::reject(registry, id, false)?;
            reset += 1;
            continue;
        }
        if detection.state == DetectionState::Pending && detection.last_error.is_none() {
            continue;
        }

        let mut updated = detection;
        updated.clear_decision();
        updated.state = DetectionState::Pending;
        updated.linked_to = None;
        updated.attempts = 0;
        registry.commit(|_| Ok((vec![Mutation::detection(updated)], ())))?;
        reset += 1;
    }
    info!("Reset {reset} of {} detections for re-matching", ids.len());
    Ok(reset)
}
