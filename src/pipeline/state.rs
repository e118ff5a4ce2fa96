//! Detection state machine.
//!
//! ```text
//! pending -> deduplicated -> embedded -> matched | new-identity | unresolved
//!     \____________\______________\___-> duplicate
//! ```
//!
//! Any state may return to `pending` through a correction or a failed
//! attempt; re-matching starts over from there.

use crate::error::{Error, Result};
use crate::registry::{Detection, DetectionState};

/// Whether `from -> to` is a legal step.
pub fn can_transition(from: DetectionState, to: DetectionState) -> bool {
    use DetectionState::{
        Deduplicated, Duplicate, Embedded, Matched, NewIdentity, Pending, Unresolved,
    };

    match (from, to) {
        (_, Pending) => true,
        (Pending, Deduplicated | Duplicate) => true,
        (Deduplicated, Embedded | Duplicate) => true,
        (Embedded, Matched | NewIdentity | Unresolved | Duplicate) => true,
        // Re-embedding a detection that already has vectors is a no-op step.
        (Embedded, Embedded) => true,
        _ => false,
    }
}

/// Move a detection to `to`, rejecting illegal steps.
pub fn transition(detection: &mut Detection, to: DetectionState) -> Result<()> {
    if !can_transition(detection.state, to) {
        return Err(Error::Internal {
            message: format!(
                "illegal state change for detection {}: {} -> {to}",
                detection.id, detection.state
            ),
        });
    }
    detection.state = to;
    Ok(())
}

/// Bring a detection to `deduplicated` so matching can start.
///
/// Pending detections already went through spatial suppression when they
/// were ingested, so the step is bookkeeping only.
pub fn ready_for_matching(detection: &mut Detection) -> Result<()> {
    match detection.state {
        DetectionState::Pending => transition(detection, DetectionState::Deduplicated),
        DetectionState::Deduplicated | DetectionState::Embedded => Ok(()),
        other => Err(Error::Internal {
            message: format!("detection {} is {other}; reset it first", detection.id),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use DetectionState::*;

    #[test]
    fn test_forward_path() {
        assert!(can_transition(Pending, Deduplicated));
        assert!(can_transition(Deduplicated, Embedded));
        assert!(can_transition(Embedded, Matched));
        assert!(can_transition(Embedded, NewIdentity));
        assert!(can_transition(Embedded, Unresolved));
    }

    #[test]
    fn test_duplicate_from_early_states() {
        assert!(can_transition(Pending, Duplicate));
        assert!(can_transition(Embedded, Duplicate));
        assert!(!can_transition(Matched, Duplicate));
    }

    #[test]
    fn test_no_skipping() {
        assert!(!can_transition(Pending, Matched));
        assert!(!can_transition(Deduplicated, NewIdentity));
        assert!(!can_transition(Duplicate, Embedded));
    }

    #[test]
    fn test_reset_always_allowed() {
        for state in [Deduplicated, Duplicate, Embedded, Matched, NewIdentity, Unresolved] {
            assert!(can_transition(state, Pending));
        }
    }
}
