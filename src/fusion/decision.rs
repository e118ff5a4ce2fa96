//! Threshold decision with tie handling.

use crate::registry::IdentityId;
use std::collections::BTreeMap;

/// A gated candidate with its fused score.
#[derive(Debug, Clone, PartialEq)]
pub struct Scored {
    /// Candidate identity.
    pub identity: IdentityId,
    /// Fused score.
    pub score: f32,
    /// Prior sightings of the candidate.
    pub sightings: u64,
    /// Per-extractor clamped similarity.
    pub breakdown: BTreeMap<String, f32>,
}

/// Outcome of the decision policy.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Assign to an existing identity.
    Match {
        /// Chosen identity.
        identity: IdentityId,
        /// Its fused score.
        score: f32,
        /// Another candidate scored within epsilon; flag for review.
        ambiguous: bool,
    },
    /// Candidates exist but none clears the threshold.
    NewIdentity {
        /// Best score seen, for the record.
        best: f32,
    },
    /// Gating left no candidate at all.
    NoCandidates,
}

/// Sort candidates best first: score descending, then more sightings, then
/// lower id.
pub fn rank(scored: &mut [Scored]) {
    scored.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| b.sightings.cmp(&a.sightings))
            .then_with(|| a.identity.cmp(&b.identity))
    });
}

/// Apply the threshold policy to ranked candidates.
///
/// Candidates at or above `threshold` and within `epsilon` of the best
/// score form a tie group; the member with the most prior sightings wins
/// (lowest id on equal sightings) and the match is flagged ambiguous.
pub fn decide(scored: &[Scored], threshold: f32, epsilon: f32) -> Decision {
    let Some(best) = scored.iter().max_by(|a, b| {
        a.score
            .total_cmp(&b.score)
            .then_with(|| b.identity.cmp(&a.identity))
    }) else {
        return Decision::NoCandidates;
    };

    if best.score < threshold {
        return Decision::NewIdentity { best: best.score };
    }

    let ties: Vec<&Scored> = scored
        .iter()
        .filter(|s| s.score >= threshold && best.score - s.score <= epsilon)
        .collect();

    let chosen = ties
        .iter()
        .copied()
        .min_by(|a, b| {
            b.sightings
                .cmp(&a.sightings)
                .then_with(|| a.identity.cmp(&b.identity))
        })
        .unwrap_or(best);

    Decision::Match {
        identity: chosen.identity,
        score: chosen.score,
        ambiguous: ties.len() > 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scored(id: u64, score: f32, sightings: u64) -> Scored {
        Scored {
            identity: IdentityId(id),
            score,
            sightings,
            breakdown: BTreeMap::new(),
        }
    }

    #[test]
    fn test_no_candidates() {
        assert_eq!(decide(&[], 0.7, 0.02), Decision::NoCandidates);
    }

    #[test]
    fn test_below_threshold_creates_new() {
        let d = decide(&[scored(1, 0.5, 10)], 0.7, 0.02);
        assert_eq!(d, Decision::NewIdentity { best: 0.5 });
    }

    #[test]
    fn test_clear_winner() {
        let d = decide(&[scored(1, 0.95, 1), scored(2, 0.80, 50)], 0.7, 0.02);
        assert_eq!(
            d,
            Decision::Match {
                identity: IdentityId(1),
                score: 0.95,
                ambiguous: false
            }
        );
    }

    #[test]
    fn test_tie_prefers_more_sightings_and_flags() {
        let d = decide(&[scored(1, 0.90, 3), scored(2, 0.89, 12)], 0.7, 0.02);
        assert_eq!(
            d,
            Decision::Match {
                identity: IdentityId(2),
                score: 0.89,
                ambiguous: true
            }
        );
    }

    #[test]
    fn test_tie_on_sightings_prefers_lower_id() {
        let d = decide(&[scored(7, 0.90, 4), scored(3, 0.90, 4)], 0.7, 0.02);
        assert!(matches!(
            d,
            Decision::Match {
                identity: IdentityId(3),
                ambiguous: true,
                ..
            }
        ));
    }

    #[test]
    fn test_tie_group_never_goes_below_threshold() {
        let d = decide(&[scored(1, 0.71, 1), scored(2, 0.695, 100)], 0.7, 0.02);
        assert!(matches!(
            d,
            Decision::Match {
                identity: IdentityId(1),
                ambiguous: false,
                ..
            }
        ));
    }

    #[test]
    fn test_threshold_monotonicity() {
        let candidates = [scored(1, 0.81, 2), scored(2, 0.66, 9), scored(3, 0.74, 1)];
        let mut matched_before = true;
        for step in 0..=100u8 {
            let threshold = f32::from(step) / 100.0;
            let matched = matches!(
                decide(&candidates, threshold, 0.02),
                Decision::Match { .. }
            );
            // Once raising the threshold stops producing a match, it never
            // produces one again.
            assert!(matched_before || !matched);
            matched_before = matched;
        }
    }

    #[test]
    fn test_rank_orders_best_first() {
        let mut candidates = vec![scored(1, 0.5, 1), scored(2, 0.9, 1), scored(3, 0.9, 5)];
        rank(&mut candidates);
        let ids: Vec<_> = candidates.iter().map(|s| s.identity.0).collect();
        assert_eq!(ids, vec![3, 2, 1]);
    }
}
