//! End-to-end processing of one detection.
//!
//! `deduplicated -> embedded -> decision`, with the decision committed in a
//! single registry commit. Identity creation for a category happens under
//! that category's lock and re-scores first, so two workers seeing the same
//! new animal at once produce one identity, not two.

use crate::config::{Config, MatchingConfig};
use crate::constants::matching::MAX_DECISION_ROUNDS;
use crate::dedup::CameraWindow;
use crate::embedding::{Extraction, ExtractorSet, ExtractorSpec};
use crate::error::{Error, Result};
use crate::fusion::{Decision, Scored, category, decide, score_candidates};
use crate::locking::CategoryLocks;
use crate::pipeline::retry::{Backoff, CancelFlag};
use crate::pipeline::state;
use crate::registry::{
    Assignment, AssignmentMethod, CandidateScore, Detection, DetectionId, DetectionState,
    IdentityId, Mutation, Registry, ReviewFlag, SightingPolicy, integrity, sighting,
};
use std::future::ready;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Final result of processing one detection.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Joined an existing identity.
    Matched {
        /// Chosen identity.
        identity: IdentityId,
        /// Fused score.
        score: f32,
        /// Tied with another candidate.
        ambiguous: bool,
    },
    /// Seeded a new identity.
    Created {
        /// New identity.
        identity: IdentityId,
    },
    /// Left for a reviewer.
    Unresolved {
        /// Why.
        flags: Vec<ReviewFlag>,
    },
    /// Linked to another detection.
    Duplicate {
        /// Detection it duplicates.
        of: DetectionId,
    },
    /// Failed; stays pending.
    Pending {
        /// Last error.
        error: String,
    },
    /// Stopped at a state boundary.
    Cancelled,
}

impl Outcome {
    /// Outcome already recorded on a decided detection.
    fn recorded(detection: &Detection) -> Option<Self> {
        match detection.state {
            DetectionState::Duplicate => Some(Self::Duplicate {
                of: detection.linked_to.unwrap_or(detection.id),
            }),
            DetectionState::Matched | DetectionState::NewIdentity => {
                let assignment = detection.assignment.as_ref()?;
                Some(match assignment.method {
                    AssignmentMethod::Created => Self::Created {
                        identity: assignment.identity,
                    },
                    AssignmentMethod::Matched | AssignmentMethod::Manual => Self::Matched {
                        identity: assignment.identity,
                        score: assignment.score.unwrap_or(1.0),
                        ambiguous: detection.review.contains(&ReviewFlag::Ambiguous),
                    },
                })
            }
            DetectionState::Unresolved => Some(Self::Unresolved {
                flags: detection.review.clone(),
            }),
            _ => None,
        }
    }
}

enum Verdict {
    Done(Outcome),
    Rescore,
    Quarantined(u64),
}

/// Processes detections against a shared registry.
pub struct Orchestrator {
    registry: Arc<Registry>,
    extractors: ExtractorSet,
    policy: SightingPolicy,
    primary: ExtractorSpec,
    matching: MatchingConfig,
    locks: CategoryLocks,
    backoff: Backoff,
    cancel: CancelFlag,
}

impl Orchestrator {
    /// Wire an orchestrator from configuration.
    pub fn new(
        registry: Arc<Registry>,
        extractors: ExtractorSet,
        config: &Config,
        cancel: CancelFlag,
    ) -> Result<Self> {
        let primary = extractors
            .primary()
            .cloned()
            .ok_or_else(|| Error::ConfigValidation {
                message: "at least one extractor is required".to_string(),
            })?;
        let policy = SightingPolicy::new(
            extractors.specs(),
            config.seasonal.clone(),
            config.matching.min_blend_weight,
        );

        Ok(Self {
            registry,
            extractors,
            policy,
            primary,
            matching: config.matching.clone(),
            locks: CategoryLocks::new(),
            backoff: Backoff::from_config(&config.workers),
            cancel,
        })
    }

    /// Registry handle.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Sighting policy shared with manual corrections.
    pub const fn policy(&self) -> &SightingPolicy {
        &self.policy
    }

    /// Primary extractor.
    pub const fn primary(&self) -> &ExtractorSpec {
        &self.primary
    }

    /// Cancellation flag.
    pub const fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    /// Process one detection to a final state.
    ///
    /// `window` is the recency window of the detection's camera; pass
    /// `None` to skip temporal linking. Failures never escape: the detection
    /// stays pending with the error recorded on it.
    pub async fn process(&self, id: DetectionId, window: Option<&mut CameraWindow>) -> Outcome {
        let mut detection = match self.registry.detection(id) {
            Ok(detection) => detection,
            Err(e) => {
                warn!("Detection {id} could not be loaded: {e}");
                return Outcome::Pending {
                    error: e.to_string(),
                };
            }
        };
        if let Some(outcome) = Outcome::recorded(&detection) {
            debug!("Detection {id} already decided ({})", detection.state);
            return outcome;
        }

        match self.attempt(&mut detection, window).await {
            Ok(outcome) => outcome,
            Err(Error::Cancelled) => {
                debug!("Detection {id} cancelled in state {}", detection.state);
                Outcome::Cancelled
            }
            Err(e) => self.fail(detection, &e),
        }
    }

    async fn attempt(
        &self,
        detection: &mut Detection,
        window: Option<&mut CameraWindow>,
    ) -> Result<Outcome> {
        self.cancel.check()?;
        state::ready_for_matching(detection)?;
        detection.clear_decision();

        for outcome in self.extractors.extract(detection).await {
            match outcome {
                Extraction::Vector(embedding) => {
                    detection
                        .embeddings
                        .retain(|e| e.extractor != embedding.extractor);
                    detection.embeddings.push(embedding);
                }
                // A vector the extractor set refused never reaches scoring
                // or seeding.
                Extraction::Unavailable { extractor, reason } => {
                    let before = detection.embeddings.len();
                    detection.embeddings.retain(|e| e.extractor != extractor);
                    if detection.embeddings.len() < before {
                        warn!(
                            "Dropped {extractor} embedding of detection {}: {reason}",
                            detection.id
                        );
                    }
                }
            }
        }
        detection
            .embeddings
            .sort_by(|a, b| a.extractor.cmp(&b.extractor));
        state::transition(detection, DetectionState::Embedded)?;
        self.cancel.check()?;

        if let Some(window) = window
            && let Some(root) = window.link(detection)
        {
            state::transition(detection, DetectionState::Duplicate)?;
            detection.linked_to = Some(root);
            self.save(detection).await?;
            debug!("Detection {} linked to burst of {root}", detection.id);
            return Ok(Outcome::Duplicate { of: root });
        }

        if detection.confidence < self.matching.low_confidence {
            detection.flag(ReviewFlag::LowConfidence);
        }
        self.cancel.check()?;
        self.decide(detection).await
    }

    async fn decide(&self, detection: &Detection) -> Result<Outcome> {
        for _ in 0..MAX_DECISION_ROUNDS {
            let scored = self.registry.read(|s| {
                score_candidates(s, &self.policy, detection, self.matching.shortlist)
            })?;
            let Some(scored) = scored else {
                return self.unresolved(detection, ReviewFlag::NoEmbedding, &[]).await;
            };

            let verdict = match decide(&scored, self.matching.threshold, self.matching.tie_epsilon)
            {
                Decision::Match {
                    identity,
                    score,
                    ambiguous,
                } => self.join(detection, &scored, identity, score, ambiguous).await?,
                Decision::NewIdentity { best } => {
                    debug!(
                        "Detection {}: best score {best:.3} below threshold",
                        detection.id
                    );
                    self.create(detection).await?
                }
                Decision::NoCandidates => self.create(detection).await?,
            };
            if let Some(outcome) = self.settle(verdict)? {
                return Ok(outcome);
            }
        }

        Err(Error::Internal {
            message: format!(
                "no stable decision for detection {} after {MAX_DECISION_ROUNDS} rounds",
                detection.id
            ),
        })
    }

    fn settle(&self, verdict: Verdict) -> Result<Option<Outcome>> {
        match verdict {
            Verdict::Done(outcome) => Ok(Some(outcome)),
            Verdict::Rescore => Ok(None),
            Verdict::Quarantined(incident) => {
                if let Some(incident) = self.registry.read(|s| s.incidents.get(&incident).cloned())? {
                    integrity::report(&incident);
                }
                Ok(None)
            }
        }
    }

    /// Commit the match, validating the chosen identity under the write lock.
    async fn join(
        &self,
        detection: &Detection,
        scored: &[Scored],
        identity: IdentityId,
        score: f32,
        ambiguous: bool,
    ) -> Result<Verdict> {
        let candidates = self.top(scored);
        let verdict = self
            .backoff
            .run("match commit", &self.cancel, || {
                ready(self.registry.commit(|state| {
                    let Some(target) = state.identities.get(&identity).filter(|i| !i.quarantined)
                    else {
                        return Ok((Vec::new(), Verdict::Rescore));
                    };
                    if let Err(e) = integrity::check(target, &self.primary.name) {
                        let incident = state.next_incident_id();
                        let mutations = integrity::quarantine(
                            target,
                            incident,
                            Some(detection.id),
                            &integrity::violation_message(&e),
                        );
                        return Ok((mutations, Verdict::Quarantined(incident)));
                    }

                    let mut updated = detection.clone();
                    state::transition(&mut updated, DetectionState::Matched)?;
                    updated.assignment = Some(Assignment {
                        identity,
                        method: AssignmentMethod::Matched,
                        score: Some(score),
                    });
                    updated.candidates.clone_from(&candidates);
                    if ambiguous {
                        updated.flag(ReviewFlag::Ambiguous);
                    }

                    let mut mutations = sighting::join(state, target, &updated, &self.policy);
                    mutations.push(Mutation::detection(updated));
                    Ok((
                        mutations,
                        Verdict::Done(Outcome::Matched {
                            identity,
                            score,
                            ambiguous,
                        }),
                    ))
                }))
            })
            .await?;

        if matches!(verdict, Verdict::Done(_)) {
            debug!(
                "Detection {} matched {identity} (score {score:.3}{})",
                detection.id,
                if ambiguous { ", ambiguous" } else { "" }
            );
        }
        Ok(verdict)
    }

    /// Seed a new identity under the category lock, unless re-scoring under
    /// the lock finds one created meanwhile.
    async fn create(&self, detection: &Detection) -> Result<Verdict> {
        let _guard = self
            .locks
            .lock(category::partition_key(&detection.category))
            .await?;

        let scored = self
            .registry
            .read(|s| score_candidates(s, &self.policy, detection, self.matching.shortlist))?
            .unwrap_or_default();
        match decide(&scored, self.matching.threshold, self.matching.tie_epsilon) {
            Decision::Match {
                identity,
                score,
                ambiguous,
            } => return self.join(detection, &scored, identity, score, ambiguous).await,
            Decision::NoCandidates if !self.matching.auto_create_on_no_candidates => {
                return self
                    .unresolved(detection, ReviewFlag::NoCandidates, &scored)
                    .await
                    .map(Verdict::Done);
            }
            Decision::NewIdentity { .. } | Decision::NoCandidates => {}
        }
        if !self.policy.can_seed(detection) {
            return self
                .unresolved(detection, ReviewFlag::NoEmbedding, &scored)
                .await
                .map(Verdict::Done);
        }

        let candidates = self.top(&scored);
        let identity = self
            .backoff
            .run("identity creation", &self.cancel, || {
                ready(self.registry.commit(|state| {
                    let id = state.next_identity_id();
                    let mut updated = detection.clone();
                    state::transition(&mut updated, DetectionState::NewIdentity)?;
                    updated.assignment = Some(Assignment {
                        identity: id,
                        method: AssignmentMethod::Created,
                        score: None,
                    });
                    updated.candidates.clone_from(&candidates);

                    let mut mutations = sighting::seed(id, &updated, &self.policy);
                    mutations.push(Mutation::detection(updated));
                    Ok((mutations, id))
                }))
            })
            .await?;

        info!(
            "Detection {} seeded identity {identity} ({})",
            detection.id, detection.category
        );
        Ok(Verdict::Done(Outcome::Created { identity }))
    }

    async fn unresolved(
        &self,
        detection: &Detection,
        flag: ReviewFlag,
        scored: &[Scored],
    ) -> Result<Outcome> {
        let mut updated = detection.clone();
        state::transition(&mut updated, DetectionState::Unresolved)?;
        updated.flag(flag);
        updated.candidates = self.top(scored);
        self.save(&updated).await?;

        debug!("Detection {} left for review ({flag})", detection.id);
        Ok(Outcome::Unresolved {
            flags: updated.review,
        })
    }

    async fn save(&self, detection: &Detection) -> Result<()> {
        self.backoff
            .run("detection update", &self.cancel, || {
                ready(
                    self.registry
                        .commit(|_| Ok((vec![Mutation::detection(detection.clone())], ()))),
                )
            })
            .await
    }

    /// Record a failed attempt. Embeddings computed so far are kept.
    fn fail(&self, mut detection: Detection, err: &Error) -> Outcome {
        let message = err.to_string();
        warn!("Detection {} stays pending: {message}", detection.id);

        detection.clear_decision();
        detection.state = DetectionState::Pending;
        detection.linked_to = None;
        detection.last_error = Some(message.clone());
        detection.attempts += 1;
        let id = detection.id;
        if let Err(e) = self
            .registry
            .commit(|_| Ok((vec![Mutation::detection(detection)], ())))
        {
            error!("Could not record failure of detection {id}: {e}");
        }
        Outcome::Pending { error: message }
    }

    fn top(&self, scored: &[Scored]) -> Vec<CandidateScore> {
        scored
            .iter()
            .take(self.matching.review_candidates)
            .map(|s| CandidateScore {
                identity: s.identity,
                score: s.score,
                sightings: s.sightings,
                breakdown: s.breakdown.clone(),
            })
            .collect()
    }
}

/// Per-call extractor timeout from worker settings.
pub fn extractor_timeout(config: &Config) -> Duration {
    Duration::from_millis(config.workers.extractor_timeout_ms)
}
