//! Bounded worker pool over camera lanes.
//!
//! Detections are grouped by camera and each lane is walked in capture
//! order, which temporal linking relies on. Lanes run concurrently; a
//! semaphore caps how many detections are in flight across all lanes.

use crate::config::DedupConfig;
use crate::dedup::CameraWindow;
use crate::error::{Error, Result};
use crate::output::progress::inc_progress;
use crate::pipeline::orchestrator::{Orchestrator, Outcome};
use crate::registry::{DetectionId, RegistryState};
use chrono::{DateTime, Utc};
use indicatif::ProgressBar;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info};

/// Counts of one processing run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Detections handed to the pool.
    pub processed: usize,
    /// Joined an existing identity.
    pub matched: usize,
    /// Seeded a new identity.
    pub created: usize,
    /// Left for review.
    pub unresolved: usize,
    /// Linked to another frame.
    pub duplicates: usize,
    /// Failed and still pending.
    pub pending: usize,
    /// Not processed because of cancellation.
    pub cancelled: usize,
}

impl RunSummary {
    fn record(&mut self, outcome: &Outcome) {
        self.processed += 1;
        match outcome {
            Outcome::Matched { .. } => self.matched += 1,
            Outcome::Created { .. } => self.created += 1,
            Outcome::Unresolved { .. } => self.unresolved += 1,
            Outcome::Duplicate { .. } => self.duplicates += 1,
            Outcome::Pending { .. } => self.pending += 1,
            Outcome::Cancelled => self.cancelled += 1,
        }
    }

    fn absorb(&mut self, other: &Self) {
        self.processed += other.processed;
        self.matched += other.matched;
        self.created += other.created;
        self.unresolved += other.unresolved;
        self.duplicates += other.duplicates;
        self.pending += other.pending;
        self.cancelled += other.cancelled;
    }
}

/// Runs detections through an orchestrator with bounded concurrency.
pub struct WorkerPool {
    orchestrator: Arc<Orchestrator>,
    workers: usize,
    dedup: DedupConfig,
}

impl WorkerPool {
    /// Pool with `workers` concurrent detections.
    pub fn new(orchestrator: Arc<Orchestrator>, workers: usize, dedup: DedupConfig) -> Self {
        Self {
            orchestrator,
            workers: workers.max(1),
            dedup,
        }
    }

    /// Process the given detections and wait for all of them.
    pub async fn run(
        &self,
        ids: &[DetectionId],
        progress: Option<&ProgressBar>,
    ) -> Result<RunSummary> {
        let lanes = self
            .orchestrator
            .registry()
            .read(|state| self.plan(state, ids))?;
        info!(
            "Processing {} detections from {} cameras with {} workers",
            ids.len(),
            lanes.len(),
            self.workers
        );

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();

        for (camera, (lane, mut window)) in lanes {
            let orchestrator = Arc::clone(&self.orchestrator);
            let semaphore = Arc::clone(&semaphore);
            let progress = progress.cloned();

            tasks.spawn(async move {
                let mut summary = RunSummary::default();
                for id in lane {
                    if orchestrator.cancel_flag().is_cancelled() {
                        summary.record(&Outcome::Cancelled);
                        continue;
                    }
                    let Ok(_permit) = semaphore.acquire().await else {
                        summary.record(&Outcome::Cancelled);
                        continue;
                    };
                    let outcome = orchestrator.process(id, window.as_mut()).await;
                    if matches!(outcome, Outcome::Pending { .. } | Outcome::Cancelled)
                        && let Some(window) = window.as_mut()
                    {
                        window.forget(id);
                    }
                    summary.record(&outcome);
                    inc_progress(progress.as_ref());
                }
                debug!("Camera {camera}: {} detections done", summary.processed);
                summary
            });
        }

        let mut total = RunSummary::default();
        while let Some(joined) = tasks.join_next().await {
            let summary = joined.map_err(|e| Error::Internal {
                message: format!("worker task failed: {e}"),
            })?;
            total.absorb(&summary);
        }
        Ok(total)
    }

    /// Group detections into per-camera lanes in capture order, each with a
    /// recency window primed from already processed frames.
    fn plan(
        &self,
        state: &RegistryState,
        ids: &[DetectionId],
    ) -> BTreeMap<String, (Vec<DetectionId>, Option<CameraWindow>)> {
        let queued: HashSet<DetectionId> = ids.iter().copied().collect();
        let mut lanes: BTreeMap<String, Vec<_>> = BTreeMap::new();
        for detection in ids.iter().filter_map(|id| state.detections.get(id)) {
            lanes
                .entry(detection.camera.clone())
                .or_default()
                .push((detection.timestamp, detection.id));
        }

        lanes
            .into_iter()
            .map(|(camera, mut lane)| {
                lane.sort();
                let window = lane
                    .first()
                    .and_then(|(start, _)| self.window(state, &camera, *start, &queued));
                let ids = lane.into_iter().map(|(_, id)| id).collect();
                (camera, (ids, window))
            })
            .collect()
    }

    fn window(
        &self,
        state: &RegistryState,
        camera: &str,
        start: DateTime<Utc>,
        queued: &HashSet<DetectionId>,
    ) -> Option<CameraWindow> {
        if self.dedup.temporal_window_secs == 0 {
            return None;
        }
        let mut window = CameraWindow::new(&self.dedup, self.orchestrator.primary());
        let earliest = start
            .checked_sub_signed(window.span())
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut history: Vec<_> = state
            .detections
            .values()
            .filter(|d| d.camera == camera && d.state.is_terminal())
            .filter(|d| !queued.contains(&d.id))
            .filter(|d| d.timestamp >= earliest && d.timestamp <= start)
            .collect();
        history.sort_by_key(|d| (d.timestamp, d.id));
        for detection in history {
            window.prime(detection);
        }
        Some(window)
    }
}
