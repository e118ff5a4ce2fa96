//! Temporal linking of consecutive frames at one camera.
//!
//! A camera trap fires bursts: the same animal shows up in several frames a
//! few seconds apart. Frames whose primary embeddings are near-identical
//! within the trailing window are linked to the first frame of the burst
//! and not matched on their own.

use crate::config::DedupConfig;
use crate::embedding::{ExtractorSpec, cosine_similarity};
use crate::registry::{Detection, DetectionId};
use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct Recent {
    id: DetectionId,
    root: DetectionId,
    timestamp: DateTime<Utc>,
    species: String,
    vector: Vec<f32>,
}

/// Recency window of one camera.
///
/// Frames must be offered in non-decreasing timestamp order.
#[derive(Debug, Clone)]
pub struct CameraWindow {
    window: Duration,
    similarity: f32,
    extractor: String,
    version: String,
    recent: VecDeque<Recent>,
    latest: Option<DateTime<Utc>>,
}

impl CameraWindow {
    /// Empty window comparing `primary` embeddings.
    pub fn new(config: &DedupConfig, primary: &ExtractorSpec) -> Self {
        let window = i64::try_from(config.temporal_window_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .unwrap_or(Duration::MAX);
        Self {
            window,
            similarity: config.temporal_similarity,
            extractor: primary.name.clone(),
            version: primary.version.clone(),
            recent: VecDeque::new(),
            latest: None,
        }
    }

    /// Remember an already-processed frame without testing it.
    pub fn prime(&mut self, detection: &Detection) {
        let root = detection.linked_to.unwrap_or(detection.id);
        self.remember(detection, root);
    }

    /// Test a frame against the window and remember it.
    ///
    /// Returns the first frame of the burst when the frame continues one.
    pub fn link(&mut self, detection: &Detection) -> Option<DetectionId> {
        if let Some(latest) = self.latest
            && detection.timestamp < latest
        {
            warn!(
                "Detection {} at {} arrived out of order (latest {latest}); not linked",
                detection.id, detection.timestamp
            );
            return None;
        }

        self.evict(detection.timestamp);
        let embedding = detection.embedding(&self.extractor, &self.version)?;

        let best = self
            .recent
            .iter()
            .filter(|r| r.species == detection.category.species)
            .filter_map(|r| cosine_similarity(&embedding.vector, &r.vector).map(|sim| (r, sim)))
            .filter(|(_, sim)| *sim >= self.similarity)
            .max_by(|a, b| {
                a.1.total_cmp(&b.1)
                    .then_with(|| a.0.timestamp.cmp(&b.0.timestamp))
            })
            .map(|(r, sim)| (r.root, r.id, sim));

        let root = best.map_or(detection.id, |(root, _, _)| root);
        self.remember(detection, root);

        let (root, previous, similarity) = best?;
        debug!(
            "Detection {} continues {previous} (similarity {similarity:.3}), burst of {root}",
            detection.id
        );
        Some(root)
    }

    /// Drop a frame whose decision was never committed.
    ///
    /// Later frames must not continue a burst rooted at a detection that
    /// belongs to no identity.
    pub fn forget(&mut self, id: DetectionId) {
        self.recent.retain(|r| r.id != id && r.root != id);
    }

    fn remember(&mut self, detection: &Detection, root: DetectionId) {
        self.latest = Some(
            self.latest
                .map_or(detection.timestamp, |l| l.max(detection.timestamp)),
        );
        let Some(embedding) = detection.embedding(&self.extractor, &self.version) else {
            return;
        };
        self.recent.push_back(Recent {
            id: detection.id,
            root,
            timestamp: detection.timestamp,
            species: detection.category.species.clone(),
            vector: embedding.vector.clone(),
        });
    }

    fn evict(&mut self, now: DateTime<Utc>) {
        while let Some(front) = self.recent.front() {
            if now - front.timestamp > self.window {
                self.recent.pop_front();
            } else {
                break;
            }
        }
    }

    /// Length of the trailing window.
    pub const fn span(&self) -> Duration {
        self.window
    }

    /// Frames currently in the window.
    pub fn len(&self) -> usize {
        self.recent.len()
    }

    /// Whether the window is empty.
    pub fn is_empty(&self) -> bool {
        self.recent.is_empty()
    }
}
