//! Spatial suppression of overlapping boxes within one source image.

use crate::registry::{Detection, DetectionState};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::debug;

/// Mark overlapping same-species boxes in each image as duplicates.
///
/// Within an image, detections are visited by confidence (highest first,
/// lower id on ties). A detection whose box overlaps an already kept box of
/// the same species with IoU above `iou_threshold` becomes a duplicate
/// linked to that box; every other detection is kept and moves to
/// `deduplicated`. Detections already marked duplicate pass through
/// unchanged, so running the pass twice changes nothing.
pub fn suppress(detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    let mut by_image: BTreeMap<PathBuf, Vec<Detection>> = BTreeMap::new();
    for detection in detections {
        by_image
            .entry(detection.image.clone())
            .or_default()
            .push(detection);
    }

    let mut out = Vec::new();
    for (image, mut group) in by_image {
        group.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then_with(|| a.id.cmp(&b.id))
        });

        let mut kept: Vec<usize> = Vec::new();
        for i in 0..group.len() {
            if group[i].state == DetectionState::Duplicate {
                continue;
            }
            let keeper = kept.iter().copied().find(|&k| {
                group[k].category.species == group[i].category.species
                    && group[k].bbox.iou(&group[i].bbox) > iou_threshold
            });
            match keeper {
                Some(k) => {
                    let keeper_id = group[k].id;
                    let duplicate = &mut group[i];
                    debug!(
                        "Detection {} duplicates {keeper_id} in {}",
                        duplicate.id,
                        image.display()
                    );
                    duplicate.state = DetectionState::Duplicate;
                    duplicate.linked_to = Some(keeper_id);
                }
                None => {
                    if group[i].state == DetectionState::Pending {
                        group[i].state = DetectionState::Deduplicated;
                    }
                    kept.push(i);
                }
            }
        }
        out.extend(group);
    }

    out.sort_by_key(|d| d.id);
    out
}
