//! Detection record parsing.
//!
//! The upstream detector writes one JSON object per line:
//!
//! ```text
//! {"id": 17, "image": "frames/0001.jpg", "crop": "crops/17.jpg",
//!  "bbox": [12, 40, 220, 310], "species": "lynx", "sex": "male",
//!  "age": "adult", "confidence": 0.91, "timestamp": "2024-03-01T22:00:00Z",
//!  "camera": "cam-03", "viewpoint": "left",
//!  "embeddings": [{"extractor": "body", "version": "v1", "vector": [...]}]}
//! ```
//!
//! `sex`, `age`, `viewpoint` and `embeddings` are optional. Relative image
//! and crop paths are resolved against the directory of the input file.

use crate::constants::confidence;
use crate::embedding::Embedding;
use crate::error::{Error, Result};
use crate::registry::{
    AgeClass, BoundingBox, Category, Detection, DetectionId, DetectionState, Sex,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashSet;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Internal record for JSON deserialization.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DetectionRecord {
    id: u64,
    image: PathBuf,
    crop: PathBuf,
    bbox: [f32; 4],
    species: String,
    #[serde(default)]
    sex: Sex,
    #[serde(default)]
    age: AgeClass,
    confidence: f32,
    timestamp: DateTime<Utc>,
    camera: String,
    #[serde(default)]
    viewpoint: Option<String>,
    #[serde(default)]
    embeddings: Vec<EmbeddingRecord>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingRecord {
    extractor: String,
    version: String,
    vector: Vec<f32>,
}

/// Collect detection files from paths; directories are searched
/// recursively for `.jsonl` files.
pub fn collect_input_files(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();

    for path in paths {
        if path.is_file() {
            files.push(path.clone());
        } else if path.is_dir() {
            collect_jsonl_recursive(path, &mut files)?;
        } else {
            warn!("Skipping non-existent path: {}", path.display());
        }
    }

    files.sort();
    files.dedup();
    Ok(files)
}

fn collect_jsonl_recursive(dir: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_jsonl_recursive(&path, files)?;
        } else if path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case(OsStr::new("jsonl")))
        {
            files.push(path);
        }
    }
    Ok(())
}

/// Parse every detection file, rejecting ids repeated across files.
pub fn parse_inputs(files: &[PathBuf]) -> Result<Vec<Detection>> {
    let mut seen = HashSet::new();
    let mut detections = Vec::new();

    for file in files {
        for (line, detection) in parse_detection_file(file)? {
            if !seen.insert(detection.id) {
                return Err(Error::InvalidRecord {
                    path: file.clone(),
                    line,
                    message: format!("detection id {} appears more than once", detection.id),
                });
            }
            detections.push(detection);
        }
    }

    if detections.is_empty() {
        return Err(Error::NoInputRecords);
    }
    Ok(detections)
}

/// Parse one JSON-lines detection file.
///
/// Returns each detection with its 1-based line number. Blank lines are
/// skipped.
///
/// # Errors
///
/// Returns an error if the file cannot be read or any record is malformed:
/// unknown fields, an empty species or camera, a confidence outside
/// `[0, 1]`, a degenerate box, an invalid vector, or two embeddings from the
/// same extractor.
pub fn parse_detection_file(path: &Path) -> Result<Vec<(usize, Detection)>> {
    let content = std::fs::read_to_string(path).map_err(|e| Error::InputRead {
        path: path.to_path_buf(),
        source: e,
    })?;
    let base = path.parent().unwrap_or_else(|| Path::new(""));

    let mut detections = Vec::new();
    for (index, raw) in content.lines().enumerate() {
        let line = index + 1;
        let raw = raw.trim_start_matches('\u{feff}').trim();
        if raw.is_empty() {
            continue;
        }

        let invalid = |message: String| Error::InvalidRecord {
            path: path.to_path_buf(),
            line,
            message,
        };
        let record: DetectionRecord =
            serde_json::from_str(raw).map_err(|e| invalid(e.to_string()))?;
        let detection = into_detection(record, base).map_err(invalid)?;
        detections.push((line, detection));
    }

    debug!(
        "Parsed {} detections from {}",
        detections.len(),
        path.display()
    );
    Ok(detections)
}

fn into_detection(record: DetectionRecord, base: &Path) -> std::result::Result<Detection, String> {
    if record.species.trim().is_empty() {
        return Err("species must not be empty".to_string());
    }
    if record.camera.trim().is_empty() {
        return Err("camera must not be empty".to_string());
    }
    if !(confidence::MIN..=confidence::MAX).contains(&record.confidence) {
        return Err(format!(
            "confidence {} is outside [{}, {}]",
            record.confidence,
            confidence::MIN,
            confidence::MAX
        ));
    }

    let [x1, y1, x2, y2] = record.bbox;
    let bbox = BoundingBox { x1, y1, x2, y2 };
    if record.bbox.iter().any(|v| !v.is_finite()) || x2 <= x1 || y2 <= y1 {
        return Err(format!("degenerate bounding box {:?}", record.bbox));
    }

    let mut embeddings: Vec<Embedding> = Vec::with_capacity(record.embeddings.len());
    for e in record.embeddings {
        if embeddings.iter().any(|x| x.extractor == e.extractor) {
            return Err(format!("two embeddings from extractor '{}'", e.extractor));
        }
        let embedding = Embedding::new(&e.extractor, &e.version, e.vector).ok_or_else(|| {
            format!(
                "embedding '{}' is empty, non-finite or all zero",
                e.extractor
            )
        })?;
        embeddings.push(embedding);
    }
    embeddings.sort_by(|a, b| a.extractor.cmp(&b.extractor));

    Ok(Detection {
        id: DetectionId(record.id),
        image: resolve(base, record.image),
        crop: resolve(base, record.crop),
        bbox,
        category: Category {
            species: record.species.trim().to_string(),
            sex: record.sex,
            age: record.age,
        },
        confidence: record.confidence,
        timestamp: record.timestamp,
        camera: record.camera.trim().to_string(),
        viewpoint: record.viewpoint.filter(|v| !v.trim().is_empty()),
        embeddings,
        state: DetectionState::Pending,
        assignment: None,
        review: Vec::new(),
        candidates: Vec::new(),
        linked_to: None,
        rejected: Vec::new(),
        last_error: None,
        attempts: 0,
    })
}

fn resolve(base: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}
