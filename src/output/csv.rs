//! CSV export of identities and detections.

use crate::constants::confidence::DECIMAL_PLACES;
use crate::error::{Error, Result};
use crate::registry::profile::{DetectionReport, IdentitySummary};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Flat identity row.
#[derive(Debug, Serialize)]
pub struct IdentityRow {
    id: String,
    label: String,
    species: String,
    sex: String,
    age: String,
    sightings: u64,
    first_seen: String,
    last_seen: String,
    top_location: String,
    quarantined: bool,
}

impl From<&IdentitySummary> for IdentityRow {
    fn from(s: &IdentitySummary) -> Self {
        Self {
            id: s.id.to_string(),
            label: s.label.clone(),
            species: s.species.clone(),
            sex: s.sex.clone(),
            age: s.age.clone(),
            sightings: s.sightings,
            first_seen: s.first_seen.to_rfc3339(),
            last_seen: s.last_seen.to_rfc3339(),
            top_location: s.top_location.clone().unwrap_or_default(),
            quarantined: s.quarantined,
        }
    }
}

/// Flat detection row; list columns are joined with `;`.
#[derive(Debug, Serialize)]
pub struct DetectionRow {
    id: u64,
    state: String,
    camera: String,
    timestamp: String,
    category: String,
    confidence: String,
    identity: String,
    label: String,
    method: String,
    score: String,
    review: String,
    top_candidate: String,
    top_score: String,
    linked_to: String,
    last_error: String,
}

impl From<&DetectionReport> for DetectionRow {
    fn from(r: &DetectionReport) -> Self {
        let top = r.candidates.first();
        Self {
            id: r.id.0,
            state: r.state.to_string(),
            camera: r.camera.clone(),
            timestamp: r.timestamp.to_rfc3339(),
            category: r.category.clone(),
            confidence: format_score(r.confidence),
            identity: r.identity.map(|id| id.to_string()).unwrap_or_default(),
            label: r.label.clone().unwrap_or_default(),
            method: r.method.map(|m| m.to_string()).unwrap_or_default(),
            score: r.score.map(format_score).unwrap_or_default(),
            review: r
                .review
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(";"),
            top_candidate: top.map(|c| c.identity.to_string()).unwrap_or_default(),
            top_score: top.map(|c| format_score(c.score)).unwrap_or_default(),
            linked_to: r.linked_to.map(|id| id.to_string()).unwrap_or_default(),
            last_error: r.last_error.clone().unwrap_or_default(),
        }
    }
}

fn format_score(value: f32) -> String {
    format!("{value:.DECIMAL_PLACES$}")
}

/// Write rows to any writer. `label` names the destination in errors.
pub fn write_rows<W, T>(writer: W, rows: impl IntoIterator<Item = T>, label: &Path) -> Result<usize>
where
    W: Write,
    T: Serialize,
{
    let csv_err = |source| Error::CsvWrite {
        path: label.to_path_buf(),
        source,
    };

    let mut out = csv::Writer::from_writer(writer);
    let mut count = 0;
    for row in rows {
        out.serialize(row).map_err(csv_err)?;
        count += 1;
    }
    out.flush().map_err(|e| csv_err(e.into()))?;
    Ok(count)
}

/// Write rows to a file, or to stdout when `path` is `None`.
pub fn write_csv<T: Serialize>(path: Option<&Path>, rows: impl IntoIterator<Item = T>) -> Result<usize> {
    match path {
        Some(path) => {
            let file = std::fs::File::create(path).map_err(|e| Error::CsvWrite {
                path: path.to_path_buf(),
                source: e.into(),
            })?;
            write_rows(file, rows, path)
        }
        None => write_rows(std::io::stdout().lock(), rows, &PathBuf::from("-")),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::registry::{DetectionId, DetectionState, IdentityId, ReviewFlag};
    use chrono::{TimeZone, Utc};

    fn report() -> DetectionReport {
        DetectionReport {
            id: DetectionId(4),
            state: DetectionState::Unresolved,
            camera: "ridge, north".to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 3, 0, 0).unwrap(),
            category: "lynx/female/adult".to_string(),
            confidence: 0.5,
            identity: None,
            label: None,
            method: None,
            score: None,
            review: vec![ReviewFlag::Ambiguous, ReviewFlag::LowConfidence],
            candidates: Vec::new(),
            linked_to: None,
            rejected: Vec::new(),
            last_error: None,
            embeddings: Vec::new(),
        }
    }

    #[test]
    fn test_detection_rows_quote_and_join() {
        let mut buf = Vec::new();
        let rows = [report()];
        let n = write_rows(&mut buf, rows.iter().map(DetectionRow::from), Path::new("-")).unwrap();
        assert_eq!(n, 1);

        let text = String::from_utf8(buf).unwrap();
        let mut lines = text.lines();
        assert!(lines.next().unwrap().starts_with("id,state,camera,timestamp"));
        let row = lines.next().unwrap();
        assert!(row.starts_with("4,unresolved,\"ridge, north\","));
        assert!(row.contains("ambiguous;low-confidence"));
        assert!(row.contains(",0.5000,"));
    }

    #[test]
    fn test_identity_rows_to_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("ids.csv");
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 3, 0, 0).unwrap();
        let summary = IdentitySummary {
            id: IdentityId(2),
            label: "Nala".to_string(),
            species: "lynx".to_string(),
            sex: "female".to_string(),
            age: "adult".to_string(),
            sightings: 7,
            first_seen: at,
            last_seen: at,
            top_location: Some("ridge".to_string()),
            quarantined: false,
        };

        write_csv(Some(&path), [IdentityRow::from(&summary)]).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("ind-00002,Nala,lynx,female,adult,7,"));
    }
}
