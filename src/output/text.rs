//! Human-readable rendering of command results.

use crate::constants::confidence::DECIMAL_PLACES;
use crate::pipeline::RunSummary;
use crate::registry::Incident;
use crate::registry::corrections::MergeSummary;
use crate::registry::profile::{
    DetectionReport, IdentityProfile, IdentitySummary, RegistryStats, SeasonInfo,
};
use std::fmt::Write;
use std::time::Duration;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M";

fn score(value: f32) -> String {
    format!("{value:.DECIMAL_PLACES$}")
}

fn joined<T: ToString>(items: &[T]) -> String {
    if items.is_empty() {
        return "-".to_string();
    }
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Summary line block for a processing run.
pub fn run_summary(summary: &RunSummary, elapsed: Duration) -> String {
    let mut out = format!(
        "Processed {} detections in {:.1}s\n  matched:    {}\n  created:    {}\n  unresolved: {}\n  duplicates: {}\n  pending:    {}",
        summary.processed,
        elapsed.as_secs_f64(),
        summary.matched,
        summary.created,
        summary.unresolved,
        summary.duplicates,
        summary.pending,
    );
    if summary.cancelled > 0 {
        let _ = write!(out, "\n  cancelled:  {}", summary.cancelled);
    }
    out
}

/// Identity table.
pub fn identity_table(identities: &[IdentitySummary]) -> String {
    if identities.is_empty() {
        return "No identities.".to_string();
    }

    let mut out = format!(
        "{:<10} {:<16} {:<14} {:<8} {:>9}  {:<16}  {:<16}  {}\n",
        "ID", "LABEL", "SPECIES", "SEX", "SIGHTINGS", "FIRST SEEN", "LAST SEEN", "TOP LOCATION"
    );
    for i in identities {
        let _ = writeln!(
            out,
            "{:<10} {:<16} {:<14} {:<8} {:>9}  {:<16}  {:<16}  {}{}",
            i.id.to_string(),
            i.label,
            i.species,
            i.sex,
            i.sightings,
            i.first_seen.format(TIME_FORMAT),
            i.last_seen.format(TIME_FORMAT),
            i.top_location.as_deref().unwrap_or("-"),
            if i.quarantined { "  [quarantined]" } else { "" },
        );
    }
    out.trim_end().to_string()
}

/// Full identity profile.
pub fn identity_profile(profile: &IdentityProfile) -> String {
    let s = &profile.summary;
    let mut out = format!(
        "{} ({})\n  category:   {}/{}/{}\n  sightings:  {}\n  seen:       {} .. {}",
        s.label,
        s.id,
        s.species,
        s.sex,
        s.age,
        s.sightings,
        s.first_seen.format(TIME_FORMAT),
        s.last_seen.format(TIME_FORMAT),
    );
    if s.quarantined {
        out.push_str("\n  status:     QUARANTINED");
    }
    if let Some(hour) = profile.peak_hour {
        let _ = write!(out, "\n  peak hour:  {hour:02}:00 UTC");
    }

    out.push_str("\n  locations:");
    for (camera, count) in &profile.locations {
        let _ = write!(out, "\n    {camera:<20} {count}");
    }
    out.push_str("\n  exemplars:");
    for (viewpoint, exemplar) in &profile.exemplars {
        let _ = write!(
            out,
            "\n    {viewpoint:<20} detection {} ({})",
            exemplar.detection,
            score(exemplar.confidence)
        );
    }
    out.push_str("\n  embeddings:");
    for e in &profile.embeddings {
        let _ = write!(
            out,
            "\n    {}@{} ({} samples)",
            e.extractor, e.version, e.samples
        );
    }
    if !profile.seasons.is_empty() {
        out.push_str("\n  seasons:\n");
        out.push_str(&season_rows(&profile.seasons, "    "));
    }
    let _ = write!(
        out,
        "\n  merged from: {}\n  detections: {}\n  open incidents: {}",
        joined(&profile.merged_from),
        joined(&profile.detections),
        joined(&profile.open_incidents),
    );
    out
}

/// One detection in detail.
pub fn detection_report(report: &DetectionReport) -> String {
    let mut out = format!(
        "Detection {} [{}]\n  camera:     {}\n  time:       {}\n  category:   {}\n  confidence: {}",
        report.id,
        report.state,
        report.camera,
        report.timestamp.to_rfc3339(),
        report.category,
        score(report.confidence),
    );
    if let (Some(id), Some(label)) = (report.identity, &report.label) {
        let _ = write!(out, "\n  identity:   {label} ({id})");
        if let Some(method) = report.method {
            let _ = write!(out, " by {method}");
        }
        if let Some(s) = report.score {
            let _ = write!(out, ", score {}", score(s));
        }
    }
    if !report.review.is_empty() {
        let _ = write!(out, "\n  review:     {}", joined(&report.review));
    }
    if let Some(linked) = report.linked_to {
        let _ = write!(out, "\n  linked to:  {linked}");
    }
    if !report.rejected.is_empty() {
        let _ = write!(out, "\n  rejected:   {}", joined(&report.rejected));
    }
    if let Some(error) = &report.last_error {
        let _ = write!(out, "\n  last error: {error}");
    }
    let _ = write!(out, "\n  embeddings: {}", joined(&report.embeddings));
    for c in &report.candidates {
        let breakdown = c
            .breakdown
            .iter()
            .map(|(name, s)| format!("{name}={}", score(*s)))
            .collect::<Vec<_>>()
            .join(" ");
        let _ = write!(
            out,
            "\n  candidate {} score {} ({} sightings) {breakdown}",
            c.identity,
            score(c.score),
            c.sightings
        );
    }
    out
}

/// Review queue table.
pub fn review_table(queue: &[DetectionReport]) -> String {
    if queue.is_empty() {
        return "Nothing to review.".to_string();
    }

    let mut out = format!(
        "{:<10} {:<12} {:<14} {:<16}  {:<28} {}\n",
        "DETECTION", "STATE", "CAMERA", "TIME", "FLAGS", "TOP CANDIDATE"
    );
    for r in queue {
        let top = r.candidates.first().map_or_else(
            || "-".to_string(),
            |c| format!("{} ({})", c.identity, score(c.score)),
        );
        let _ = writeln!(
            out,
            "{:<10} {:<12} {:<14} {:<16}  {:<28} {top}",
            r.id.to_string(),
            r.state.to_string(),
            r.camera,
            r.timestamp.format(TIME_FORMAT).to_string(),
            joined(&r.review),
        );
    }
    out.trim_end().to_string()
}

fn season_rows(seasons: &[SeasonInfo], indent: &str) -> String {
    seasons
        .iter()
        .map(|s| {
            format!(
                "{indent}{:<14} {:<10} {:>4} sightings  {} .. {}  representative {}",
                s.season,
                s.extractor,
                s.sightings,
                s.first_seen.format(TIME_FORMAT),
                s.last_seen.format(TIME_FORMAT),
                s.representative,
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Seasonal rows of an identity.
pub fn seasons(seasons: &[SeasonInfo]) -> String {
    if seasons.is_empty() {
        return "No seasonal records.".to_string();
    }
    season_rows(seasons, "")
}

/// Incident list.
pub fn incidents(incidents: &[Incident]) -> String {
    if incidents.is_empty() {
        return "No incidents.".to_string();
    }
    incidents
        .iter()
        .map(|i| {
            let detection = i
                .detection
                .map(|d| format!(" while processing detection {d}"))
                .unwrap_or_default();
            format!(
                "#{} {} {}{}: {}{}",
                i.id,
                i.raised_at.format(TIME_FORMAT),
                i.identity,
                detection,
                i.message,
                if i.resolved { " [resolved]" } else { "" },
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Merge result.
pub fn merge(summary: &MergeSummary) -> String {
    format!(
        "Merged into {} ({}): {} detections and {} seasonal rows moved, {} sightings total",
        summary.target.label(),
        summary.target.id,
        summary.moved_detections,
        summary.moved_seasons,
        summary.target.sightings,
    )
}

/// Registry record counts.
pub fn registry_stats(stats: &RegistryStats) -> String {
    let mut out = format!(
        "commit:      {}\nidentities:  {} ({} quarantined)\ndetections:  {}",
        stats.seq, stats.identities, stats.quarantined, stats.detections
    );
    for (state, count) in &stats.by_state {
        let _ = write!(out, "\n  {state:<13} {count}");
    }
    let _ = write!(
        out,
        "\nseasonal:    {}\nincidents:   {} open",
        stats.seasonal_records, stats.open_incidents
    );
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::registry::{DetectionId, DetectionState, IdentityId, ReviewFlag};
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_run_summary_hides_zero_cancelled() {
        let summary = RunSummary {
            processed: 2,
            matched: 1,
            created: 1,
            ..RunSummary::default()
        };
        let text = run_summary(&summary, Duration::from_millis(1500));
        assert!(text.starts_with("Processed 2 detections in 1.5s"));
        assert!(!text.contains("cancelled"));
    }

    #[test]
    fn test_empty_tables() {
        assert_eq!(identity_table(&[]), "No identities.");
        assert_eq!(review_table(&[]), "Nothing to review.");
        assert_eq!(incidents(&[]), "No incidents.");
    }

    #[test]
    fn test_review_table_row() {
        let report = DetectionReport {
            id: DetectionId(12),
            state: DetectionState::Unresolved,
            camera: "ridge".to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 3, 0, 0).unwrap(),
            category: "lynx/female/adult".to_string(),
            confidence: 0.9,
            identity: None,
            label: None,
            method: None,
            score: None,
            review: vec![ReviewFlag::NoCandidates],
            candidates: Vec::new(),
            linked_to: None,
            rejected: vec![IdentityId(3)],
            last_error: None,
            embeddings: vec!["coat@v1".to_string()],
        };
        let table = review_table(std::slice::from_ref(&report));
        let row = table.lines().nth(1).unwrap();
        assert!(row.starts_with("12"));
        assert!(row.contains("no-candidates"));

        let detail = detection_report(&report);
        assert!(detail.contains("rejected:   ind-00003"));
    }
}
