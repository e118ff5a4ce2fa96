//! JSON envelope types for CLI output.
//!
//! In `--output-mode json` every command writes one envelope per line to
//! stdout, so wildreid can sit behind a review frontend or a script.

use crate::error::Error;
use crate::pipeline::RunSummary;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current spec version for JSON envelope.
pub const SPEC_VERSION: &str = "1.0";

/// JSON envelope wrapping all CLI output events.
#[derive(Debug, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: serde::de::DeserializeOwned"))]
pub struct JsonEnvelope<T> {
    /// API specification version.
    pub spec_version: String,
    /// Event timestamp.
    pub timestamp: DateTime<Utc>,
    /// Event type.
    pub event: EventType,
    /// Event-specific payload.
    pub payload: T,
}

impl<T: Serialize> JsonEnvelope<T> {
    /// Create a new envelope with the current timestamp.
    pub fn new(event: EventType, payload: T) -> Self {
        Self {
            spec_version: SPEC_VERSION.to_string(),
            timestamp: Utc::now(),
            event,
            payload,
        }
    }
}

/// Event types for JSON output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A processing run is starting.
    RunStarted,
    /// A processing run finished.
    RunCompleted,
    /// Final result of a query or correction.
    Result,
    /// Error occurred.
    Error,
    /// Run cancelled.
    Cancelled,
}

/// Result type discriminator for result payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultType {
    /// Identity list.
    IdentityList,
    /// One identity profile.
    IdentityProfile,
    /// One detection report.
    DetectionReport,
    /// Detections awaiting review.
    ReviewQueue,
    /// Seasonal trait rows.
    Season,
    /// Open incidents.
    Incidents,
    /// Identity merge.
    Merge,
    /// Other manual correction.
    Correction,
    /// CSV export.
    Export,
    /// Configuration display.
    Config,
    /// Registry maintenance.
    Registry,
}

/// Result payload: a discriminator plus the data.
#[derive(Debug, Clone, Serialize)]
pub struct ResultPayload<'a, T> {
    /// Result type discriminator.
    pub result_type: ResultType,
    /// Command data.
    pub data: &'a T,
}

/// Error severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    /// Fatal error; the command did not complete.
    Fatal,
    /// Warning; the command continued.
    Warning,
}

/// Error payload for error events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Error code (`snake_case` identifier).
    pub code: String,
    /// Error severity.
    pub severity: ErrorSeverity,
    /// Human-readable error message.
    pub message: String,
    /// Suggested action to resolve the error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl ErrorPayload {
    /// Fatal payload for a crate error.
    pub fn fatal(err: &Error) -> Self {
        Self {
            code: error_code(err).to_string(),
            severity: ErrorSeverity::Fatal,
            message: err.to_string(),
            suggestion: suggestion(err),
        }
    }
}

/// Payload for `run_started`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStartedPayload {
    /// Detections queued.
    pub queued: usize,
    /// Detections skipped because the registry already has them.
    pub skipped_known: usize,
    /// Detections marked duplicate during ingest.
    pub spatial_duplicates: usize,
    /// Worker count.
    pub workers: usize,
}

/// Payload for `run_completed` and `cancelled`.
#[derive(Debug, Clone, Serialize)]
pub struct RunCompletedPayload {
    /// Outcome counts.
    #[serde(flatten)]
    pub summary: RunSummary,
    /// Wall time in milliseconds.
    pub duration_ms: u64,
}

/// Stable code for an error.
pub const fn error_code(err: &Error) -> &'static str {
    match err {
        Error::Io(_) => "io",
        Error::ConfigDirNotFound | Error::DataDirNotFound => "platform_dir_not_found",
        Error::ConfigRead { .. } => "config_read",
        Error::ConfigParse { .. } => "config_parse",
        Error::ConfigValidation { .. } => "config_invalid",
        Error::ConfigWrite { .. } | Error::ConfigSerialize { .. } => "config_write",
        Error::InputRead { .. } => "input_read",
        Error::InvalidRecord { .. } => "invalid_record",
        Error::NoInputRecords => "no_input_records",
        Error::ExtractorBuild { .. } => "extractor_build",
        Error::Extraction { .. } => "extraction",
        Error::StoreRead { .. } | Error::StoreParse { .. } => "store_read",
        Error::StoreWrite { .. } | Error::StoreSerialize { .. } => "store_write",
        Error::StoreUnavailable { .. } => "store_unavailable",
        Error::RegistryLocked { .. } => "registry_locked",
        Error::RegistryReadOnly { .. } => "registry_read_only",
        Error::LockCreate { .. } | Error::LockRemove { .. } | Error::LockPoisoned { .. } => {
            "lock"
        }
        Error::IdentityNotFound { .. } => "identity_not_found",
        Error::DetectionNotFound { .. } => "detection_not_found",
        Error::InvalidCorrection { .. } => "invalid_correction",
        Error::Integrity { .. } => "integrity",
        Error::Cancelled => "cancelled",
        Error::CsvWrite { .. } => "csv_write",
        Error::Internal { .. } => "internal",
    }
}

fn suggestion(err: &Error) -> Option<String> {
    match err {
        Error::RegistryLocked { .. } => Some(
            "wait for the other process, or run `wildreid registry unlock` if it crashed"
                .to_string(),
        ),
        Error::ConfigRead { .. } => Some("run `wildreid config init` to create one".to_string()),
        Error::Integrity { .. } => {
            Some("repair or merge the identity, then `wildreid identity release`".to_string())
        }
        _ => None,
    }
}

/// Emit a JSON event to stdout.
pub fn emit_json<T: Serialize>(event: EventType, payload: &T) {
    let envelope = JsonEnvelope::new(event, payload);
    match serde_json::to_string(&envelope) {
        Ok(json) => println!("{json}"),
        Err(e) => {
            // Log to stderr so it doesn't corrupt JSON output stream
            eprintln!("error: failed to serialize JSON output: {e}");
        }
    }
}

/// Emit a JSON result event to stdout.
pub fn emit_json_result<T: Serialize>(result_type: ResultType, data: &T) {
    emit_json(EventType::Result, &ResultPayload { result_type, data });
}
