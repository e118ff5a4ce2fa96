//! Error types for wildreid.

use crate::registry::{DetectionId, IdentityId};

/// Result type alias for wildreid operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for wildreid.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration directory could not be determined.
    #[error("could not determine configuration directory for this platform")]
    ConfigDirNotFound,

    /// Data directory could not be determined.
    #[error("could not determine data directory for this platform")]
    DataDirNotFound,

    /// Failed to read configuration file.
    #[error("failed to read config file '{path}'")]
    ConfigRead {
        /// Path to the config file.
        path: std::path::PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse configuration file.
    #[error("failed to parse config file '{path}'")]
    ConfigParse {
        /// Path to the config file.
        path: std::path::PathBuf,
        /// Underlying parse error.
        #[source]
        source: toml::de::Error,
    },

    /// Configuration validation failed.
    #[error("configuration validation failed: {message}")]
    ConfigValidation {
        /// Description of the validation failure.
        message: String,
    },

    /// Failed to write configuration file.
    #[error("failed to write config file '{path}'")]
    ConfigWrite {
        /// Path to the config file.
        path: std::path::PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to serialize configuration.
    #[error("failed to serialize config")]
    ConfigSerialize {
        /// Underlying serialization error.
        #[source]
        source: toml::ser::Error,
    },

    /// Failed to read an upstream detection file.
    #[error("failed to read detection file '{path}'")]
    InputRead {
        /// Path to the detection file.
        path: std::path::PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// An upstream detection record is malformed.
    #[error("invalid detection record in '{path}' line {line}: {message}")]
    InvalidRecord {
        /// Path to the detection file.
        path: std::path::PathBuf,
        /// 1-based line number.
        line: usize,
        /// Description of the problem.
        message: String,
    },

    /// No detection records found in the provided inputs.
    #[error("no detection records found in the provided paths")]
    NoInputRecords,

    /// Failed to build an embedding extractor.
    #[error("failed to build extractor '{extractor}': {reason}")]
    ExtractorBuild {
        /// Extractor name.
        extractor: String,
        /// Description of the build failure.
        reason: String,
    },

    /// An extractor could not embed a crop.
    #[error("extractor '{extractor}' failed: {reason}")]
    Extraction {
        /// Extractor name.
        extractor: String,
        /// Description of the failure.
        reason: String,
    },

    /// Failed to read the registry snapshot or journal.
    #[error("failed to read registry file '{path}'")]
    StoreRead {
        /// Path to the registry file.
        path: std::path::PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse the registry snapshot.
    #[error("failed to parse registry file '{path}'")]
    StoreParse {
        /// Path to the registry file.
        path: std::path::PathBuf,
        /// Underlying parse error.
        #[source]
        source: serde_json::Error,
    },

    /// Failed to write the registry snapshot or journal.
    #[error("failed to write registry file '{path}'")]
    StoreWrite {
        /// Path to the registry file.
        path: std::path::PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to serialize registry state.
    #[error("failed to serialize registry state")]
    StoreSerialize {
        /// Underlying serialization error.
        #[source]
        source: serde_json::Error,
    },

    /// The registry store is temporarily unavailable.
    #[error("registry store unavailable: {reason}")]
    StoreUnavailable {
        /// Description of the outage.
        reason: String,
    },

    /// Registry directory is locked by another process.
    #[error("registry is locked by another process: {path}")]
    RegistryLocked {
        /// Path to the lock file.
        path: std::path::PathBuf,
    },

    /// A write was attempted on a registry opened for queries only.
    #[error("registry '{path}' is open read-only")]
    RegistryReadOnly {
        /// Registry directory.
        path: std::path::PathBuf,
    },

    /// Failed to create lock file.
    #[error("failed to create lock file '{path}'")]
    LockCreate {
        /// Path to the lock file.
        path: std::path::PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to remove lock file.
    #[error("failed to remove lock file '{path}'")]
    LockRemove {
        /// Path to the lock file.
        path: std::path::PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// An in-process lock was poisoned by a panicking thread.
    #[error("lock poisoned: {what}")]
    LockPoisoned {
        /// Which lock.
        what: &'static str,
    },

    /// Identity not found in the registry.
    #[error("identity {id} not found")]
    IdentityNotFound {
        /// Missing identity.
        id: IdentityId,
    },

    /// Detection not found in the registry.
    #[error("detection {id} not found")]
    DetectionNotFound {
        /// Missing detection.
        id: DetectionId,
    },

    /// A manual correction was rejected.
    #[error("invalid correction: {message}")]
    InvalidCorrection {
        /// Why the correction was rejected.
        message: String,
    },

    /// A registry record violates a data-integrity invariant.
    #[error("integrity violation on identity {identity}: {message}")]
    Integrity {
        /// Offending identity.
        identity: IdentityId,
        /// Description of the violation.
        message: String,
    },

    /// Processing was cancelled at a state boundary.
    #[error("processing cancelled")]
    Cancelled,

    /// Failed to write CSV output.
    #[error("failed to write CSV output '{path}'")]
    CsvWrite {
        /// Path to the CSV file.
        path: std::path::PathBuf,
        /// Underlying CSV error.
        #[source]
        source: csv::Error,
    },

    /// Internal error (for unexpected failures).
    #[error("internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },
}

impl Error {
    /// Whether the error is a transient infrastructure failure worth retrying.
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::StoreRead { .. }
                | Self::StoreWrite { .. }
                | Self::StoreUnavailable { .. }
                | Self::Io(_)
        )
    }
}
