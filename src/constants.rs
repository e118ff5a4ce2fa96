//! Application-wide constants.
//!
//! All magic numbers and strings are defined here to ensure consistency
//! and make changes easy to track.

/// Application name used for config directories and user-facing messages.
pub const APP_NAME: &str = "wildreid";

/// Environment variable that overrides the configuration file path.
pub const CONFIG_ENV_VAR: &str = "WILDREID_CONFIG";

/// Matching decision defaults.
pub mod matching {
    /// Default fused similarity threshold for assigning to an existing identity.
    pub const DEFAULT_THRESHOLD: f32 = 0.70;

    /// Default epsilon under which two candidate scores count as tied.
    pub const DEFAULT_TIE_EPSILON: f32 = 0.02;

    /// Default number of candidates pulled from the vector index per detection.
    pub const DEFAULT_SHORTLIST: usize = 25;

    /// Default number of candidate scores kept on a detection for reviewers.
    pub const DEFAULT_REVIEW_CANDIDATES: usize = 3;

    /// Lower bound on the weight a new sample gets in the running embedding.
    ///
    /// With a count-weighted blend the weight of sample `n` is `1 / n`; this
    /// floor keeps long-lived identities responsive to appearance drift.
    pub const DEFAULT_MIN_BLEND_WEIGHT: f32 = 0.05;

    /// Detector confidence under which a detection is flagged for review.
    pub const DEFAULT_LOW_CONFIDENCE: f32 = 0.30;

    /// Decision rounds per detection before giving up; a round is repeated
    /// when the chosen identity was quarantined or removed meanwhile.
    pub const MAX_DECISION_ROUNDS: usize = 8;
}

/// Deduplication defaults.
pub mod dedup {
    /// Default IoU above which two same-category boxes in one image are merged.
    pub const DEFAULT_IOU_THRESHOLD: f32 = 0.5;

    /// Default trailing window for temporal linking at one camera, in seconds.
    pub const DEFAULT_TEMPORAL_WINDOW_SECS: u64 = 10;

    /// Default cosine similarity above which two frames are the same sighting.
    pub const DEFAULT_TEMPORAL_SIMILARITY: f32 = 0.97;
}

/// Worker pool defaults.
pub mod workers {
    /// Default number of concurrent workers.
    pub const DEFAULT_COUNT: usize = 4;

    /// Maximum allowed number of workers.
    pub const MAX_COUNT: usize = 256;

    /// Default per-call extractor timeout in milliseconds.
    pub const DEFAULT_EXTRACTOR_TIMEOUT_MS: u64 = 30_000;

    /// Default number of retries for transient failures.
    pub const DEFAULT_MAX_RETRIES: u32 = 3;

    /// Default initial backoff in milliseconds.
    pub const DEFAULT_BACKOFF_INITIAL_MS: u64 = 200;

    /// Default backoff ceiling in milliseconds.
    pub const DEFAULT_BACKOFF_MAX_MS: u64 = 5_000;
}

/// Registry storage constants.
pub mod registry {
    /// Snapshot file name inside the registry directory.
    pub const SNAPSHOT_FILE: &str = "snapshot.json";

    /// Journal file name inside the registry directory.
    pub const JOURNAL_FILE: &str = "journal.jsonl";

    /// Lock file name inside the registry directory.
    pub const LOCK_FILE: &str = "registry.lock";

    /// Snapshot schema version.
    pub const SCHEMA_VERSION: &str = "1.0";

    /// Default number of journal commits before automatic compaction.
    pub const DEFAULT_COMPACT_EVERY: usize = 1_000;
}

/// Embedding extractor constants.
pub mod extractor {
    /// Default square input size for ONNX appearance models.
    pub const DEFAULT_INPUT_SIZE: u32 = 224;

    /// Default input tensor name for ONNX appearance models.
    pub const DEFAULT_INPUT_NAME: &str = "input";

    /// Default device context name.
    pub const DEFAULT_DEVICE: &str = "cpu";

    /// ImageNet channel means used for normalization.
    pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];

    /// ImageNet channel standard deviations used for normalization.
    pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

    /// Number of hex characters of the model SHA-256 used as a version tag.
    pub const VERSION_HASH_CHARS: usize = 12;

    /// Coat-pattern descriptor grid side (cells per axis).
    pub const PATTERN_GRID: u32 = 4;

    /// Coat-pattern descriptor cell size in pixels.
    pub const PATTERN_CELL: u32 = 16;

    /// Coat-pattern orientation bins per cell.
    pub const PATTERN_BINS: usize = 8;

    /// Version tag of the coat-pattern descriptor.
    pub const PATTERN_VERSION: &str = "coat-hog-v1";
}

/// Detector confidence bounds.
pub mod confidence {
    /// Minimum valid confidence value.
    pub const MIN: f32 = 0.0;
    /// Maximum valid confidence value.
    pub const MAX: f32 = 1.0;
    /// Decimal places for score formatting.
    pub const DECIMAL_PLACES: usize = 4;
}

/// Calendar constants.
pub mod calendar {
    /// Days in each month (non-leap year).
    pub const DAYS_IN_MONTH: [u32; 12] = [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];
}

/// Hours in the time-of-day activity histogram.
pub const HOURS_PER_DAY: usize = 24;
