//! Configuration type definitions.

use crate::constants::{dedup, extractor, matching, registry, workers};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Complete application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Registry storage settings.
    pub registry: RegistryConfig,

    /// Ordered embedding extractors. The first entry is the primary extractor.
    pub extractors: Vec<ExtractorConfig>,

    /// Matching decision settings.
    pub matching: MatchingConfig,

    /// Deduplication settings.
    pub dedup: DedupConfig,

    /// Worker pool settings.
    pub workers: WorkerConfig,

    /// Seasonal archive settings.
    pub seasonal: SeasonalConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            registry: RegistryConfig::default(),
            extractors: vec![ExtractorConfig::coat_pattern("coat", 1.0)],
            matching: MatchingConfig::default(),
            dedup: DedupConfig::default(),
            workers: WorkerConfig::default(),
            seasonal: SeasonalConfig::default(),
        }
    }
}

impl Config {
    /// The primary extractor, if any extractor is configured.
    pub fn primary_extractor(&self) -> Option<&ExtractorConfig> {
        self.extractors.first()
    }

    /// Look up an extractor by name.
    pub fn extractor(&self, name: &str) -> Option<&ExtractorConfig> {
        self.extractors.iter().find(|e| e.name == name)
    }
}

/// Registry storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Registry directory (None = platform data directory).
    pub dir: Option<PathBuf>,

    /// Journal commits between automatic compactions.
    pub compact_every: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            dir: None,
            compact_every: registry::DEFAULT_COMPACT_EVERY,
        }
    }
}

/// How an extractor produces vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExtractorKind {
    /// ONNX appearance network run locally.
    Onnx,
    /// Handcrafted coat-pattern descriptor.
    CoatPattern,
    /// Vectors supplied by the upstream detector; never computed locally.
    Precomputed,
}

impl std::fmt::Display for ExtractorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Onnx => write!(f, "onnx"),
            Self::CoatPattern => write!(f, "coat-pattern"),
            Self::Precomputed => write!(f, "precomputed"),
        }
    }
}

/// Configuration for a single embedding extractor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractorConfig {
    /// Unique extractor name; embeddings are tagged with it.
    pub name: String,

    /// Extractor implementation.
    pub kind: ExtractorKind,

    /// Fusion weight (re-normalized over available extractors).
    pub weight: f32,

    /// Version tag. Required for precomputed extractors; ONNX defaults to a
    /// hash of the model file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Path to the ONNX model file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<PathBuf>,

    /// Square model input size in pixels.
    #[serde(default = "default_input_size")]
    pub input_size: u32,

    /// Model input tensor name.
    #[serde(default = "default_input_name")]
    pub input_name: String,

    /// Device context name; extractors on the same device share one guard.
    #[serde(default = "default_device")]
    pub device: String,

    /// Expected vector dimension, checked on every embedding when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimension: Option<usize>,
}

fn default_input_size() -> u32 {
    extractor::DEFAULT_INPUT_SIZE
}

fn default_input_name() -> String {
    extractor::DEFAULT_INPUT_NAME.to_string()
}

fn default_device() -> String {
    extractor::DEFAULT_DEVICE.to_string()
}

impl ExtractorConfig {
    /// Coat-pattern extractor with the given name and weight.
    pub fn coat_pattern(name: &str, weight: f32) -> Self {
        Self {
            name: name.to_string(),
            kind: ExtractorKind::CoatPattern,
            weight,
            version: None,
            model: None,
            input_size: default_input_size(),
            input_name: default_input_name(),
            device: default_device(),
            dimension: None,
        }
    }

    /// Precomputed extractor with the given name, version and weight.
    pub fn precomputed(name: &str, version: &str, weight: f32) -> Self {
        Self {
            name: name.to_string(),
            kind: ExtractorKind::Precomputed,
            weight,
            version: Some(version.to_string()),
            model: None,
            input_size: default_input_size(),
            input_name: default_input_name(),
            device: default_device(),
            dimension: None,
        }
    }
}

/// Matching decision settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    /// Fused score at or above which a detection joins an existing identity.
    pub threshold: f32,

    /// Score distance under which two candidates count as tied.
    pub tie_epsilon: f32,

    /// Candidates pulled from the vector index per detection.
    pub shortlist: usize,

    /// Create a new identity when gating leaves no candidates at all.
    /// When false such detections become `unresolved`.
    pub auto_create_on_no_candidates: bool,

    /// Floor for the weight of a new sample in the running embedding.
    pub min_blend_weight: f32,

    /// Candidate scores kept on each detection for reviewers.
    pub review_candidates: usize,

    /// Detector confidence under which a detection is flagged for review.
    pub low_confidence: f32,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            threshold: matching::DEFAULT_THRESHOLD,
            tie_epsilon: matching::DEFAULT_TIE_EPSILON,
            shortlist: matching::DEFAULT_SHORTLIST,
            auto_create_on_no_candidates: true,
            min_blend_weight: matching::DEFAULT_MIN_BLEND_WEIGHT,
            review_candidates: matching::DEFAULT_REVIEW_CANDIDATES,
            low_confidence: matching::DEFAULT_LOW_CONFIDENCE,
        }
    }
}

/// Deduplication settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// IoU above which two same-category boxes in one image are merged.
    pub iou_threshold: f32,

    /// Trailing window for temporal linking at one camera, in seconds.
    pub temporal_window_secs: u64,

    /// Cosine similarity of primary embeddings above which frames are linked.
    pub temporal_similarity: f32,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            iou_threshold: dedup::DEFAULT_IOU_THRESHOLD,
            temporal_window_secs: dedup::DEFAULT_TEMPORAL_WINDOW_SECS,
            temporal_similarity: dedup::DEFAULT_TEMPORAL_SIMILARITY,
        }
    }
}

/// Worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of detections processed concurrently.
    pub count: usize,

    /// Per-call extractor timeout in milliseconds.
    pub extractor_timeout_ms: u64,

    /// Retries for transient failures.
    pub max_retries: u32,

    /// Initial backoff in milliseconds.
    pub backoff_initial_ms: u64,

    /// Backoff ceiling in milliseconds.
    pub backoff_max_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: workers::DEFAULT_COUNT,
            extractor_timeout_ms: workers::DEFAULT_EXTRACTOR_TIMEOUT_MS,
            max_retries: workers::DEFAULT_MAX_RETRIES,
            backoff_initial_ms: workers::DEFAULT_BACKOFF_INITIAL_MS,
            backoff_max_ms: workers::DEFAULT_BACKOFF_MAX_MS,
        }
    }
}

/// Seasonal archive settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SeasonalConfig {
    /// Extractor whose vectors describe the seasonal trait (None = disabled).
    pub extractor: Option<String>,

    /// Species that carry the seasonal trait.
    pub species: Vec<String>,

    /// Season periods in calendar order.
    pub periods: Vec<SeasonPeriod>,
}

impl Default for SeasonalConfig {
    fn default() -> Self {
        Self {
            extractor: None,
            species: Vec::new(),
            periods: vec![
                SeasonPeriod {
                    name: "early".to_string(),
                    start_month: 1,
                    start_day: 1,
                },
                SeasonPeriod {
                    name: "late".to_string(),
                    start_month: 7,
                    start_day: 1,
                },
            ],
        }
    }
}

impl SeasonalConfig {
    /// Whether seasonal traits are tracked for the given species.
    pub fn applies_to(&self, species: &str) -> bool {
        self.extractor.is_some() && self.species.iter().any(|s| s == species)
    }
}

/// One named season period, starting on a month/day and lasting until the
/// next period starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeasonPeriod {
    /// Period name used in season tags.
    pub name: String,
    /// Start month (1-12).
    pub start_month: u32,
    /// Start day of month (1-31).
    pub start_day: u32,
}
