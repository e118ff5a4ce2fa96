//! Ordered set of configured extractors.
//!
//! The set fills in a detection's missing embeddings. Embeddings already on
//! the detection with the configured version are reused; everything else is
//! computed on the blocking pool under a per-call timeout. Any failure,
//! timeout included, downgrades that extractor to "unavailable" for the
//! detection and never fails the detection as a whole.

use crate::config::{ExtractorConfig, ExtractorKind};
use crate::constants::extractor::PATTERN_VERSION;
use crate::embedding::{
    CoatPatternExtractor, DeviceContexts, Embedding, Extraction, Extractor, ExtractorSpec,
    OnnxExtractor, model_version,
};
use crate::error::{Error, Result};
use crate::registry::Detection;
use image::RgbImage;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Name, version and weight of every configured extractor, resolved
/// without loading any model.
pub fn resolve_specs(configs: &[ExtractorConfig]) -> Result<Vec<ExtractorSpec>> {
    configs
        .iter()
        .map(|config| {
            let version = match (config.kind, &config.version) {
                (_, Some(version)) => version.clone(),
                (ExtractorKind::CoatPattern, None) => PATTERN_VERSION.to_string(),
                (ExtractorKind::Onnx, None) => {
                    let model = config.model.as_deref().ok_or_else(|| Error::ExtractorBuild {
                        extractor: config.name.clone(),
                        reason: "no model path configured".to_string(),
                    })?;
                    model_version(model).map_err(|e| Error::ExtractorBuild {
                        extractor: config.name.clone(),
                        reason: e.to_string(),
                    })?
                }
                (ExtractorKind::Precomputed, None) => {
                    return Err(Error::ExtractorBuild {
                        extractor: config.name.clone(),
                        reason: "precomputed extractor needs a version".to_string(),
                    });
                }
            };
            Ok(ExtractorSpec::new(&config.name, &version, config.weight))
        })
        .collect()
}

struct Member {
    spec: ExtractorSpec,
    extractor: Option<Arc<dyn Extractor>>,
    dimension: Option<usize>,
}

/// Extractors in fusion order; the first one is primary.
pub struct ExtractorSet {
    members: Vec<Member>,
    timeout: Duration,
}

impl std::fmt::Debug for ExtractorSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtractorSet")
            .field("specs", &self.specs())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ExtractorSet {
    /// Empty set with a per-call timeout.
    pub fn new(timeout: Duration) -> Self {
        Self {
            members: Vec::new(),
            timeout,
        }
    }

    /// Build every configured extractor.
    pub fn from_config(configs: &[ExtractorConfig], timeout: Duration) -> Result<Self> {
        let mut devices = DeviceContexts::new();
        let mut set = Self::new(timeout);

        for config in configs {
            let extractor: Option<Arc<dyn Extractor>> = match config.kind {
                ExtractorKind::Onnx => Some(Arc::new(OnnxExtractor::from_config(
                    config,
                    devices.guard(&config.device),
                )?)),
                ExtractorKind::CoatPattern => Some(Arc::new(CoatPatternExtractor::new(
                    &config.name,
                    config.version.as_deref().unwrap_or(PATTERN_VERSION),
                ))),
                ExtractorKind::Precomputed => None,
            };

            let version = match (&extractor, &config.version) {
                (Some(e), _) => e.version().to_string(),
                (None, Some(v)) => v.clone(),
                (None, None) => {
                    return Err(Error::ExtractorBuild {
                        extractor: config.name.clone(),
                        reason: "precomputed extractor needs a version".to_string(),
                    });
                }
            };

            debug!(
                "Extractor '{}' ({}) version {version}, weight {}",
                config.name, config.kind, config.weight
            );
            set.members.push(Member {
                spec: ExtractorSpec::new(&config.name, &version, config.weight),
                extractor,
                dimension: config.dimension,
            });
        }

        Ok(set)
    }

    /// Append a computed extractor.
    #[must_use]
    pub fn with_extractor(mut self, extractor: Arc<dyn Extractor>, weight: f32) -> Self {
        self.members.push(Member {
            spec: ExtractorSpec::new(extractor.name(), extractor.version(), weight),
            extractor: Some(extractor),
            dimension: None,
        });
        self
    }

    /// Append an extractor whose vectors only ever come from upstream.
    #[must_use]
    pub fn with_precomputed(mut self, name: &str, version: &str, weight: f32) -> Self {
        self.members.push(Member {
            spec: ExtractorSpec::new(name, version, weight),
            extractor: None,
            dimension: None,
        });
        self
    }

    /// Specs in fusion order.
    pub fn specs(&self) -> Vec<ExtractorSpec> {
        self.members.iter().map(|m| m.spec.clone()).collect()
    }

    /// The primary extractor.
    pub fn primary(&self) -> Option<&ExtractorSpec> {
        self.members.first().map(|m| &m.spec)
    }

    /// Number of extractors.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether no extractor is configured.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// One outcome per extractor, in order.
    pub async fn extract(&self, detection: &Detection) -> Vec<Extraction> {
        let mut outcomes = Vec::with_capacity(self.members.len());
        let mut crop: Option<std::result::Result<Arc<RgbImage>, String>> = None;

        for member in &self.members {
            let spec = &member.spec;

            if let Some(existing) = detection.embedding(&spec.name, &spec.version) {
                outcomes.push(Self::check_dimension(member, existing.clone()));
                continue;
            }

            let Some(extractor) = &member.extractor else {
                outcomes.push(unavailable(spec, "no precomputed vector from upstream"));
                continue;
            };

            if crop.is_none() {
                crop = Some(self.load_crop(detection.crop.clone()).await);
            }
            let image = match &crop {
                Some(Ok(image)) => Arc::clone(image),
                Some(Err(reason)) => {
                    outcomes.push(unavailable(spec, reason));
                    continue;
                }
                None => continue,
            };

            let outcome = match self.run(Arc::clone(extractor), image).await {
                Ok(raw) => match Embedding::new(&spec.name, &spec.version, raw) {
                    Some(embedding) => Self::check_dimension(member, embedding),
                    None => unavailable(spec, "extractor returned a zero or non-finite vector"),
                },
                Err(reason) => unavailable(spec, &reason),
            };
            outcomes.push(outcome);
        }

        for outcome in &outcomes {
            if let Extraction::Unavailable { extractor, reason } = outcome {
                warn!(
                    "Detection {}: extractor '{extractor}' unavailable: {reason}",
                    detection.id
                );
            }
        }
        outcomes
    }

    fn check_dimension(member: &Member, embedding: Embedding) -> Extraction {
        match member.dimension {
            Some(expected) if expected != embedding.dimension() => unavailable(
                &member.spec,
                &format!(
                    "expected dimension {expected}, got {}",
                    embedding.dimension()
                ),
            ),
            _ => Extraction::Vector(embedding),
        }
    }

    async fn load_crop(&self, path: PathBuf) -> std::result::Result<Arc<RgbImage>, String> {
        let task = tokio::task::spawn_blocking(move || {
            image::open(&path)
                .map(|img| Arc::new(img.to_rgb8()))
                .map_err(|e| format!("failed to load crop '{}': {e}", path.display()))
        });
        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(format!("crop loader failed: {join}")),
            Err(_) => Err(format!("crop load timed out after {:?}", self.timeout)),
        }
    }

    async fn run(
        &self,
        extractor: Arc<dyn Extractor>,
        image: Arc<RgbImage>,
    ) -> std::result::Result<Vec<f32>, String> {
        let task = tokio::task::spawn_blocking(move || extractor.embed(&image));
        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(Ok(vector))) => Ok(vector),
            Ok(Ok(Err(e))) => Err(e.to_string()),
            Ok(Err(join)) => Err(format!("extractor task failed: {join}")),
            // The blocking task keeps running; its result is discarded.
            Err(_) => Err(format!("timed out after {:?}", self.timeout)),
        }
    }
}

fn unavailable(spec: &ExtractorSpec, reason: &str) -> Extraction {
    Extraction::Unavailable {
        extractor: spec.name.clone(),
        reason: reason.to_string(),
    }
}
