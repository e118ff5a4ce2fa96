//! ONNX appearance-network extractor.

use crate::config::ExtractorConfig;
use crate::constants::extractor::{IMAGENET_MEAN, IMAGENET_STD, VERSION_HASH_CHARS};
use crate::embedding::Extractor;
use crate::error::{Error, Result};
use image::RgbImage;
use image::imageops::{self, FilterType};
use ort::session::Session;
use ort::value::Tensor;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Re-identification network run through ONNX Runtime.
pub struct OnnxExtractor {
    name: String,
    version: String,
    input_name: String,
    input_size: u32,
    session: Mutex<Session>,
    device: Arc<Mutex<()>>,
}

impl std::fmt::Debug for OnnxExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnnxExtractor")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("input_size", &self.input_size)
            .finish_non_exhaustive()
    }
}

impl OnnxExtractor {
    /// Load the model named in the config. `device` is the guard shared by
    /// every extractor on the same device context.
    pub fn from_config(config: &ExtractorConfig, device: Arc<Mutex<()>>) -> Result<Self> {
        let build_error = |reason: String| Error::ExtractorBuild {
            extractor: config.name.clone(),
            reason,
        };

        let model = config
            .model
            .as_deref()
            .ok_or_else(|| build_error("no model path configured".to_string()))?;

        let version = match &config.version {
            Some(version) => version.clone(),
            None => model_version(model).map_err(|e| build_error(e.to_string()))?,
        };

        let session = Session::builder()
            .map_err(|e| build_error(e.to_string()))?
            .commit_from_file(model)
            .map_err(|e| build_error(format!("{}: {e}", model.display())))?;

        debug!(
            "Loaded extractor '{}' from {} (version {version})",
            config.name,
            model.display()
        );

        Ok(Self {
            name: config.name.clone(),
            version,
            input_name: config.input_name.clone(),
            input_size: config.input_size,
            session: Mutex::new(session),
            device,
        })
    }

    fn failure(&self, reason: impl std::fmt::Display) -> Error {
        Error::Extraction {
            extractor: self.name.clone(),
            reason: reason.to_string(),
        }
    }
}

impl Extractor for OnnxExtractor {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn embed(&self, crop: &RgbImage) -> Result<Vec<f32>> {
        if crop.width() == 0 || crop.height() == 0 {
            return Err(self.failure("empty crop"));
        }

        let size = self.input_size as usize;
        let input = Tensor::from_array(([1usize, 3, size, size], to_nchw(crop, self.input_size)))
            .map_err(|e| self.failure(e))?;

        let _device = self.device.lock().map_err(|_| Error::LockPoisoned {
            what: "accelerator device",
        })?;
        let mut session = self.session.lock().map_err(|_| Error::LockPoisoned {
            what: "onnx session",
        })?;

        let outputs = session
            .run(ort::inputs![self.input_name.as_str() => input])
            .map_err(|e| self.failure(e))?;
        let (_, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| self.failure(e))?;

        Ok(data.to_vec())
    }
}

/// Resize to a square input and lay out as ImageNet-normalized NCHW.
fn to_nchw(crop: &RgbImage, size: u32) -> Vec<f32> {
    let resized = imageops::resize(crop, size, size, FilterType::Triangle);
    let plane = (size * size) as usize;
    let mut data = vec![0.0f32; 3 * plane];

    for (i, pixel) in resized.pixels().enumerate() {
        for c in 0..3 {
            let value = f32::from(pixel[c]) / 255.0;
            data[c * plane + i] = (value - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
        }
    }
    data
}

/// Version tag derived from the model file contents.
pub fn model_version(model: &Path) -> std::io::Result<String> {
    let bytes = std::fs::read(model)?;
    let digest = format!("{:x}", Sha256::digest(&bytes));
    Ok(format!("sha256-{}", &digest[..VERSION_HASH_CHARS]))
}
