//! Appearance embeddings: vector math, extractors and the extractor set.

mod accelerator;
mod extractor;
mod onnx;
mod pattern;
mod set;
mod vector;

pub use accelerator::DeviceContexts;
pub use extractor::{Extraction, Extractor, ExtractorSpec};
pub use onnx::{OnnxExtractor, model_version};
pub use pattern::CoatPatternExtractor;
pub use set::{ExtractorSet, resolve_specs};
pub use vector::{Embedding, blend, cosine_similarity, l2_normalize, weighted_mean};
