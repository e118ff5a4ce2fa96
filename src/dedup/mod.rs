//! Deduplication: spatial suppression within an image and temporal
//! linking of bursts at one camera.

mod spatial;
mod temporal;

pub use spatial::suppress;
pub use temporal::CameraWindow;
