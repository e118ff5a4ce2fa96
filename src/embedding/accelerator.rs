//! Accelerator guards shared by extractors on the same device context.
//!
//! Inference on one device is serialized; image decoding, resizing and
//! vector post-processing run outside the guard.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// One guard per device name.
#[derive(Debug, Default)]
pub struct DeviceContexts {
    guards: HashMap<String, Arc<Mutex<()>>>,
}

impl DeviceContexts {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Guard for a device, created on first use.
    pub fn guard(&mut self, device: &str) -> Arc<Mutex<()>> {
        Arc::clone(self.guards.entry(device.to_string()).or_default())
    }

    /// Number of distinct device contexts.
    pub fn len(&self) -> usize {
        self.guards.len()
    }

    /// Whether no device has been registered.
    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }
}
