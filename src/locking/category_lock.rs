//! Per-category async locks guarding identity creation.
//!
//! Two workers that both decide "new identity" for the same category must
//! not both create one. The loser of the lock re-scores against the
//! registry after the winner committed and matches the fresh identity.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Lazily created lock per category key.
#[derive(Debug, Default)]
pub struct CategoryLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl CategoryLocks {
    /// Create an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the lock of one category.
    pub async fn lock(&self, category: &str) -> Result<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = self.locks.lock().map_err(|_| Error::LockPoisoned {
                what: "category lock table",
            })?;
            Arc::clone(locks.entry(category.to_string()).or_default())
        };
        Ok(lock.lock_owned().await)
    }

    /// Number of categories seen so far.
    pub fn len(&self) -> usize {
        self.locks.lock().map_or(0, |locks| locks.len())
    }

    /// Whether no category has been locked yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
