//! Identity registry: durable store of individuals and detections.
//!
//! All writes go through [`Registry::commit`]: the closure inspects the
//! current state and returns the mutations to apply, which are journaled
//! before they become visible. A failed append leaves memory untouched.

pub mod corrections;
pub mod index;
pub mod integrity;
pub mod profile;
pub mod sighting;
pub mod state;
pub mod store;
pub mod types;

pub use index::{Hit, VectorIndex};
pub use sighting::SightingPolicy;
pub use state::{Commit, Mutation, RegistryState, Snapshot};
pub use store::{JournalStore, MemoryStore, RegistryStore};
pub use types::{
    ANY_VIEWPOINT, ActivitySummary, AgeClass, Assignment, AssignmentMethod, BoundingBox,
    CandidateScore, Category, Detection, DetectionId, DetectionState, Exemplar, Identity,
    IdentityId, Incident, ReviewFlag, SeasonalTrait, Sex, StoredEmbedding,
};

use crate::error::{Error, Result};
use chrono::Utc;
use std::sync::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info, warn};

/// Shared handle to the registry state and its store.
pub struct Registry {
    state: RwLock<RegistryState>,
    store: Box<dyn RegistryStore>,
    compact_every: usize,
    since_compact: AtomicUsize,
}

impl Registry {
    /// Load a registry from a store. `compact_every = 0` disables automatic
    /// compaction.
    pub fn open(store: Box<dyn RegistryStore>, compact_every: usize) -> Result<Self> {
        let (snapshot, commits) = store.load()?;
        let mut state = snapshot.map_or_else(RegistryState::default, RegistryState::from_snapshot);
        let replayed = commits.len();
        for commit in commits {
            if commit.seq > state.seq {
                state.apply_commit(commit);
            }
        }

        debug!(
            "Registry open: {} identities, {} detections, {} commits replayed",
            state.identities.len(),
            state.detections.len(),
            replayed
        );

        Ok(Self {
            state: RwLock::new(state),
            store,
            compact_every,
            since_compact: AtomicUsize::new(replayed),
        })
    }

    /// Empty registry backed by memory.
    pub fn in_memory() -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            store: Box::new(MemoryStore::new()),
            compact_every: 0,
            since_compact: AtomicUsize::new(0),
        }
    }

    /// Run a read-only closure against the current state.
    pub fn read<T>(&self, f: impl FnOnce(&RegistryState) -> T) -> Result<T> {
        let state = self.state.read().map_err(|_| Error::LockPoisoned {
            what: "registry state",
        })?;
        Ok(f(&state))
    }

    /// Compute and apply mutations atomically.
    ///
    /// The closure sees the state under the write lock, so decisions it
    /// makes cannot race other commits.
    pub fn commit<T>(
        &self,
        f: impl FnOnce(&RegistryState) -> Result<(Vec<Mutation>, T)>,
    ) -> Result<T> {
        let mut state = self.state.write().map_err(|_| Error::LockPoisoned {
            what: "registry state",
        })?;

        let (mutations, value) = f(&state)?;
        if mutations.is_empty() {
            return Ok(value);
        }

        let commit = Commit {
            seq: state.seq + 1,
            at: Utc::now(),
            mutations,
        };
        self.store.append(&commit)?;
        state.apply_commit(commit);

        let since = self.since_compact.fetch_add(1, Ordering::SeqCst) + 1;
        if self.compact_every > 0 && since >= self.compact_every {
            match self.store.compact(&state.to_snapshot()) {
                Ok(()) => {
                    self.since_compact.store(0, Ordering::SeqCst);
                    debug!("Compacted registry at commit {}", state.seq);
                }
                Err(e) => warn!("Registry compaction failed: {e}"),
            }
        }

        Ok(value)
    }

    /// Write a fresh snapshot and truncate the journal.
    pub fn compact(&self) -> Result<()> {
        let state = self.state.read().map_err(|_| Error::LockPoisoned {
            what: "registry state",
        })?;
        self.store.compact(&state.to_snapshot())?;
        self.since_compact.store(0, Ordering::SeqCst);
        info!("Compacted registry at commit {}", state.seq);
        Ok(())
    }

    /// Clone one identity.
    pub fn identity(&self, id: IdentityId) -> Result<Identity> {
        self.read(|s| s.identities.get(&id).cloned())?
            .ok_or(Error::IdentityNotFound { id })
    }

    /// Clone one detection.
    pub fn detection(&self, id: DetectionId) -> Result<Detection> {
        self.read(|s| s.detections.get(&id).cloned())?
            .ok_or(Error::DetectionNotFound { id })
    }
}
