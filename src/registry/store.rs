//! Durable registry storage.
//!
//! The journal store keeps a JSON snapshot plus an append-only JSON-lines
//! journal of commits. Loading replays the journal on top of the snapshot;
//! a torn trailing line from an interrupted append is dropped.

use crate::constants::registry::{JOURNAL_FILE, SNAPSHOT_FILE};
use crate::error::{Error, Result};
use crate::locking::RegistryLock;
use crate::registry::{Commit, Snapshot};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, warn};

/// Storage backend for the registry.
pub trait RegistryStore: Send + Sync {
    /// Load the latest snapshot and the commits recorded after it.
    fn load(&self) -> Result<(Option<Snapshot>, Vec<Commit>)>;

    /// Durably record one commit.
    fn append(&self, commit: &Commit) -> Result<()>;

    /// Replace the snapshot and drop the journal it covers.
    fn compact(&self, snapshot: &Snapshot) -> Result<()>;
}

impl<S: RegistryStore + ?Sized> RegistryStore for std::sync::Arc<S> {
    fn load(&self) -> Result<(Option<Snapshot>, Vec<Commit>)> {
        (**self).load()
    }

    fn append(&self, commit: &Commit) -> Result<()> {
        (**self).append(commit)
    }

    fn compact(&self, snapshot: &Snapshot) -> Result<()> {
        (**self).compact(snapshot)
    }
}

/// Snapshot + journal store in a registry directory.
#[derive(Debug)]
pub struct JournalStore {
    dir: PathBuf,
    lock: Option<RegistryLock>,
    journal: Mutex<()>,
}

impl JournalStore {
    /// Open a registry directory for writing, creating it if needed.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| Error::StoreWrite {
            path: dir.to_path_buf(),
            source: e,
        })?;
        let lock = RegistryLock::acquire(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            lock: Some(lock),
            journal: Mutex::new(()),
        })
    }

    /// Open a registry directory for queries only; no lock is taken.
    pub fn open_read_only(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            lock: None,
            journal: Mutex::new(()),
        }
    }

    /// Registry directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn snapshot_path(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_FILE)
    }

    fn journal_path(&self) -> PathBuf {
        self.dir.join(JOURNAL_FILE)
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.lock.is_none() {
            return Err(Error::RegistryReadOnly {
                path: self.dir.clone(),
            });
        }
        Ok(())
    }

    fn read_snapshot(&self) -> Result<Option<Snapshot>> {
        let path = self.snapshot_path();
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path).map_err(|e| Error::StoreRead {
            path: path.clone(),
            source: e,
        })?;
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|e| Error::StoreParse { path, source: e })
    }

    fn read_journal(&self) -> Result<Vec<Commit>> {
        let path = self.journal_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&path).map_err(|e| Error::StoreRead {
            path: path.clone(),
            source: e,
        })?;

        let lines: Vec<&str> = contents.lines().filter(|l| !l.trim().is_empty()).collect();
        let mut commits = Vec::with_capacity(lines.len());
        for (i, line) in lines.iter().enumerate() {
            match serde_json::from_str::<Commit>(line) {
                Ok(commit) => commits.push(commit),
                Err(e) if i + 1 == lines.len() && !contents.ends_with('\n') => {
                    warn!(
                        "Ignoring torn trailing journal entry in {}: {e}",
                        path.display()
                    );
                }
                Err(e) => return Err(Error::StoreParse { path, source: e }),
            }
        }
        Ok(commits)
    }
}

impl RegistryStore for JournalStore {
    fn load(&self) -> Result<(Option<Snapshot>, Vec<Commit>)> {
        let snapshot = self.read_snapshot()?;
        let floor = snapshot.as_ref().map_or(0, |s| s.seq);
        let commits: Vec<Commit> = self
            .read_journal()?
            .into_iter()
            .filter(|c| c.seq > floor)
            .collect();
        debug!(
            "Loaded registry from {} ({} journal commits)",
            self.dir.display(),
            commits.len()
        );
        Ok((snapshot, commits))
    }

    fn append(&self, commit: &Commit) -> Result<()> {
        self.ensure_writable()?;
        let path = self.journal_path();
        let _guard = self.journal.lock().map_err(|_| Error::LockPoisoned {
            what: "registry journal",
        })?;

        let mut line =
            serde_json::to_string(commit).map_err(|e| Error::StoreSerialize { source: e })?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::StoreWrite {
                path: path.clone(),
                source: e,
            })?;
        let end = trim_torn_tail(&mut file, &path).map_err(|e| Error::StoreWrite {
            path: path.clone(),
            source: e,
        })?;

        let written = file
            .write_all(line.as_bytes())
            .and_then(|()| file.sync_data());
        if let Err(e) = written {
            // The caller retries the whole commit; a partial line must not
            // stay behind for the retry to land on.
            if let Err(trunc) = file.set_len(end) {
                warn!("Failed to roll back journal {}: {trunc}", path.display());
            }
            return Err(Error::StoreWrite { path, source: e });
        }
        Ok(())
    }

    fn compact(&self, snapshot: &Snapshot) -> Result<()> {
        self.ensure_writable()?;
        let _guard = self.journal.lock().map_err(|_| Error::LockPoisoned {
            what: "registry journal",
        })?;

        let path = self.snapshot_path();
        let tmp = path.with_extension("json.tmp");
        let json =
            serde_json::to_vec(snapshot).map_err(|e| Error::StoreSerialize { source: e })?;

        let write_tmp = || -> std::io::Result<()> {
            let mut file = File::create(&tmp)?;
            file.write_all(&json)?;
            file.sync_all()
        };
        write_tmp().map_err(|e| Error::StoreWrite {
            path: tmp.clone(),
            source: e,
        })?;
        fs::rename(&tmp, &path).map_err(|e| Error::StoreWrite {
            path: path.clone(),
            source: e,
        })?;

        // Commits up to snapshot.seq are now redundant; load() skips them
        // even if truncation below does not happen.
        let journal = self.journal_path();
        File::create(&journal).map_err(|e| Error::StoreWrite {
            path: journal,
            source: e,
        })?;
        Ok(())
    }
}

/// Cut an unterminated last line off the journal and return the new length.
fn trim_torn_tail(file: &mut File, path: &Path) -> std::io::Result<u64> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(0);
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1))?;
    file.read_exact(&mut last)?;
    if last[0] == b'\n' {
        return Ok(len);
    }

    let mut contents = Vec::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_end(&mut contents)?;
    let keep = contents
        .iter()
        .rposition(|b| *b == b'\n')
        .map_or(0, |i| i as u64 + 1);
    file.set_len(keep)?;
    warn!(
        "Discarded {} bytes of torn journal entry in {}",
        len - keep,
        path.display()
    );
    Ok(keep)
}

/// In-memory store for tests and dry runs.
///
/// `failing_appends` makes the next N appends fail with a transient error.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<(Option<Snapshot>, Vec<Commit>)>,
    failing_appends: AtomicU32,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store whose first `n` appends fail.
    pub fn with_failing_appends(n: u32) -> Self {
        Self {
            failing_appends: AtomicU32::new(n),
            ..Self::default()
        }
    }

    /// Make the next `n` appends fail.
    pub fn fail_next_appends(&self, n: u32) {
        self.failing_appends.store(n, Ordering::SeqCst);
    }

    /// Commits recorded since the last compaction.
    pub fn journal_len(&self) -> usize {
        self.inner.lock().map_or(0, |inner| inner.1.len())
    }
}

impl RegistryStore for MemoryStore {
    fn load(&self) -> Result<(Option<Snapshot>, Vec<Commit>)> {
        let inner = self.inner.lock().map_err(|_| Error::LockPoisoned {
            what: "memory store",
        })?;
        Ok((inner.0.clone(), inner.1.clone()))
    }

    fn append(&self, commit: &Commit) -> Result<()> {
        let remaining = self.failing_appends.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_appends.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::StoreUnavailable {
                reason: "injected append failure".to_string(),
            });
        }
        let mut inner = self.inner.lock().map_err(|_| Error::LockPoisoned {
            what: "memory store",
        })?;
        inner.1.push(commit.clone());
        Ok(())
    }

    fn compact(&self, snapshot: &Snapshot) -> Result<()> {
        let mut inner = self.inner.lock().map_err(|_| Error::LockPoisoned {
            what: "memory store",
        })?;
        *inner = (Some(snapshot.clone()), Vec::new());
        Ok(())
    }
}
