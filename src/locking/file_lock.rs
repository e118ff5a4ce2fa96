//! Registry directory lock.
//!
//! Only one process may write a registry at a time. The lock file records
//! who holds it so a stale lock left by a crashed process can be diagnosed.

use crate::constants::registry::LOCK_FILE;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Lock file content for debugging.
#[derive(Debug, Serialize, Deserialize)]
pub struct LockInfo {
    /// Process ID that holds the lock.
    pub pid: u32,
    /// Hostname of the machine.
    pub hostname: String,
    /// When the lock was acquired.
    pub started: DateTime<Utc>,
}

/// RAII guard for the registry lock.
#[derive(Debug)]
pub struct RegistryLock {
    lock_path: PathBuf,
}

impl RegistryLock {
    /// Acquire the lock for a registry directory.
    pub fn acquire(registry_dir: &Path) -> Result<Self> {
        let lock_path = Self::lock_path_for(registry_dir);

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path);

        match file {
            Ok(mut f) => {
                let info = LockInfo {
                    pid: std::process::id(),
                    hostname: hostname::get().map_or_else(
                        |_| "unknown".to_string(),
                        |h| h.to_string_lossy().into_owned(),
                    ),
                    started: Utc::now(),
                };

                let json = serde_json::to_string_pretty(&info).unwrap_or_else(|_| "{}".to_string());
                let _ = f.write_all(json.as_bytes());

                register_lock(&lock_path);

                Ok(Self { lock_path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(Error::RegistryLocked { path: lock_path })
            }
            Err(e) => Err(Error::LockCreate {
                path: lock_path,
                source: e,
            }),
        }
    }

    /// Lock file path for a registry directory.
    pub fn lock_path_for(registry_dir: &Path) -> PathBuf {
        registry_dir.join(LOCK_FILE)
    }

    /// Check if the registry is locked.
    pub fn is_locked(registry_dir: &Path) -> bool {
        Self::lock_path_for(registry_dir).exists()
    }

    /// Read the holder of a lock, if the lock file is readable.
    pub fn holder(registry_dir: &Path) -> Option<LockInfo> {
        let contents = fs::read_to_string(Self::lock_path_for(registry_dir)).ok()?;
        serde_json::from_str(&contents).ok()
    }

    /// Check if a lock is stale (older than `max_age`).
    pub fn is_stale(registry_dir: &Path, max_age: Duration) -> bool {
        let lock_path = Self::lock_path_for(registry_dir);

        if let Ok(metadata) = fs::metadata(&lock_path)
            && let Ok(modified) = metadata.modified()
        {
            return modified.elapsed().unwrap_or_default() > max_age;
        }
        false
    }

    /// Remove a lock left behind by a crashed process.
    pub fn remove_stale(registry_dir: &Path) -> Result<()> {
        let lock_path = Self::lock_path_for(registry_dir);
        fs::remove_file(&lock_path).map_err(|e| Error::LockRemove {
            path: lock_path,
            source: e,
        })
    }
}

impl Drop for RegistryLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.lock_path);
        unregister_lock(&self.lock_path);
    }
}

/// Global registry of active lock paths for cleanup on signal.
static ACTIVE_LOCKS: std::sync::LazyLock<std::sync::Mutex<Vec<PathBuf>>> =
    std::sync::LazyLock::new(|| std::sync::Mutex::new(Vec::new()));

/// Register a lock path for cleanup on signal.
pub fn register_lock(path: &Path) {
    if let Ok(mut locks) = ACTIVE_LOCKS.lock() {
        locks.push(path.to_path_buf());
    }
}

/// Unregister a lock path after normal cleanup.
pub fn unregister_lock(path: &Path) {
    if let Ok(mut locks) = ACTIVE_LOCKS.lock() {
        locks.retain(|p| p != path);
    }
}

/// Clean up all registered locks. Called on a forced exit.
pub fn cleanup_all_locks() {
    if let Ok(locks) = ACTIVE_LOCKS.lock() {
        for lock_path in locks.iter() {
            let _ = fs::remove_file(lock_path);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_and_release_lock() {
        let temp_dir = TempDir::new().unwrap();

        let lock = RegistryLock::acquire(temp_dir.path());
        assert!(lock.is_ok());
        assert!(RegistryLock::is_locked(temp_dir.path()));

        let holder = RegistryLock::holder(temp_dir.path()).unwrap();
        assert_eq!(holder.pid, std::process::id());

        drop(lock);
        assert!(!RegistryLock::is_locked(temp_dir.path()));
    }

    #[test]
    fn test_double_lock_fails() {
        let temp_dir = TempDir::new().unwrap();

        let lock1 = RegistryLock::acquire(temp_dir.path());
        assert!(lock1.is_ok());

        let lock2 = RegistryLock::acquire(temp_dir.path());
        assert!(matches!(lock2, Err(Error::RegistryLocked { .. })));
    }

    #[test]
    fn test_remove_stale_lock() {
        let temp_dir = TempDir::new().unwrap();
        File::create(RegistryLock::lock_path_for(temp_dir.path())).unwrap();
        assert!(!RegistryLock::is_stale(temp_dir.path(), Duration::from_secs(3600)));

        RegistryLock::remove_stale(temp_dir.path()).unwrap();
        assert!(RegistryLock::acquire(temp_dir.path()).is_ok());
    }

    #[test]
    fn test_cleanup_all_locks_removes_registered_files() {
        let temp_dir = TempDir::new().unwrap();
        let lock_path = temp_dir.path().join(LOCK_FILE);

        File::create(&lock_path).unwrap();
        assert!(lock_path.exists());

        register_lock(&lock_path);
        cleanup_all_locks();

        assert!(!lock_path.exists());
    }
}
