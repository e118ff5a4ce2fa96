//! Process and in-process locking.

mod category_lock;
mod file_lock;

pub use category_lock::CategoryLocks;
pub use file_lock::{LockInfo, RegistryLock, cleanup_all_locks, register_lock, unregister_lock};
