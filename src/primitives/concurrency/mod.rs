//! Coordination between callers: the hierarchical lock manager, the store's
//! single-writer latch and the data directory lock.

mod dirlock;
mod latch;
mod lock_manager;

pub use dirlock::{DataDirLock, LOCK_FILE_NAME};
pub use latch::{WriteLatch, WriteLatchGuard};
pub use lock_manager::{
    path_chain, CollectionLock, LockEvent, LockEventKind, LockGuard, LockManager, LockOwner,
    LockTable, LockTableSnapshot, ResourceId,
};
