//! Buffer Synchronization Module
//!
//! Fences, sync timelines and the shared buffer lock + fence table.

pub mod buffer;
pub mod fence;

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

pub use buffer::{BufferDesc, BufferHandle, BufferId, LockState, ReadGuard, WriteGuard};
pub use fence::{Fence, FenceError, Timeline};

/// Timeouts applied to every blocking synchronization call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncPolicy {
    /// Bounded wait for a buffer lock before proceeding unlocked
    pub lock_timeout: Duration,
    /// Bounded wait for a fence on the CPU
    pub fence_timeout: Duration,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(3),
            fence_timeout: Duration::from_secs(1),
        }
    }
}

/// Lock a mutex, recovering the data if another thread panicked with it held
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
