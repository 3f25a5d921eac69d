//! Versioned copy-on-write snapshot cell.
//!
//! Readers clone an `Arc` and release immediately, so they never observe a
//! half-applied update and never wait on a writer doing real work: writers
//! build the next value off to the side and only swap the pointer.

use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

pub struct SnapshotCell<T> {
    current: RwLock<Arc<T>>,
    version: AtomicU64,
}

impl<T> SnapshotCell<T> {
    pub fn new(value: T) -> Self {
        Self {
            current: RwLock::new(Arc::new(value)),
            version: AtomicU64::new(0),
        }
    }

    /// Current snapshot. Critical section is one refcount increment.
    #[inline(always)]
    pub fn load(&self) -> Arc<T> {
        self.current.read().clone()
    }

    /// Publish a new value, returning the new version
    pub fn store(&self, value: T) -> u64 {
        let next = Arc::new(value);
        let previous = {
            let mut guard = self.current.write();
            std::mem::replace(&mut *guard, next)
        };
        // old snapshot may be the last reference; free it outside the lock
        drop(previous);
        self.version.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Read-modify-write. Concurrent `update` calls serialize; readers do not.
    pub fn update(&self, f: impl FnOnce(&T) -> T) -> u64 {
        let previous = {
            let mut guard = self.current.write();
            let next = Arc::new(f(&guard));
            std::mem::replace(&mut *guard, next)
        };
        drop(previous);
        self.version.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }
}

impl<T: Default> Default for SnapshotCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}
