//! Per-Key Locks
//!
//! Lazily created mutexes keyed by cache key. A lock object lives only while
//! at least one task holds or waits for it, so the registry never grows with
//! the key space.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

/// Registry of per-key mutexes
#[derive(Debug, Default)]
pub struct KeyLockRegistry {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl KeyLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `key`, waiting for any current holder
    pub async fn lock(&self, key: &str) -> KeyLockGuard {
        // Clone the Arc out of the map before awaiting so no shard lock is
        // held across the await point.
        let mutex = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let guard = mutex.lock_owned().await;
        trace!(key = %key, "Key lock acquired");

        KeyLockGuard {
            key: key.to_string(),
            guard: Some(guard),
            locks: self.locks.clone(),
        }
    }

    /// Number of keys with a live lock object
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Held lock for one key; releasing it drops the lock object once unused
#[derive(Debug)]
pub struct KeyLockGuard {
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl KeyLockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyLockGuard {
    fn drop(&mut self) {
        // The owned guard keeps its own Arc to the mutex; release it first so
        // the map entry is the last reference when nobody else is waiting.
        self.guard.take();
        self.locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}
