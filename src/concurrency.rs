//! Per-key async serialization.
//!
//! Operations on one context id or query key run one at a time; operations on
//! different keys never wait on each other. Entries are pruned when the last
//! holder releases.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type LockMap<K> = Arc<Mutex<HashMap<K, Arc<AsyncMutex<()>>>>>;

pub struct KeyedLocks<K> {
    locks: LockMap<K>,
}

impl<K> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self {
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`
    pub async fn lock(&self, key: &K) -> KeyGuard<K> {
        let mutex = {
            let mut locks = self.locks.lock();
            locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        let guard = mutex.lock_owned().await;
        KeyGuard {
            key: key.clone(),
            locks: Arc::clone(&self.locks),
            guard: Some(guard),
        }
    }

    /// Number of keys currently held or waited on
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exclusive access to one key; released on drop.
pub struct KeyGuard<K: Eq + Hash> {
    key: K,
    locks: LockMap<K>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<K: Eq + Hash> Drop for KeyGuard<K> {
    fn drop(&mut self) {
        // Release first so the strong count below reflects only the map and waiters
        self.guard.take();
        let mut locks = self.locks.lock();
        if let Some(mutex) = locks.get(&self.key) {
            if Arc::strong_count(mutex) == 1 {
                locks.remove(&self.key);
            }
        }
    }
}
