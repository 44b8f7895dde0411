use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Registry of async mutexes keyed by id. Backs the per-conversation advisory
/// lock (rotations) and the per-account wallet lock (debits). Lock objects
/// are created on first use and kept for the process lifetime; the set of hot
/// keys is small.
pub struct KeyedLocks<K> {
    inner: StdMutex<HashMap<K, Arc<Mutex<()>>>>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self {
            inner: StdMutex::new(HashMap::new()),
        }
    }

    /// Acquire the lock for `key`, waiting if another task holds it.
    pub async fn acquire(&self, key: K) -> OwnedMutexGuard<()> {
        let handle = {
            let mut map = self.inner.lock().expect("lock registry poisoned");
            Arc::clone(map.entry(key).or_insert_with(|| Arc::new(Mutex::new(()))))
        };
        handle.lock_owned().await
    }

    /// Try to acquire without waiting. `None` if the lock is held.
    pub fn try_acquire(&self, key: K) -> Option<OwnedMutexGuard<()>> {
        let handle = {
            let mut map = self.inner.lock().expect("lock registry poisoned");
            Arc::clone(map.entry(key).or_insert_with(|| Arc::new(Mutex::new(()))))
        };
        handle.try_lock_owned().ok()
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_key_excludes() {
        let locks = KeyedLocks::new();
        let guard = locks.acquire(1u64).await;
        assert!(locks.try_acquire(1u64).is_none());
        drop(guard);
        assert!(locks.try_acquire(1u64).is_some());
    }

    #[tokio::test]
    async fn distinct_keys_are_independent() {
        let locks = KeyedLocks::new();
        let _a = locks.acquire(1u64).await;
        assert!(locks.try_acquire(2u64).is_some());
    }
}
