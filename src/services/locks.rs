use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type LockMap = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

/// Per-content-key mutual exclusion.
///
/// Entries exist only while some task holds or waits for the key, so the
/// map does not grow with the number of distinct keys ever seen.
#[derive(Clone, Default)]
pub struct KeyedLocks {
    inner: LockMap,
}

/// Exclusive hold on one content key, released on drop
pub struct KeyGuard {
    key: String,
    locks: LockMap,
    _guard: OwnedMutexGuard<()>,
}

impl KeyGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`
    pub async fn lock(&self, key: &str) -> KeyGuard {
        let mutex = {
            let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            map.entry(key.to_string()).or_default().clone()
        };

        KeyGuard {
            key: key.to_string(),
            locks: self.inner.clone(),
            _guard: mutex.lock_owned().await,
        }
    }

    /// Number of keys currently held or awaited
    #[cfg(test)]
    pub fn active(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        let mut map = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // One reference in the map, one inside our own guard: nobody is waiting.
        if let Some(mutex) = map.get(&self.key) {
            if Arc::strong_count(mutex) <= 2 {
                map.remove(&self.key);
            }
        }
    }
}
