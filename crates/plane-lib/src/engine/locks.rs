//! Per-key mutual exclusion

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// A lazily created async mutex per key
///
/// Operations on different keys never wait on each other.
#[derive(Clone, Default)]
pub struct KeyedLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let mutex = self.locks.entry(key.to_string()).or_default().clone();
        mutex.lock_owned().await
    }

    pub fn try_lock(&self, key: &str) -> Option<OwnedMutexGuard<()>> {
        let mutex = self.locks.entry(key.to_string()).or_default().clone();
        mutex.try_lock_owned().ok()
    }

    /// Drop the lock for a key that no longer exists
    pub fn forget(&self, key: &str) {
        self.locks.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_same_key_is_exclusive_other_keys_are_not() {
        let locks = KeyedLocks::new();

        let held = locks.lock("app-1").await;
        assert!(locks.try_lock("app-1").is_none());
        assert!(locks.try_lock("app-2").is_some());

        drop(held);
        assert!(locks.try_lock("app-1").is_some());
    }
}
