//! Per-key operation gates
//!
//! Serializes operations that address the same key (an instance id, a
//! domain) while leaving different keys fully independent.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// A lazily populated map of async mutexes
#[derive(Default, Clone)]
pub struct KeyedLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let mutex = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = mutex.lock_owned().await;
        self.prune();
        guard
    }

    /// Take `key` only if nobody holds it.
    pub fn try_lock(&self, key: &str) -> Option<OwnedMutexGuard<()>> {
        let mutex = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.try_lock_owned().ok()
    }

    /// Drop gates that nobody holds or waits on.
    fn prune(&self) {
        self.locks.retain(|_, m| Arc::strong_count(m) > 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_is_serialized() {
        let locks = KeyedLocks::new();
        let guard = locks.lock("i-1").await;

        let l = locks.clone();
        let waiter = tokio::spawn(async move {
            let _g = l.lock("i-1").await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_different_keys_are_independent() {
        let locks = KeyedLocks::new();
        let _a = locks.lock("i-1").await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock("i-2")).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_try_lock() {
        let locks = KeyedLocks::new();
        let guard = locks.try_lock("example.com").unwrap();
        assert!(locks.try_lock("example.com").is_none());
        drop(guard);
        assert!(locks.try_lock("example.com").is_some());
    }
}
