//! Per-blueprint mutual exclusion for environment installs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Async locks keyed by blueprint path.
///
/// Holding the guard serializes the check-install-mark sequence for one
/// blueprint while other blueprints proceed in parallel.
#[derive(Debug, Default)]
pub struct IdentityLocks {
    locks: Mutex<HashMap<PathBuf, Arc<AsyncMutex<()>>>>,
}

impl IdentityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, key: &Path) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            // Entries only referenced by the map are idle.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(key.to_path_buf()).or_default().clone()
        };
        lock.lock_owned().await
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_is_serialized() {
        let locks = Arc::new(IdentityLocks::new());
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let locks = locks.clone();
            let active = active.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire(Path::new("/deploy/a/1/u")).await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let locks = IdentityLocks::new();
        let _a = locks.acquire(Path::new("/deploy/a/1/u")).await;
        let b = tokio::time::timeout(Duration::from_secs(1), locks.acquire(Path::new("/deploy/b/1/u"))).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_idle_entries_are_pruned() {
        let locks = IdentityLocks::new();
        drop(locks.acquire(Path::new("/deploy/a/1/u")).await);
        drop(locks.acquire(Path::new("/deploy/b/1/u")).await);
        let _c = locks.acquire(Path::new("/deploy/c/1/u")).await;
        assert_eq!(locks.len(), 1);
    }
}
