//! Named mutual exclusion used while materializing first-time ancestor
//! directories.
//!
//! `DistributedLock` is the collaborator seam; `LocalLock` is the in-process
//! implementation used by a single nameserver and by the tests.

use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::error::{NamespaceError, NamespaceResult};

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock backend unavailable: {0}")]
    Backend(String),
}

/// Token-guarded named lock. `lock` never blocks; it reports whether the
/// caller now holds `name`. `unlock` only releases when `holder` matches.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    async fn lock(&self, name: &str, holder: &str) -> Result<bool, LockError>;
    async fn unlock(&self, name: &str, holder: &str) -> Result<bool, LockError>;
}

#[derive(Clone, Default)]
pub struct LocalLock {
    held: Arc<Mutex<HashMap<String, String>>>,
}

impl LocalLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DistributedLock for LocalLock {
    async fn lock(&self, name: &str, holder: &str) -> Result<bool, LockError> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| LockError::Backend("lock table poisoned".into()))?;
        if held.contains_key(name) {
            return Ok(false);
        }
        held.insert(name.to_string(), holder.to_string());
        Ok(true)
    }

    async fn unlock(&self, name: &str, holder: &str) -> Result<bool, LockError> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| LockError::Backend("lock table poisoned".into()))?;
        match held.get(name) {
            Some(owner) if owner == holder => {
                held.remove(name);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Retry schedule for acquiring a busy lock.
#[derive(Debug, Clone, Copy)]
pub struct LockBackoff {
    pub initial: Duration,
    pub max: Duration,
    /// Total time to wait before giving up.
    pub timeout: Duration,
}

impl Default for LockBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(2),
            max: Duration::from_millis(100),
            timeout: Duration::from_secs(5),
        }
    }
}

/// Acquire `name` for `holder`, doubling the wait between attempts.
pub async fn acquire(
    lock: &dyn DistributedLock,
    name: &str,
    holder: &str,
    backoff: LockBackoff,
) -> NamespaceResult<()> {
    let deadline = Instant::now() + backoff.timeout;
    let mut delay = backoff.initial;
    loop {
        if lock.lock(name, holder).await? {
            return Ok(());
        }
        if Instant::now() + delay > deadline {
            return Err(NamespaceError::LockTimeout(name.to_string()));
        }
        debug!(lock = name, ?delay, "lock busy, backing off");
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(backoff.max);
    }
}

/// Locks taken while a transaction is open. They must outlive the
/// transaction, so the owner releases them after commit or rollback.
#[derive(Default)]
pub struct HeldLocks {
    held: Vec<(Arc<dyn DistributedLock>, String, String)>,
}

impl HeldLocks {
    pub fn push(&mut self, lock: Arc<dyn DistributedLock>, name: String, holder: String) {
        self.held.push((lock, name, holder));
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    /// Release every lock, newest first. Failures are logged, not returned.
    pub async fn release(self) {
        for (lock, name, holder) in self.held.into_iter().rev() {
            match lock.unlock(&name, &holder).await {
                Ok(true) => debug!(lock = %name, "released lock"),
                Ok(false) => warn!(lock = %name, "lock was no longer held"),
                Err(err) => warn!(lock = %name, "failed to release lock: {}", err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unlock_requires_matching_holder() {
        let lock = LocalLock::new();
        assert!(lock.lock("b1_photos", "alice").await.unwrap());
        assert!(!lock.lock("b1_photos", "bob").await.unwrap());
        assert!(!lock.unlock("b1_photos", "bob").await.unwrap());
        assert!(lock.unlock("b1_photos", "alice").await.unwrap());
        assert!(lock.lock("b1_photos", "bob").await.unwrap());
    }

    #[tokio::test]
    async fn acquire_times_out_on_held_lock() {
        let lock = LocalLock::new();
        lock.lock("b1_docs", "other").await.unwrap();
        let backoff = LockBackoff {
            initial: Duration::from_millis(1),
            max: Duration::from_millis(4),
            timeout: Duration::from_millis(20),
        };
        let err = acquire(&lock, "b1_docs", "me", backoff).await.unwrap_err();
        assert!(matches!(err, NamespaceError::LockTimeout(name) if name == "b1_docs"));
    }

    #[tokio::test]
    async fn acquire_waits_for_release() {
        let lock = LocalLock::new();
        lock.lock("b1_docs", "other").await.unwrap();
        let releaser = lock.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            releaser.unlock("b1_docs", "other").await.unwrap();
        });
        acquire(&lock, "b1_docs", "me", LockBackoff::default())
            .await
            .unwrap();
        assert!(!lock.lock("b1_docs", "third").await.unwrap());
    }

    #[tokio::test]
    async fn held_locks_release_together() {
        let lock = Arc::new(LocalLock::new());
        let mut held = HeldLocks::default();
        for name in ["b1_a", "b1_b"] {
            acquire(lock.as_ref(), name, "me", LockBackoff::default())
                .await
                .unwrap();
            held.push(lock.clone(), name.to_string(), "me".to_string());
        }
        assert!(!lock.lock("b1_a", "other").await.unwrap());

        held.release().await;
        assert!(lock.lock("b1_a", "other").await.unwrap());
        assert!(lock.lock("b1_b", "other").await.unwrap());
    }
}
