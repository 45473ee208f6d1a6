//! Cache-aside front for hot point lookups.
//!
//! The relational store is authoritative; the cache is a derived view that may
//! briefly serve stale data. Failures of the cache backend are logged and
//! swallowed, they never fail a read or block a write.

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use std::{
    collections::HashMap,
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::warn;

use super::error::NamespaceResult;

/// Stored in place of a value to remember that the loader found nothing.
pub const EMPTY_VALUE: &str = "\u{0}";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Backend(String),
}

/// Key-value backend holding serialized entries with a time-to-live.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError>;
    async fn delete(&self, key: &str) -> Result<(), CacheError>;
}

/// Process-local `CacheStore` with lazy expiry.
#[derive(Clone, Default)]
pub struct MemoryCacheStore {
    entries: Arc<RwLock<HashMap<String, (String, Instant)>>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|(_, expires_at)| *expires_at > Instant::now())
            .map(|(value, _)| value.clone()))
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        let mut entries = self.entries.write().await;
        entries.retain(|_, (_, expires_at)| *expires_at > Instant::now());
        entries.insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

#[derive(Clone)]
pub struct CacheAside {
    store: Arc<dyn CacheStore>,
    ttl: Duration,
}

impl CacheAside {
    pub fn new(store: Arc<dyn CacheStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Read `key` through the cache. On a miss `loader` runs and its result,
    /// including "nothing found", is cached. Loader errors are returned
    /// unchanged and never cached.
    pub async fn read<T, F, Fut>(&self, key: &str, loader: F) -> NamespaceResult<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = NamespaceResult<Option<T>>>,
    {
        match self.store.get(key).await {
            Ok(Some(raw)) if raw == EMPTY_VALUE => return Ok(None),
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(value) => return Ok(Some(value)),
                Err(err) => warn!(key, "discarding undecodable cache entry: {}", err),
            },
            Ok(None) => {}
            Err(err) => warn!(key, "cache read failed: {}", err),
        }

        let loaded = loader().await?;
        let raw = match &loaded {
            Some(value) => match serde_json::to_string(value) {
                Ok(raw) => raw,
                Err(err) => {
                    warn!(key, "cannot encode cache entry: {}", err);
                    return Ok(loaded);
                }
            },
            None => EMPTY_VALUE.to_string(),
        };
        if let Err(err) = self.store.set(key, raw, self.ttl).await {
            warn!(key, "cache fill failed: {}", err);
        }
        Ok(loaded)
    }

    /// Invalidate `keys`, run the authoritative `mutator`, invalidate again.
    pub async fn write<T, F, Fut>(&self, keys: &[String], mutator: F) -> NamespaceResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = NamespaceResult<T>>,
    {
        self.invalidate(keys).await;
        let result = mutator().await;
        self.invalidate(keys).await;
        result
    }

    pub async fn delete(&self, key: &str) {
        if let Err(err) = self.store.delete(key).await {
            warn!(key, "cache invalidation failed: {}", err);
        }
    }

    pub async fn invalidate(&self, keys: &[String]) {
        for key in keys {
            self.delete(key).await;
        }
    }
}

pub fn bucket_key(bucket: &str) -> String {
    format!("bucket:{}", bucket)
}

pub fn object_key(bucket: &str, path: &str) -> String {
    format!("object:{}:{}", bucket, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::error::NamespaceError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cache(ttl: Duration) -> CacheAside {
        CacheAside::new(Arc::new(MemoryCacheStore::new()), ttl)
    }

    #[tokio::test]
    async fn read_through_populates_once() {
        let cache = cache(Duration::from_secs(60));
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            let value: Option<String> = cache
                .read("k", || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Some("v".to_string()))
                })
                .await
                .unwrap();
            assert_eq!(value.as_deref(), Some("v"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn misses_are_cached_as_empty() {
        let cache = cache(Duration::from_secs(60));
        let calls = AtomicUsize::new(0);
        for _ in 0..2 {
            let value: Option<String> = cache
                .read("missing", || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(None)
                })
                .await
                .unwrap();
            assert!(value.is_none());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn loader_errors_pass_through_uncached() {
        let cache = cache(Duration::from_secs(60));
        let err = cache
            .read::<String, _, _>("k", || async { Err(NamespaceError::Root) })
            .await
            .unwrap_err();
        assert!(matches!(err, NamespaceError::Root));

        let value: Option<String> = cache
            .read("k", || async { Ok(Some("fresh".to_string())) })
            .await
            .unwrap();
        assert_eq!(value.as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn write_invalidates_around_mutation() {
        let cache = cache(Duration::from_secs(60));
        let _: Option<String> = cache
            .read("k", || async { Ok(Some("old".to_string())) })
            .await
            .unwrap();

        cache
            .write(&["k".to_string()], || async { Ok(()) })
            .await
            .unwrap();

        let value: Option<String> = cache
            .read("k", || async { Ok(Some("new".to_string())) })
            .await
            .unwrap();
        assert_eq!(value.as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let cache = cache(Duration::ZERO);
        let _: Option<String> = cache
            .read("k", || async { Ok(Some("old".to_string())) })
            .await
            .unwrap();
        let value: Option<String> = cache
            .read("k", || async { Ok(Some("new".to_string())) })
            .await
            .unwrap();
        assert_eq!(value.as_deref(), Some("new"));
    }
}
