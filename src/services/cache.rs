//! Non-authoritative key/value cache
//!
//! Nothing here is ever consulted for a write-path decision. Callers treat
//! every failure as a miss and log it.

use async_trait::async_trait;
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};
use tokio::sync::Mutex;

use crate::error::AppResult;

/// Key of the serialized latest-books listing
pub const LATEST_BOOKS_KEY: &str = "latest_books";

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> AppResult<Option<String>>;

    async fn set_ex(&self, key: &str, value: &str, ttl_seconds: u64) -> AppResult<()>;

    async fn delete(&self, key: &str) -> AppResult<()>;
}

/// Drop a cache entry, logging instead of failing
pub async fn invalidate(cache: &dyn Cache, key: &str, operation: &'static str) {
    if let Err(e) = cache.delete(key).await {
        tracing::warn!(operation, key, error = %e, "Unable to invalidate cache entry");
    }
}

/// Process-local TTL cache, used when Redis is unreachable at startup and in tests
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some((value, expires_at)) if *expires_at > Instant::now() => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_seconds: u64) -> AppResult<()> {
        let expires_at = Instant::now() + Duration::from_secs(ttl_seconds);
        self.entries
            .lock()
            .await
            .insert(key.to_string(), (value.to_string(), expires_at));
        Ok(())
    }

    async fn delete(&self, key: &str) -> AppResult<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;

    #[tokio::test]
    async fn test_memory_cache_round_trip() {
        let cache = MemoryCache::new();
        assert_eq!(cache.get("k").await.unwrap(), None);

        cache.set_ex("k", "v", 60).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));

        cache.delete("k").await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_cache_expiry() {
        let cache = MemoryCache::new();
        cache.set_ex("k", "v", 0).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_invalidate_absorbs_errors() {
        let mut cache = MockCache::new();
        cache
            .expect_delete()
            .times(1)
            .returning(|_| Err(AppError::Internal("redis down".into())));

        invalidate(&cache, LATEST_BOOKS_KEY, "test").await;
    }
}
