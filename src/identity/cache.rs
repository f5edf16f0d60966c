use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use super::{IdentityError, IdentityResolver};

#[derive(Clone, Copy)]
struct CacheEntry {
    exists: bool,
    expires_at: Instant,
}

/// In-memory TTL cache in front of another resolver.
///
/// Only answers are cached; errors always go back to the inner resolver on
/// the next call. Expired entries are dropped lazily on read or in bulk by
/// `evict_expired()`, which `jobs::identity_cache` runs periodically.
#[derive(Clone)]
pub struct CachedIdentityResolver {
    inner: Arc<dyn IdentityResolver>,
    local: Arc<DashMap<String, CacheEntry>>,
    ttl: Duration,
}

impl CachedIdentityResolver {
    pub fn new(inner: Arc<dyn IdentityResolver>, ttl: Duration) -> Self {
        Self {
            inner,
            local: Arc::new(DashMap::new()),
            ttl,
        }
    }

    fn key(alias: &str) -> String {
        alias.trim().to_ascii_lowercase()
    }

    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.local.len();
        self.local.retain(|_, entry| entry.expires_at > now);
        before - self.local.len()
    }

    pub fn len(&self) -> usize {
        self.local.len()
    }

    pub fn is_empty(&self) -> bool {
        self.local.is_empty()
    }
}

#[async_trait]
impl IdentityResolver for CachedIdentityResolver {
    async fn resolve_alias(&self, alias: &str) -> Result<bool, IdentityError> {
        let key = Self::key(alias);
        if let Some(entry) = self.local.get(&key) {
            if Instant::now() < entry.expires_at {
                return Ok(entry.exists);
            }
            // expired; release the shard guard before removing
            drop(entry);
            self.local.remove(&key);
        }

        let exists = self.inner.resolve_alias(alias).await?;
        self.local.insert(
            key,
            CacheEntry {
                exists,
                expires_at: Instant::now() + self.ttl,
            },
        );
        Ok(exists)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl IdentityResolver for Counting {
        async fn resolve_alias(&self, alias: &str) -> Result<bool, IdentityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(IdentityError::Request("down".into()));
            }
            Ok(alias != "ghost")
        }
    }

    #[tokio::test]
    async fn test_answers_are_cached_case_insensitively() {
        let inner = Arc::new(Counting { calls: AtomicUsize::new(0), fail: false });
        let cache = CachedIdentityResolver::new(inner.clone(), Duration::from_secs(60));

        assert!(cache.resolve_alias("Alice").await.unwrap());
        assert!(cache.resolve_alias("alice").await.unwrap());
        assert!(!cache.resolve_alias("ghost").await.unwrap());
        assert!(!cache.resolve_alias("ghost").await.unwrap());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_expired_entries_are_refetched() {
        let inner = Arc::new(Counting { calls: AtomicUsize::new(0), fail: false });
        let cache = CachedIdentityResolver::new(inner.clone(), Duration::from_millis(10));

        cache.resolve_alias("alice").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.evict_expired(), 1);
        cache.resolve_alias("alice").await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let inner = Arc::new(Counting { calls: AtomicUsize::new(0), fail: true });
        let cache = CachedIdentityResolver::new(inner.clone(), Duration::from_secs(60));

        assert!(cache.resolve_alias("alice").await.is_err());
        assert!(cache.resolve_alias("alice").await.is_err());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
        assert!(cache.is_empty());
    }
}
