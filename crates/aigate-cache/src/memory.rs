use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::Result;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::types::CacheStore;

/// Entry count below which `put` never purges.
const MIN_PURGE_THRESHOLD: usize = 64;

/// In-process cache store.
///
/// Expired entries are dropped on read, by an explicit
/// [`MemoryCacheStore::purge_expired`], and by `put` whenever the map has
/// doubled since the last purge. Keys that are never read again are
/// reclaimed, and the map stays within about twice the live set.
#[derive(Debug, Clone, Default)]
pub struct MemoryCacheStore {
    inner: Arc<RwLock<Entries>>,
}

#[derive(Debug, Default)]
struct Entries {
    map: HashMap<String, Entry>,
    purge_at: usize,
}

impl Entries {
    fn purge(&mut self, now: Instant) -> usize {
        let before = self.map.len();
        self.map.retain(|_, entry| !entry.is_expired(now));
        self.purge_at = (self.map.len() * 2).max(MIN_PURGE_THRESHOLD);
        before - self.map.len()
    }
}

#[derive(Debug)]
struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, expired ones included until purged.
    pub async fn len(&self) -> usize {
        self.inner.read().await.map.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.map.is_empty()
    }

    /// Remove every expired entry. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        self.inner.write().await.purge(Instant::now())
    }
}

#[async_trait::async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let now = Instant::now();
        {
            let inner = self.inner.read().await;
            match inner.map.get(key) {
                None => return Ok(None),
                Some(entry) if !entry.is_expired(now) => return Ok(Some(entry.value.clone())),
                Some(_) => {}
            }
        }

        let mut inner = self.inner.write().await;
        if inner.map.get(key).map(|e| e.is_expired(now)).unwrap_or(false) {
            inner.map.remove(key);
        }
        Ok(None)
    }

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        if inner.map.len() >= inner.purge_at.max(MIN_PURGE_THRESHOLD) {
            let removed = inner.purge(now);
            if removed > 0 {
                tracing::debug!(removed, remaining = inner.map.len(), "memory cache purge");
            }
        }
        inner.map.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.inner.write().await.map.remove(key).is_some())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_after_ttl() {
        let store = MemoryCacheStore::new();
        store
            .put("fp", b"X".to_vec(), Duration::from_millis(1000))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(store.get("fp").await.unwrap(), Some(b"X".to_vec()));

        tokio::time::advance(Duration::from_millis(1000)).await;
        assert_eq!(store.get("fp").await.unwrap(), None);
        assert!(store.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let store = MemoryCacheStore::new();
        store.put("a", vec![1], Duration::from_secs(1)).await.unwrap();
        store.put("b", vec![2], Duration::from_secs(10)).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.purge_expired().await, 1);
        assert_eq!(store.len().await, 1);
        assert!(store.delete("b").await.unwrap());
        assert!(!store.delete("b").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_put_reclaims_entries_never_read_again() {
        let store = MemoryCacheStore::new();
        for i in 0..MIN_PURGE_THRESHOLD {
            store
                .put(&format!("old-{i}"), vec![0], Duration::from_millis(100))
                .await
                .unwrap();
        }
        assert_eq!(store.len().await, MIN_PURGE_THRESHOLD);

        tokio::time::advance(Duration::from_millis(200)).await;
        store.put("fresh", vec![1], Duration::from_secs(10)).await.unwrap();
        assert_eq!(store.len().await, 1);
        assert_eq!(store.get("fresh").await.unwrap(), Some(vec![1]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unique_keys_stay_bounded() {
        let store = MemoryCacheStore::new();
        for i in 0..1000 {
            store
                .put(&format!("k-{i}"), vec![0], Duration::from_millis(10))
                .await
                .unwrap();
            tokio::time::advance(Duration::from_millis(1)).await;
        }
        assert!(store.len().await <= 2 * MIN_PURGE_THRESHOLD, "{}", store.len().await);
    }
}
