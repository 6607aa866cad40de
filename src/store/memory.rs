//! In-process cache and lock implementations.
//!
//! Both are backed by `DashMap` and expire entries lazily on access; a
//! background reaper ([`spawn_reaper`]) bounds memory for keys that are never
//! read again. They only provide consistency within one process; multi-instance
//! deployments plug in shared implementations of the same traits.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use tracing::debug;

use super::{CacheStore, LockService};
use crate::Result;

/// A cached value with TTL metadata
struct CachedValue {
    value: String,
    cached_at: Instant,
    ttl: Duration,
}

impl CachedValue {
    fn is_expired(&self) -> bool {
        self.cached_at.elapsed() >= self.ttl
    }
}

/// Cache statistics tracked atomically
#[derive(Debug, Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

/// Snapshot of cache statistics
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatsSnapshot {
    /// Total cache hits
    pub hits: u64,
    /// Total cache misses (absent or expired)
    pub misses: u64,
    /// Total expired entries removed
    pub evictions: u64,
    /// Current number of entries, expired ones included until reaped
    pub size: usize,
    /// Hit rate (0.0-1.0)
    pub hit_rate: f64,
}

/// Thread-safe TTL cache
#[derive(Default)]
pub struct InMemoryCacheStore {
    entries: DashMap<String, CachedValue>,
    stats: CacheStats,
}

impl InMemoryCacheStore {
    /// Create an empty cache
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove expired entries. Returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired());
        let count = before.saturating_sub(self.entries.len());
        if count > 0 {
            self.stats
                .evictions
                .fetch_add(count as u64, Ordering::Relaxed);
        }
        count
    }

    /// Current statistics
    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> CacheStatsSnapshot {
        let hits = self.stats.hits.load(Ordering::Relaxed);
        let misses = self.stats.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStatsSnapshot {
            hits,
            misses,
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            size: self.entries.len(),
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
        }
    }

    fn live_value(&self, key: &str) -> Option<String> {
        let entry = self.entries.get(key)?;
        if entry.is_expired() {
            drop(entry);
            self.entries.remove_if(key, |_, e| e.is_expired());
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        Some(entry.value.clone())
    }
}

#[async_trait::async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let value = self.live_value(key);
        let counter = if value.is_some() {
            &self.stats.hits
        } else {
            &self.stats.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(value)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        self.entries.insert(
            key.to_string(),
            CachedValue {
                value,
                cached_at: Instant::now(),
                ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.live_value(key).is_some())
    }

    async fn delete_by_prefix(&self, prefix: &str) -> Result<usize> {
        let before = self.entries.len();
        self.entries.retain(|key, _| !key.starts_with(prefix));
        Ok(before.saturating_sub(self.entries.len()))
    }
}

/// In-process lock table with lease expiry
#[derive(Debug, Default)]
pub struct InMemoryLockService {
    /// Lock key -> lease deadline
    leases: DashMap<String, Instant>,
}

impl InMemoryLockService {
    /// Create an empty lock table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `key` is currently held
    #[must_use]
    pub fn is_held(&self, key: &str) -> bool {
        self.leases
            .get(key)
            .is_some_and(|deadline| *deadline > Instant::now())
    }

    /// Drop leases that ran out
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.leases.len();
        self.leases.retain(|_, deadline| *deadline > now);
        before.saturating_sub(self.leases.len())
    }
}

#[async_trait::async_trait]
impl LockService for InMemoryLockService {
    async fn try_acquire(&self, key: &str, lease: Duration) -> Result<bool> {
        let now = Instant::now();
        let acquired = match self.leases.entry(key.to_string()) {
            Entry::Occupied(mut held) => {
                if *held.get() <= now {
                    // Previous holder's lease ran out
                    held.insert(now + lease);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(free) => {
                free.insert(now + lease);
                true
            }
        };
        Ok(acquired)
    }

    async fn release(&self, key: &str) -> Result<()> {
        self.leases.remove(key);
        Ok(())
    }
}

/// Spawn a background task that evicts expired cache entries and lock
/// leases every `interval`.
///
/// The task exits when the `shutdown` receiver fires.
pub fn spawn_reaper(
    cache: Arc<InMemoryCacheStore>,
    locks: Arc<InMemoryLockService>,
    interval: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let evicted = cache.evict_expired();
                    let leases = locks.evict_expired();
                    if evicted > 0 || leases > 0 {
                        let stats = cache.stats();
                        debug!(
                            evicted,
                            leases,
                            size = stats.size,
                            hit_rate = stats.hit_rate,
                            "Reaped expired cache entries"
                        );
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Store reaper shutting down");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_is_a_hit() {
        let cache = InMemoryCacheStore::new();
        cache
            .set("k", "v".to_string(), Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));
        assert!(cache.exists("k").await.unwrap());
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 0);
    }

    #[tokio::test]
    async fn missing_key_is_a_miss() {
        let cache = InMemoryCacheStore::new();
        assert!(cache.get("nope").await.unwrap().is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[tokio::test]
    async fn expired_entry_is_evicted_on_read() {
        let cache = InMemoryCacheStore::new();
        cache
            .set("k", "v".to_string(), Duration::from_millis(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert!(cache.get("k").await.unwrap().is_none());
        assert_eq!(cache.stats().evictions, 1);
        assert_eq!(cache.stats().size, 0);
    }

    #[tokio::test]
    async fn set_overwrites_value_and_ttl() {
        let cache = InMemoryCacheStore::new();
        cache
            .set("k", "old".to_string(), Duration::from_millis(1))
            .await
            .unwrap();
        cache
            .set("k", "new".to_string(), Duration::from_secs(60))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let cache = InMemoryCacheStore::new();
        cache
            .set("k", "v".to_string(), Duration::from_secs(60))
            .await
            .unwrap();

        assert!(cache.delete("k").await.unwrap());
        assert!(!cache.delete("k").await.unwrap());
        assert!(!cache.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn delete_by_prefix_only_touches_matching_keys() {
        let cache = InMemoryCacheStore::new();
        let ttl = Duration::from_secs(60);
        cache.set("permission:hash:acme:u1", "a".into(), ttl).await.unwrap();
        cache.set("permission:hash:acme:u2", "b".into(), ttl).await.unwrap();
        cache.set("permission:hash:globex:u1", "c".into(), ttl).await.unwrap();

        let removed = cache.delete_by_prefix("permission:hash:acme:").await.unwrap();
        assert_eq!(removed, 2);
        assert!(cache.exists("permission:hash:globex:u1").await.unwrap());
    }

    #[tokio::test]
    async fn evict_expired_keeps_live_entries() {
        let cache = InMemoryCacheStore::new();
        cache.set("short", "1".into(), Duration::from_millis(1)).await.unwrap();
        cache.set("long", "2".into(), Duration::from_secs(60)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(cache.evict_expired(), 1);
        assert_eq!(cache.stats().size, 1);
        assert_eq!(cache.get("long").await.unwrap().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn lock_is_exclusive_until_released() {
        let locks = InMemoryLockService::new();
        let lease = Duration::from_secs(30);

        assert!(locks.try_acquire("refresh:lock:acme:u1", lease).await.unwrap());
        assert!(!locks.try_acquire("refresh:lock:acme:u1", lease).await.unwrap());
        assert!(locks.try_acquire("refresh:lock:acme:u2", lease).await.unwrap());

        locks.release("refresh:lock:acme:u1").await.unwrap();
        assert!(locks.try_acquire("refresh:lock:acme:u1", lease).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lease_can_be_taken_over() {
        let locks = InMemoryLockService::new();
        assert!(locks.try_acquire("k", Duration::from_millis(1)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert!(!locks.is_held("k"));
        assert!(locks.try_acquire("k", Duration::from_secs(30)).await.unwrap());
        assert!(locks.is_held("k"));
    }

    #[tokio::test]
    async fn reaper_stops_on_shutdown() {
        let cache = Arc::new(InMemoryCacheStore::new());
        let locks = Arc::new(InMemoryLockService::new());
        cache.set("k", "v".into(), Duration::from_millis(1)).await.unwrap();

        let (tx, rx) = tokio::sync::broadcast::channel(1);
        let handle = spawn_reaper(Arc::clone(&cache), locks, Duration::from_millis(5), rx);
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(()).unwrap();
        handle.await.unwrap();

        assert_eq!(cache.stats().size, 0);
    }
}
