//! Shared-state collaborators: key-value cache, distributed lock, blacklist.
//!
//! The coordinators only see these traits. Each gateway instance is handed
//! the same backing stores so that cache contents, rotation locks and the
//! refresh-token blacklist are consistent across instances. The in-memory
//! implementations in [`memory`] cover single-instance deployments and tests.
//!
//! Coordinators touch individual keys only; nothing here offers multi-key
//! transactions.

pub mod blacklist;
pub mod memory;

use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::Result;

pub use blacklist::CacheBlacklist;
pub use memory::{InMemoryCacheStore, InMemoryLockService};

/// Generic key-value cache with per-entry TTL
#[async_trait::async_trait]
pub trait CacheStore: Send + Sync + 'static {
    /// Read a live entry
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write an entry that expires after `ttl`
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()>;

    /// Remove an entry. Returns `true` if it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Whether a live entry exists
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Remove every entry whose key starts with `prefix`. Returns the count.
    async fn delete_by_prefix(&self, prefix: &str) -> Result<usize>;
}

/// Distributed mutual exclusion with bounded leases
#[async_trait::async_trait]
pub trait LockService: Send + Sync + 'static {
    /// Try to take `key` for at most `lease`. Never waits: returns `false`
    /// immediately when another holder has it.
    async fn try_acquire(&self, key: &str, lease: Duration) -> Result<bool>;

    /// Give `key` back. Releasing a lock that is not held is a no-op.
    async fn release(&self, key: &str) -> Result<()>;
}

/// Record of consumed refresh tokens
#[async_trait::async_trait]
pub trait Blacklist: Send + Sync + 'static {
    /// Whether `key` has been blacklisted and not yet expired
    async fn contains(&self, key: &str) -> Result<bool>;

    /// Blacklist `key` for `ttl`
    async fn insert(&self, key: &str, ttl: Duration) -> Result<()>;
}

/// Read and deserialize a cached JSON value.
///
/// An entry that no longer deserializes (e.g. written by an older schema) is
/// dropped and reported as a miss.
pub async fn get_json<T: DeserializeOwned>(store: &dyn CacheStore, key: &str) -> Result<Option<T>> {
    let Some(raw) = store.get(key).await? else {
        return Ok(None);
    };

    match serde_json::from_str(&raw) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            warn!(key, error = %e, "Discarding undecodable cache entry");
            store.delete(key).await?;
            Ok(None)
        }
    }
}

/// Serialize and cache a JSON value
pub async fn set_json<T: Serialize + Sync>(
    store: &dyn CacheStore,
    key: &str,
    value: &T,
    ttl: Duration,
) -> Result<()> {
    let raw = serde_json::to_string(value)?;
    store.set(key, raw, ttl).await
}
