//! Refresh-token blacklist on top of any [`CacheStore`].

use std::sync::Arc;
use std::time::Duration;

use super::{Blacklist, CacheStore};
use crate::Result;

/// Marker value stored for blacklisted keys
const CONSUMED: &str = "consumed";

/// Blacklist that keeps one cache entry per consumed token
pub struct CacheBlacklist {
    store: Arc<dyn CacheStore>,
}

impl CacheBlacklist {
    /// Wrap a cache store
    #[must_use]
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl Blacklist for CacheBlacklist {
    async fn contains(&self, key: &str) -> Result<bool> {
        self.store.exists(key).await
    }

    async fn insert(&self, key: &str, ttl: Duration) -> Result<()> {
        self.store.set(key, CONSUMED.to_string(), ttl).await
    }
}
