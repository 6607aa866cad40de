//! Public key fetch-through cache.
//!
//! # Lookup flow
//!
//! 1. Read `jwks:key:{kid}` from the shared cache; a hit never touches the
//!    origin.
//! 2. On a miss, fetch the origin's full active key set.
//! 3. Upsert every returned key under its own cache entry and TTL.
//! 4. Return the requested key from the fetched set, or
//!    [`Error::PublicKeyNotFound`]. Unknown kids are never cached.
//!
//! Concurrent misses share one in-flight fetch when coalescing is enabled.

use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::audit::{self, AuditEvent};
use crate::origin::OriginClient;
use crate::store::{self, CacheStore};
use crate::{Error, Result};

/// Cache key prefix for individual public keys
pub const KEY_PREFIX: &str = "jwks:key:";

/// Cache key for `kid`
#[must_use]
pub fn cache_key(kid: &str) -> String {
    format!("{KEY_PREFIX}{kid}")
}

/// RSA public key in JWK form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey {
    /// Key id
    pub kid: String,
    /// Base64url modulus
    pub n: String,
    /// Base64url exponent
    pub e: String,
    /// Key type (`RSA`)
    #[serde(default = "default_kty")]
    pub kty: String,
    /// Signing algorithm the key is registered for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
}

fn default_kty() -> String {
    "RSA".to_string()
}

type KeySetFetch = Shared<BoxFuture<'static, std::result::Result<Arc<Vec<PublicKey>>, String>>>;

/// Fetch-through cache of the origin's signing keys
#[derive(Clone)]
pub struct PublicKeyCache {
    cache: Arc<dyn CacheStore>,
    origin: Arc<dyn OriginClient>,
    ttl: Duration,
    coalesce: bool,
    in_flight: Arc<Mutex<Option<KeySetFetch>>>,
}

impl PublicKeyCache {
    /// Create a cache; each stored key lives for `ttl`
    #[must_use]
    pub fn new(
        cache: Arc<dyn CacheStore>,
        origin: Arc<dyn OriginClient>,
        ttl: Duration,
        coalesce: bool,
    ) -> Self {
        Self {
            cache,
            origin,
            ttl,
            coalesce,
            in_flight: Arc::new(Mutex::new(None)),
        }
    }

    /// Resolve `kid` to a public key
    ///
    /// # Errors
    ///
    /// [`Error::PublicKeyNotFound`] if the freshly fetched set does not
    /// contain `kid`; [`Error::KeyRefreshFailed`] if the fetch failed.
    pub async fn get_public_key(&self, kid: &str) -> Result<PublicKey> {
        match store::get_json::<PublicKey>(self.cache.as_ref(), &cache_key(kid)).await {
            Ok(Some(key)) => return Ok(key),
            Ok(None) => debug!(kid, "Public key cache miss"),
            Err(e) => warn!(kid, error = %e, "Public key cache read failed, fetching from origin"),
        }

        let keys = self.active_keys().await?;
        keys.iter()
            .find(|k| k.kid == kid)
            .cloned()
            .ok_or_else(|| Error::PublicKeyNotFound(kid.to_string()))
    }

    /// Fetch the full active set and cache every key. Returns how many keys
    /// were cached.
    ///
    /// Always fetches: an in-flight fetch may predate the rotation that
    /// triggered this call. Lookups that miss afterwards join this fetch.
    ///
    /// # Errors
    ///
    /// [`Error::KeyRefreshFailed`] if the origin fetch failed.
    pub async fn refresh_all_keys(&self) -> Result<usize> {
        let fetch = if self.coalesce {
            self.start_fetch()
        } else {
            self.detached_fetch()
        };
        Ok(self.await_fetch(fetch).await?.len())
    }

    async fn active_keys(&self) -> Result<Arc<Vec<PublicKey>>> {
        let fetch = if self.coalesce {
            self.join_or_start_fetch()
        } else {
            self.detached_fetch()
        };
        self.await_fetch(fetch).await
    }

    async fn await_fetch(&self, fetch: KeySetFetch) -> Result<Arc<Vec<PublicKey>>> {
        let result = fetch.clone().await;

        let mut slot = self.in_flight.lock();
        if slot.as_ref().is_some_and(|current| current.ptr_eq(&fetch)) {
            *slot = None;
        }
        drop(slot);

        result.map_err(Error::KeyRefreshFailed)
    }

    fn join_or_start_fetch(&self) -> KeySetFetch {
        let mut slot = self.in_flight.lock();
        if let Some(fetch) = slot.as_ref() {
            // A finished fetch left behind by a cancelled waiter is stale
            if fetch.peek().is_none() {
                debug!("Joining in-flight key set fetch");
                return fetch.clone();
            }
        }

        let fetch = self.detached_fetch();
        *slot = Some(fetch.clone());
        fetch
    }

    /// Start a fetch and make it the one later misses join
    fn start_fetch(&self) -> KeySetFetch {
        let fetch = self.detached_fetch();
        *self.in_flight.lock() = Some(fetch.clone());
        fetch
    }

    fn detached_fetch(&self) -> KeySetFetch {
        load_key_set(Arc::clone(&self.cache), Arc::clone(&self.origin), self.ttl)
            .map(|result| result.map(Arc::new).map_err(|e| e.to_string()))
            .boxed()
            .shared()
    }
}

/// Fetch the active set and upsert each key
async fn load_key_set(
    cache: Arc<dyn CacheStore>,
    origin: Arc<dyn OriginClient>,
    ttl: Duration,
) -> Result<Vec<PublicKey>> {
    let keys: Vec<PublicKey> = origin
        .list_active_keys()
        .await?
        .into_iter()
        .filter(|k| {
            let usable = !k.kid.trim().is_empty();
            if !usable {
                warn!("Origin returned a key without kid, skipping");
            }
            usable
        })
        .collect();

    for key in &keys {
        // A failed write only costs a later refetch
        if let Err(e) = store::set_json(cache.as_ref(), &cache_key(&key.kid), key, ttl).await {
            warn!(kid = %key.kid, error = %e, "Failed to cache public key");
        }
    }

    audit::emit(&AuditEvent::keys_refreshed(keys.len()));
    Ok(keys)
}
