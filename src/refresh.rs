//! Refresh-token rotation with mutual exclusion and reuse detection.
//!
//! # Rotation order
//!
//! 1. Take `refresh:lock:{tenant}:{user}` without waiting.
//! 2. Reject the token if `refresh:blacklist:{tenant}:{sha256}` exists; the
//!    origin is never called for a reused token.
//! 3. Exchange the token at the origin (sent once, never retried).
//! 4. Blacklist the consumed token for its remaining lifetime.
//! 5. Release the lock.
//!
//! Steps 2–5 run on a spawned task that owns the lock, so a caller that stops
//! polling cannot leave the lock held. Panics inside the task are caught and
//! the lock is still released.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tracing::{debug, error, warn};

use crate::audit::{self, AuditEvent};
use crate::clock::Clock;
use crate::origin::OriginClient;
use crate::store::{Blacklist, LockService};
use crate::token::{RefreshToken, TokenPair};
use crate::{Error, Result};

/// Rotation lock key for one user
#[must_use]
pub fn lock_key(tenant_id: &str, user_id: &str) -> String {
    format!("refresh:lock:{tenant_id}:{user_id}")
}

/// Blacklist key for a consumed token, identified by its fingerprint
#[must_use]
pub fn blacklist_key(tenant_id: &str, token: &RefreshToken) -> String {
    format!("refresh:blacklist:{tenant_id}:{}", token.fingerprint())
}

/// Coordinates refresh-token rotation
#[derive(Clone)]
pub struct TokenRefreshCoordinator {
    locks: Arc<dyn LockService>,
    blacklist: Arc<dyn Blacklist>,
    origin: Arc<dyn OriginClient>,
    clock: Arc<dyn Clock>,
    lease: Duration,
    token_lifetime: Duration,
}

impl TokenRefreshCoordinator {
    /// Create a coordinator.
    ///
    /// `lease` bounds how long a crashed holder can block a user's rotation;
    /// `token_lifetime` is the blacklist TTL for tokens without an expiry.
    #[must_use]
    pub fn new(
        locks: Arc<dyn LockService>,
        blacklist: Arc<dyn Blacklist>,
        origin: Arc<dyn OriginClient>,
        clock: Arc<dyn Clock>,
        lease: Duration,
        token_lifetime: Duration,
    ) -> Self {
        Self {
            locks,
            blacklist,
            origin,
            clock,
            lease,
            token_lifetime,
        }
    }

    /// Exchange `refresh_token` for a new pair
    ///
    /// # Errors
    ///
    /// - [`Error::LockAcquisitionFailed`] if another rotation for this user is
    ///   in flight or the lock service failed
    /// - [`Error::RefreshTokenReused`] if the token was already rotated
    /// - [`Error::UpstreamRefreshFailed`] if the origin exchange or the
    ///   blacklist write failed
    pub async fn rotate(
        &self,
        tenant_id: &str,
        user_id: &str,
        refresh_token: RefreshToken,
    ) -> Result<TokenPair> {
        let lock = lock_key(tenant_id, user_id);

        match self.locks.try_acquire(&lock, self.lease).await {
            Ok(true) => {}
            Ok(false) => {
                audit::emit(&AuditEvent::lock_contended(tenant_id, user_id));
                return Err(Error::LockAcquisitionFailed(lock));
            }
            Err(e) => {
                warn!(lock = %lock, error = %e, "Lock service failed");
                return Err(Error::LockAcquisitionFailed(lock));
            }
        }
        debug!(lock = %lock, "Rotation lock acquired");

        let this = self.clone();
        let tenant_id = tenant_id.to_string();
        let user_id = user_id.to_string();
        let task = tokio::spawn(async move {
            let outcome = AssertUnwindSafe(this.locked_rotation(&tenant_id, &user_id, &refresh_token))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    error!(panic = panic_message(&*panic), "Rotation panicked");
                    Err(Error::UpstreamRefreshFailed("rotation aborted".to_string()))
                });
            this.release(&lock).await;
            outcome
        });

        task.await
            .unwrap_or_else(|e| Err(Error::UpstreamRefreshFailed(format!("rotation task failed: {e}"))))
    }

    /// Steps that run while the lock is held
    async fn locked_rotation(
        &self,
        tenant_id: &str,
        user_id: &str,
        refresh_token: &RefreshToken,
    ) -> Result<TokenPair> {
        let key = blacklist_key(tenant_id, refresh_token);

        // Fail closed: an unreadable blacklist must not let a token through
        let reused = self.blacklist.contains(&key).await.map_err(|e| {
            Error::UpstreamRefreshFailed(format!("blacklist lookup failed: {e}"))
        })?;
        if reused {
            audit::emit(&AuditEvent::reuse_detected(
                tenant_id,
                user_id,
                &refresh_token.fingerprint(),
            ));
            return Err(Error::RefreshTokenReused);
        }

        let pair = self
            .origin
            .refresh_token(tenant_id, refresh_token.as_str())
            .await
            .map_err(|e| Error::UpstreamRefreshFailed(e.to_string()))?;

        let ttl = refresh_token.remaining_lifetime(self.clock.now(), self.token_lifetime);
        self.blacklist.insert(&key, ttl).await.map_err(|e| {
            error!(tenant_id, user_id, error = %e, "Consumed refresh token not recorded");
            Error::UpstreamRefreshFailed(format!("blacklist write failed: {e}"))
        })?;

        audit::emit(&AuditEvent::rotated(
            tenant_id,
            user_id,
            &refresh_token.fingerprint(),
        ));
        Ok(pair)
    }

    async fn release(&self, lock: &str) {
        match self.locks.release(lock).await {
            Ok(()) => debug!(lock, "Rotation lock released"),
            // The lease expires on its own
            Err(e) => warn!(lock, error = %e, "Failed to release rotation lock"),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
