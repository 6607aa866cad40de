//! Permission validation against the cached permission spec.
//!
//! The permission spec lives under `permission:spec` and each user's digest under
//! `permission:hash:{tenant}:{user}`; both are fetched from the origin on a
//! miss. Lookup is default-deny: an undeclared endpoint is never public.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use permission_model::{AccessCheck, EndpointPermission, PermissionHash, PermissionSpec};
use serde::Serialize;
use tracing::{debug, warn};

use crate::audit::{self, AuditEvent};
use crate::origin::OriginClient;
use crate::store::{self, CacheStore};
use crate::{Error, Result};

/// Cache key of the permission spec
pub const SPEC_KEY: &str = "permission:spec";

/// Cache key prefix of permission digests
pub const HASH_PREFIX: &str = "permission:hash:";

/// Digest cache key for one (tenant, user)
#[must_use]
pub fn hash_key(tenant_id: &str, user_id: &str) -> String {
    format!("{HASH_PREFIX}{tenant_id}:{user_id}")
}

/// Prefix covering every digest of a tenant
fn tenant_prefix(tenant_id: &str) -> String {
    format!("{HASH_PREFIX}{tenant_id}:")
}

/// An authenticated request to authorize
#[derive(Debug, Clone)]
pub struct ValidationRequest {
    /// Token subject
    pub user_id: String,
    /// Tenant the token was issued for
    pub tenant_id: String,
    /// Digest asserted by the access token, if any
    pub permission_hash: Option<String>,
    /// Scopes granted to the token; a non-empty set narrows the user's roles
    pub scopes: BTreeSet<String>,
    /// Request path, query string allowed
    pub path: String,
    /// HTTP method
    pub method: String,
}

/// Authorization decision
#[derive(Debug, Clone, Serialize)]
pub struct ValidationOutcome {
    /// Whether the request may proceed
    pub authorized: bool,
    /// Endpoint rule the request was judged against
    pub matched_endpoint: EndpointPermission,
}

/// Authorizes requests against the permission spec and user digests
#[derive(Clone)]
pub struct PermissionValidator {
    cache: Arc<dyn CacheStore>,
    origin: Arc<dyn OriginClient>,
    spec_ttl: Duration,
    hash_ttl: Duration,
}

impl PermissionValidator {
    /// Create a validator
    #[must_use]
    pub fn new(
        cache: Arc<dyn CacheStore>,
        origin: Arc<dyn OriginClient>,
        spec_ttl: Duration,
        hash_ttl: Duration,
    ) -> Self {
        Self {
            cache,
            origin,
            spec_ttl,
            hash_ttl,
        }
    }

    /// Decide whether `request` may proceed.
    ///
    /// A denial is `Ok` with `authorized == false`; what was missing goes to
    /// the audit log only.
    ///
    /// # Errors
    ///
    /// [`Error::PermissionSpecNotFound`] when no endpoint matches;
    /// [`Error::PermissionLookupFailed`] when the permission spec or digest cannot be
    /// loaded.
    pub async fn validate(&self, request: &ValidationRequest) -> Result<ValidationOutcome> {
        let endpoint = match self.match_endpoint(&request.path, &request.method).await {
            Err(e @ Error::PermissionSpecNotFound { .. }) => {
                audit::emit(&AuditEvent::spec_missing(
                    &request.tenant_id,
                    &request.user_id,
                    &request.path,
                    &request.method,
                ));
                return Err(e);
            }
            other => other?,
        };

        if endpoint.public {
            return Ok(ValidationOutcome {
                authorized: true,
                matched_endpoint: endpoint,
            });
        }

        let digest = self
            .effective_digest(
                &request.tenant_id,
                &request.user_id,
                request.permission_hash.as_deref(),
            )
            .await?;

        let roles: BTreeSet<String> = if request.scopes.is_empty() {
            digest.roles
        } else {
            digest.roles.intersection(&request.scopes).cloned().collect()
        };

        let authorized = match endpoint.check(&digest.permissions, &roles) {
            AccessCheck::Granted => true,
            AccessCheck::Denied {
                missing_permissions,
                missing_role,
            } => {
                audit::emit(&AuditEvent::denied(
                    &request.tenant_id,
                    &request.user_id,
                    &request.path,
                    &request.method,
                    missing_permissions,
                    missing_role,
                ));
                false
            }
        };

        Ok(ValidationOutcome {
            authorized,
            matched_endpoint: endpoint,
        })
    }

    /// Find the endpoint rule for `(path, method)`
    ///
    /// # Errors
    ///
    /// [`Error::PermissionSpecNotFound`] when nothing matches;
    /// [`Error::PermissionLookupFailed`] when the permission spec cannot be loaded.
    pub async fn match_endpoint(&self, path: &str, method: &str) -> Result<EndpointPermission> {
        let spec = self.load_spec().await?;
        spec.find_endpoint(path, method)
            .cloned()
            .ok_or_else(|| Error::PermissionSpecNotFound {
                path: path.to_string(),
                method: method.to_string(),
            })
    }

    /// Drop the cached spec. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns the store error if the delete fails.
    pub async fn invalidate_spec(&self) -> Result<()> {
        let existed = self.cache.delete(SPEC_KEY).await?;
        debug!(existed, "Permission spec invalidated");
        Ok(())
    }

    /// Drop one user's cached digest. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns the store error if the delete fails.
    pub async fn invalidate_user(&self, tenant_id: &str, user_id: &str) -> Result<()> {
        let existed = self.cache.delete(&hash_key(tenant_id, user_id)).await?;
        debug!(tenant_id, user_id, existed, "Permission digest invalidated");
        Ok(())
    }

    /// Drop every cached digest of a tenant. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns the store error if the delete fails.
    pub async fn invalidate_tenant(&self, tenant_id: &str) -> Result<usize> {
        let removed = self.cache.delete_by_prefix(&tenant_prefix(tenant_id)).await?;
        debug!(tenant_id, removed, "Tenant permission digests invalidated");
        Ok(removed)
    }

    async fn load_spec(&self) -> Result<PermissionSpec> {
        match store::get_json::<PermissionSpec>(self.cache.as_ref(), SPEC_KEY).await {
            Ok(Some(spec)) => return Ok(spec),
            Ok(None) => debug!("Permission spec cache miss"),
            Err(e) => warn!(error = %e, "Permission spec cache read failed, fetching from origin"),
        }

        let spec = self
            .origin
            .fetch_permission_spec()
            .await
            .map_err(|e| Error::PermissionLookupFailed(format!("permission spec: {e}")))?;

        if let Err(e) = store::set_json(self.cache.as_ref(), SPEC_KEY, &spec, self.spec_ttl).await {
            warn!(error = %e, "Failed to cache permission spec");
        }
        debug!(version = spec.version, endpoints = spec.endpoints.len(), "Permission spec loaded");
        Ok(spec)
    }

    /// Cached digest when the token's digest matches it, else a fresh one
    async fn effective_digest(
        &self,
        tenant_id: &str,
        user_id: &str,
        token_hash: Option<&str>,
    ) -> Result<PermissionHash> {
        let key = hash_key(tenant_id, user_id);

        if let Some(token_hash) = token_hash {
            match store::get_json::<PermissionHash>(self.cache.as_ref(), &key).await {
                Ok(Some(cached)) if cached.hash == token_hash => return Ok(cached),
                Ok(Some(_)) => debug!(tenant_id, user_id, "Permission digest changed since token issue"),
                Ok(None) => {}
                Err(e) => warn!(tenant_id, user_id, error = %e, "Permission digest cache read failed"),
            }
        }

        let digest = self
            .origin
            .fetch_user_permissions(tenant_id, user_id)
            .await
            .map_err(|e| Error::PermissionLookupFailed(format!("permissions of {tenant_id}/{user_id}: {e}")))?;

        if let Err(e) = store::set_json(self.cache.as_ref(), &key, &digest, self.hash_ttl).await {
            warn!(tenant_id, user_id, error = %e, "Failed to cache permission digest");
        }
        Ok(digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::PublicKey;
    use crate::store::InMemoryCacheStore;
    use crate::token::TokenPair;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct PolicyOrigin {
        spec: PermissionSpec,
        digest: PermissionHash,
        spec_calls: AtomicUsize,
        digest_calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl OriginClient for PolicyOrigin {
        async fn list_active_keys(&self) -> Result<Vec<PublicKey>> {
            unimplemented!()
        }

        async fn fetch_permission_spec(&self) -> Result<PermissionSpec> {
            self.spec_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.spec.clone())
        }

        async fn fetch_user_permissions(&self, _: &str, _: &str) -> Result<PermissionHash> {
            self.digest_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.digest.clone())
        }

        async fn refresh_token(&self, _: &str, _: &str) -> Result<TokenPair> {
            unimplemented!()
        }
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    fn validator() -> (PermissionValidator, Arc<PolicyOrigin>) {
        let origin = Arc::new(PolicyOrigin {
            spec: PermissionSpec {
                version: 3,
                updated_at: Utc::now(),
                endpoints: vec![
                    EndpointPermission::new("orders", "/orders/{id}", "GET")
                        .with_permissions(["orders:read"]),
                    EndpointPermission::new("admin", "/admin/**", "*").with_roles(["admin"]),
                    EndpointPermission::new("web", "/health", "GET").public(),
                ],
            },
            digest: PermissionHash {
                hash: "h1".to_string(),
                permissions: set(&["orders:read"]),
                roles: set(&["admin", "viewer"]),
                generated_at: Utc::now(),
            },
            spec_calls: AtomicUsize::new(0),
            digest_calls: AtomicUsize::new(0),
        });
        let validator = PermissionValidator::new(
            Arc::new(InMemoryCacheStore::new()),
            Arc::clone(&origin) as Arc<dyn OriginClient>,
            Duration::from_secs(60),
            Duration::from_secs(60),
        );
        (validator, origin)
    }

    fn request(path: &str, method: &str) -> ValidationRequest {
        ValidationRequest {
            user_id: "u1".to_string(),
            tenant_id: "acme".to_string(),
            permission_hash: Some("h1".to_string()),
            scopes: BTreeSet::new(),
            path: path.to_string(),
            method: method.to_string(),
        }
    }

    #[tokio::test]
    async fn spec_is_fetched_once_then_cached() {
        let (validator, origin) = validator();

        validator.validate(&request("/orders/1", "GET")).await.unwrap();
        validator.validate(&request("/orders/2", "GET")).await.unwrap();

        assert_eq!(origin.spec_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn matching_token_digest_reuses_cached_entry() {
        // GIVEN: a first validation that caches digest "h1"
        let (validator, origin) = validator();
        validator.validate(&request("/orders/1", "GET")).await.unwrap();

        // WHEN: the token asserts the same digest
        let outcome = validator.validate(&request("/orders/9", "GET")).await.unwrap();

        // THEN: authorized without a second fetch
        assert!(outcome.authorized);
        assert_eq!(origin.digest_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stale_or_absent_token_digest_refetches() {
        let (validator, origin) = validator();
        validator.validate(&request("/orders/1", "GET")).await.unwrap();

        let mut stale = request("/orders/1", "GET");
        stale.permission_hash = Some("h0".to_string());
        validator.validate(&stale).await.unwrap();

        let mut absent = request("/orders/1", "GET");
        absent.permission_hash = None;
        validator.validate(&absent).await.unwrap();

        assert_eq!(origin.digest_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn scopes_narrow_roles() {
        let (validator, _) = validator();

        let mut scoped = request("/admin/users", "POST");
        scoped.scopes = set(&["viewer"]);
        assert!(!validator.validate(&scoped).await.unwrap().authorized);

        scoped.scopes = set(&["admin"]);
        assert!(validator.validate(&scoped).await.unwrap().authorized);
    }

    #[tokio::test]
    async fn public_endpoint_skips_digest_lookup() {
        let (validator, origin) = validator();

        let outcome = validator.validate(&request("/health", "GET")).await.unwrap();

        assert!(outcome.authorized);
        assert!(outcome.matched_endpoint.public);
        assert_eq!(origin.digest_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn undeclared_endpoint_is_spec_not_found() {
        let (validator, _) = validator();
        let err = validator.validate(&request("/invoices", "GET")).await.unwrap_err();
        assert!(matches!(err, Error::PermissionSpecNotFound { .. }));
        assert!(err.is_denial());
    }

    #[tokio::test]
    async fn invalidations_are_idempotent_and_scoped() {
        let (validator, origin) = validator();
        validator.validate(&request("/orders/1", "GET")).await.unwrap();

        validator.invalidate_spec().await.unwrap();
        validator.invalidate_spec().await.unwrap();
        validator.invalidate_user("acme", "u1").await.unwrap();
        validator.invalidate_user("acme", "u1").await.unwrap();
        assert_eq!(validator.invalidate_tenant("acme").await.unwrap(), 0);

        validator.validate(&request("/orders/1", "GET")).await.unwrap();
        assert_eq!(origin.spec_calls.load(Ordering::SeqCst), 2);
        assert_eq!(origin.digest_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn tenant_prefix_does_not_cover_longer_tenant_names() {
        let key = hash_key("acme-eu", "u1");
        assert!(!key.starts_with(&tenant_prefix("acme")));
        assert!(hash_key("acme", "u1").starts_with(&tenant_prefix("acme")));
    }
}
