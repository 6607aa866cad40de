//! Per-request composition of the coordinators.
//!
//! ```text
//! endpoint public? ──yes──▶ authorized
//!        │no
//! parse ─▶ key lookup ─▶ signature ─▶ claims ─▶ expired? ──no──▶ permissions
//!                                                  │yes
//!                                   refresh token? ─▶ rotate ─▶ re-authenticate
//! ```

use std::sync::Arc;

use permission_model::EndpointPermission;
use serde::Serialize;
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::keys::PublicKeyCache;
use crate::origin::{HttpOriginClient, OriginClient};
use crate::permission::{PermissionValidator, ValidationRequest};
use crate::refresh::TokenRefreshCoordinator;
use crate::store::{CacheBlacklist, CacheStore, LockService};
use crate::token::{self, AccessToken, JwtClaims, RefreshToken, TokenPair};
use crate::{Error, Result};

/// Credentials and target of one proxied request
#[derive(Debug, Clone, Default)]
pub struct GateRequest {
    /// Bearer access token
    pub access_token: Option<String>,
    /// Refresh credential (cookie or header), used only when the access
    /// token has expired
    pub refresh_token: Option<String>,
    /// Request path
    pub path: String,
    /// HTTP method
    pub method: String,
}

/// A request that may proceed
#[derive(Debug, Clone, Serialize)]
pub struct Authorization {
    /// Token subject; absent for public endpoints
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// Token tenant; absent for public endpoints
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    /// Endpoint rule that granted access
    pub endpoint: EndpointPermission,
    /// New credentials when the expired access token was rotated
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotated: Option<TokenPair>,
}

/// Verified token
#[derive(Debug, Clone)]
pub struct Authenticated {
    /// Parsed token
    pub token: AccessToken,
    /// Decoded claims
    pub claims: JwtClaims,
}

/// Authenticates and authorizes requests
#[derive(Clone)]
pub struct Gatekeeper {
    keys: PublicKeyCache,
    permissions: PermissionValidator,
    refresh: TokenRefreshCoordinator,
    clock: Arc<dyn Clock>,
}

impl Gatekeeper {
    /// Compose from ready coordinators
    #[must_use]
    pub fn new(
        keys: PublicKeyCache,
        permissions: PermissionValidator,
        refresh: TokenRefreshCoordinator,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            keys,
            permissions,
            refresh,
            clock,
        }
    }

    /// Build the coordinators from configuration over the given stores,
    /// talking to the origin over HTTP.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the origin client cannot be built.
    pub fn from_config(
        config: &Config,
        cache: Arc<dyn CacheStore>,
        locks: Arc<dyn LockService>,
    ) -> Result<Self> {
        let origin: Arc<dyn OriginClient> = Arc::new(HttpOriginClient::new(&config.origin)?);
        Ok(Self::with_origin(config, cache, locks, origin, Arc::new(SystemClock)))
    }

    /// Build the coordinators from configuration with an explicit origin
    /// client and clock
    #[must_use]
    pub fn with_origin(
        config: &Config,
        cache: Arc<dyn CacheStore>,
        locks: Arc<dyn LockService>,
        origin: Arc<dyn OriginClient>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let keys = PublicKeyCache::new(
            Arc::clone(&cache),
            Arc::clone(&origin),
            config.keys.ttl,
            config.keys.coalesce_fetches,
        );
        let permissions = PermissionValidator::new(
            Arc::clone(&cache),
            Arc::clone(&origin),
            config.permissions.spec_ttl,
            config.permissions.hash_ttl,
        );
        let refresh = TokenRefreshCoordinator::new(
            locks,
            Arc::new(CacheBlacklist::new(cache)),
            origin,
            Arc::clone(&clock),
            config.refresh.lock_lease,
            config.refresh.token_lifetime,
        );
        Self::new(keys, permissions, refresh, clock)
    }

    /// Public key cache
    #[must_use]
    pub fn keys(&self) -> &PublicKeyCache {
        &self.keys
    }

    /// Permission validator
    #[must_use]
    pub fn permissions(&self) -> &PermissionValidator {
        &self.permissions
    }

    /// Refresh coordinator
    #[must_use]
    pub fn refresh(&self) -> &TokenRefreshCoordinator {
        &self.refresh
    }

    /// Verify a token's structure, signature and expiry
    ///
    /// # Errors
    ///
    /// [`Error::InvalidToken`], [`Error::PublicKeyNotFound`],
    /// [`Error::KeyRefreshFailed`] or [`Error::TokenExpired`].
    pub async fn authenticate(&self, raw: &str) -> Result<Authenticated> {
        let verified = self.verify(raw).await?;
        if token::is_expired(&verified.claims, self.clock.as_ref()) {
            return Err(Error::TokenExpired);
        }
        Ok(verified)
    }

    /// Structure, key and signature checks; no expiry check
    async fn verify(&self, raw: &str) -> Result<Authenticated> {
        let token = token::parse(raw)?;
        let key = self.keys.get_public_key(token.key_id()).await?;
        if !token::verify_signature(token.as_str(), &key) {
            return Err(Error::invalid_token("signature verification failed"));
        }
        let claims = token::extract_claims(token.as_str())?;
        Ok(Authenticated { token, claims })
    }

    /// Decide whether `request` may proceed.
    ///
    /// Public endpoints pass regardless of token state. Otherwise the access
    /// token is authenticated; an expired token is rotated when a refresh
    /// credential is present and the new access token is used instead.
    ///
    /// # Errors
    ///
    /// Any taxonomy error; a checked-and-refused request is
    /// [`Error::PermissionDenied`].
    pub async fn authorize_request(&self, request: &GateRequest) -> Result<Authorization> {
        match self.permissions.match_endpoint(&request.path, &request.method).await {
            Ok(endpoint) if endpoint.public => {
                debug!(path = %request.path, method = %request.method, "Public endpoint");
                return Ok(Authorization {
                    subject: None,
                    tenant_id: None,
                    endpoint,
                    rotated: None,
                });
            }
            Err(e @ Error::PermissionLookupFailed(_)) => return Err(e),
            // Undeclared endpoints are judged after authentication
            Ok(_) | Err(_) => {}
        }

        let raw = request
            .access_token
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| Error::invalid_token("missing bearer token"))?;

        let (authenticated, rotated) = match self.authenticate(raw).await {
            Ok(authenticated) => (authenticated, None),
            Err(Error::TokenExpired) => match request.refresh_token.as_deref() {
                Some(refresh_token) => {
                    let (authenticated, pair) = self.rotate_expired(raw, refresh_token).await?;
                    (authenticated, Some(pair))
                }
                None => return Err(Error::TokenExpired),
            },
            Err(e) => return Err(e),
        };

        let claims = authenticated.claims;
        let tenant_id = claims
            .tenant_id
            .clone()
            .ok_or_else(|| Error::invalid_token("token has no tenant"))?;

        let outcome = self
            .permissions
            .validate(&ValidationRequest {
                user_id: claims.subject.clone(),
                tenant_id: tenant_id.clone(),
                permission_hash: claims.permission_hash.clone(),
                scopes: claims.scopes.clone(),
                path: request.path.clone(),
                method: request.method.clone(),
            })
            .await?;

        if !outcome.authorized {
            return Err(Error::PermissionDenied);
        }

        Ok(Authorization {
            subject: Some(claims.subject),
            tenant_id: Some(tenant_id),
            endpoint: outcome.matched_endpoint,
            rotated,
        })
    }

    /// Rotate on behalf of the (signature-verified) expired token's subject
    async fn rotate_expired(
        &self,
        expired: &str,
        refresh_token: &str,
    ) -> Result<(Authenticated, TokenPair)> {
        let claims = self.verify(expired).await?.claims;
        let tenant_id = claims
            .tenant_id
            .as_deref()
            .ok_or_else(|| Error::invalid_token("token has no tenant"))?;

        let refresh_token = RefreshToken::new(refresh_token)?;
        let pair = self
            .refresh
            .rotate(tenant_id, &claims.subject, refresh_token)
            .await?;

        let authenticated = self.authenticate(&pair.access_token).await.map_err(|e| {
            Error::UpstreamRefreshFailed(format!("origin issued an unusable access token: {e}"))
        })?;
        if authenticated.claims.subject != claims.subject
            || authenticated.claims.tenant_id != claims.tenant_id
        {
            return Err(Error::UpstreamRefreshFailed(
                "rotated token belongs to a different principal".to_string(),
            ));
        }

        debug!(tenant_id, subject = %claims.subject, "Expired access token rotated");
        Ok((authenticated, pair))
    }
}
