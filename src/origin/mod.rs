//! Origin (identity authority) client interface.
//!
//! The origin owns signing keys, the permission model and token issuance.
//! The gateway only consumes the four operations of [`OriginClient`].
//! All of them except [`OriginClient::refresh_token`] are safe to retry.

pub mod http;
pub mod retry;

use permission_model::{PermissionHash, PermissionSpec};

use crate::Result;
use crate::keys::PublicKey;
use crate::token::TokenPair;

pub use http::HttpOriginClient;
pub use retry::{RetryPolicy, with_retry};

/// Read/exchange operations the gateway needs from the origin
#[async_trait::async_trait]
pub trait OriginClient: Send + Sync + 'static {
    /// The full set of currently active signing keys
    async fn list_active_keys(&self) -> Result<Vec<PublicKey>>;

    /// The endpoint policy table
    async fn fetch_permission_spec(&self) -> Result<PermissionSpec>;

    /// One user's permission digest within a tenant
    async fn fetch_user_permissions(&self, tenant_id: &str, user_id: &str) -> Result<PermissionHash>;

    /// Exchange a refresh token for a new pair. Not idempotent: callers must
    /// only invoke this after the reuse check, under the rotation lock.
    async fn refresh_token(&self, tenant_id: &str, refresh_token: &str) -> Result<TokenPair>;
}
