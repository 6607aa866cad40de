//! HTTP/JSON origin client
//!
//! | Operation | Request |
//! |-----------|---------|
//! | list active keys | `GET {base}/keys` (JWKS `{"keys": [...]}` or a bare array) |
//! | permission spec | `GET {base}/permissions/spec` |
//! | user permissions | `GET {base}/tenants/{tenant}/users/{user}/permissions` |
//! | refresh | `POST {base}/tenants/{tenant}/tokens/refresh` with `{"refresh_token": ...}` |
//!
//! Every request carries the configured connect and total timeouts. Reads
//! go through the retry policy; the refresh exchange is sent exactly once.

use std::time::Duration;

use permission_model::{PermissionHash, PermissionSpec};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use super::OriginClient;
use super::retry::{RetryPolicy, with_retry};
use crate::config::OriginConfig;
use crate::keys::PublicKey;
use crate::token::TokenPair;
use crate::{Error, Result};

/// Origin client over HTTP
pub struct HttpOriginClient {
    http: Client,
    base_url: Url,
    service_token: Option<String>,
    retry: RetryPolicy,
}

/// `GET /keys` body: a JWKS document or a bare key array
///
/// Entries are parsed one by one; anything but a well-formed RSA key is
/// skipped.
#[derive(Deserialize)]
#[serde(untagged)]
enum KeySetResponse {
    Jwks { keys: Vec<serde_json::Value> },
    Bare(Vec<serde_json::Value>),
}

impl KeySetResponse {
    fn into_keys(self) -> Vec<PublicKey> {
        let (Self::Jwks { keys } | Self::Bare(keys)) = self;
        keys.into_iter().filter_map(parse_rsa_key).collect()
    }
}

fn parse_rsa_key(entry: serde_json::Value) -> Option<PublicKey> {
    let kty = entry.get("kty").and_then(serde_json::Value::as_str).unwrap_or("RSA");
    if kty != "RSA" {
        debug!(kty, kid = ?entry.get("kid"), "Skipping non-RSA key");
        return None;
    }
    match serde_json::from_value(entry) {
        Ok(key) => Some(key),
        Err(e) => {
            warn!(error = %e, "Skipping malformed key in origin key set");
            None
        }
    }
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

impl HttpOriginClient {
    /// Build a client from configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the base URL does not parse or the HTTP client
    /// cannot be constructed.
    pub fn new(config: &OriginConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| Error::Config(format!("Invalid origin base_url: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(Error::Config(format!(
                "Origin base_url cannot be a base: {base_url}"
            )));
        }

        let http = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .user_agent(concat!("gateway-auth/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            base_url,
            service_token: config.resolve_service_token(),
            retry: RetryPolicy::new(&config.retry),
        })
    }

    /// Resolve `segments` below the base URL, percent-encoding each one
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.service_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, operation: &str, url: Url) -> Result<T> {
        with_retry(&self.retry, operation, || {
            let request = self.authorize(self.http.get(url.clone()));
            async move {
                let started = std::time::Instant::now();
                let response = request.send().await?.error_for_status()?;
                let body = response.json::<T>().await?;
                debug!(
                    operation,
                    elapsed_ms = elapsed_ms(started.elapsed()),
                    "Origin call succeeded"
                );
                Ok(body)
            }
        })
        .await
    }
}

#[allow(clippy::cast_possible_truncation)]
fn elapsed_ms(d: Duration) -> u64 {
    d.as_millis() as u64
}

#[async_trait::async_trait]
impl OriginClient for HttpOriginClient {
    async fn list_active_keys(&self) -> Result<Vec<PublicKey>> {
        let body: KeySetResponse = self.get_json("list_active_keys", self.url(&["keys"])).await?;
        Ok(body.into_keys())
    }

    async fn fetch_permission_spec(&self) -> Result<PermissionSpec> {
        self.get_json(
            "fetch_permission_spec",
            self.url(&["permissions", "spec"]),
        )
        .await
    }

    async fn fetch_user_permissions(&self, tenant_id: &str, user_id: &str) -> Result<PermissionHash> {
        self.get_json(
            "fetch_user_permissions",
            self.url(&["tenants", tenant_id, "users", user_id, "permissions"]),
        )
        .await
    }

    async fn refresh_token(&self, tenant_id: &str, refresh_token: &str) -> Result<TokenPair> {
        let url = self.url(&["tenants", tenant_id, "tokens", "refresh"]);
        let request = self
            .authorize(self.http.post(url))
            .json(&RefreshRequest { refresh_token });

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Origin(format!("refresh rejected with status {status}")));
        }
        Ok(response.json::<TokenPair>().await?)
    }
}
