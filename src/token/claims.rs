//! Claims codec: token structure parsing and payload decoding.
//!
//! Nothing in here checks signatures. [`parse`] only proves the token has the
//! right shape and names a signing key; [`extract_claims`] decodes the payload
//! so the caller can run the expiry check once the signature is verified.

use std::collections::BTreeSet;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::Clock;
use crate::{Error, Result};

/// A structurally valid bearer token
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    value: String,
    key_id: String,
    algorithm: Option<String>,
}

impl AccessToken {
    /// The raw token string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.value
    }

    /// Header `kid`
    #[must_use]
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Header `alg`, when present
    #[must_use]
    pub fn algorithm(&self) -> Option<&str> {
        self.algorithm.as_deref()
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("key_id", &self.key_id)
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

/// Decoded token payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JwtClaims {
    /// `sub`
    pub subject: String,
    /// `iss`
    pub issuer: String,
    /// `exp`
    pub expires_at: DateTime<Utc>,
    /// `iat`
    pub issued_at: Option<DateTime<Utc>>,
    /// Roles asserted by the token (empty when absent)
    pub roles: BTreeSet<String>,
    /// Tenant the token was issued for
    pub tenant_id: Option<String>,
    /// Permission digest asserted by the token
    pub permission_hash: Option<String>,
    /// Whether the subject completed MFA
    pub mfa_verified: bool,
    /// Scopes granted to the token (`scope` string or `scp` array)
    pub scopes: BTreeSet<String>,
}

/// Wire form of the payload; required claims are optional here so a missing
/// claim becomes `InvalidToken` instead of a serde error.
#[derive(Debug, Deserialize)]
struct RawClaims {
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    iss: Option<String>,
    #[serde(default)]
    exp: Option<i64>,
    #[serde(default)]
    iat: Option<i64>,
    #[serde(default)]
    roles: Option<Vec<String>>,
    #[serde(default, alias = "tenantId")]
    tenant_id: Option<String>,
    #[serde(default, alias = "permissionHash")]
    permission_hash: Option<String>,
    #[serde(default, alias = "mfaVerified")]
    mfa_verified: Option<bool>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    scp: Option<Vec<String>>,
}

/// Parse a bearer token's structure.
///
/// Requires exactly three non-empty dot-separated segments and a header
/// that decodes to a JSON object with a non-empty `kid`.
pub fn parse(token: &str) -> Result<AccessToken> {
    let segments = split_segments(token)?;
    let header = decode_json_object(segments[0], "header")?;

    let key_id = header
        .get("kid")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|kid| !kid.is_empty())
        .ok_or_else(|| Error::invalid_token("header has no key id"))?;

    let algorithm = header
        .get("alg")
        .and_then(Value::as_str)
        .map(ToString::to_string);

    Ok(AccessToken {
        value: token.to_string(),
        key_id: key_id.to_string(),
        algorithm,
    })
}

/// Decode the payload claims.
///
/// `sub`, `iss` and `exp` are required and must not be blank.
pub fn extract_claims(token: &str) -> Result<JwtClaims> {
    let segments = split_segments(token)?;
    let payload = decode_segment(segments[1], "payload")?;
    let raw: RawClaims = serde_json::from_slice(&payload)
        .map_err(|e| Error::invalid_token(format!("payload is not a claims object: {e}")))?;

    let subject = required(raw.sub, "sub")?;
    let issuer = required(raw.iss, "iss")?;
    let exp = raw
        .exp
        .ok_or_else(|| Error::invalid_token("missing claim 'exp'"))?;
    let expires_at = DateTime::from_timestamp(exp, 0)
        .ok_or_else(|| Error::invalid_token("claim 'exp' out of range"))?;
    let issued_at = raw.iat.and_then(|iat| DateTime::from_timestamp(iat, 0));

    Ok(JwtClaims {
        subject,
        issuer,
        expires_at,
        issued_at,
        roles: raw.roles.unwrap_or_default().into_iter().collect(),
        tenant_id: raw.tenant_id.filter(|t| !t.trim().is_empty()),
        permission_hash: raw.permission_hash.filter(|h| !h.trim().is_empty()),
        mfa_verified: raw.mfa_verified.unwrap_or(false),
        scopes: scopes(raw.scope.as_deref(), raw.scp),
    })
}

/// Space-delimited `scope` plus any `scp` entries
fn scopes(scope: Option<&str>, scp: Option<Vec<String>>) -> BTreeSet<String> {
    scope
        .unwrap_or_default()
        .split_whitespace()
        .map(ToString::to_string)
        .chain(scp.unwrap_or_default())
        .filter(|s| !s.trim().is_empty())
        .collect()
}

/// `true` once the clock is strictly past `exp`; the `exp` instant itself is
/// still valid.
pub fn is_expired(claims: &JwtClaims, clock: &dyn Clock) -> bool {
    clock.now() > claims.expires_at
}

/// Read the `exp` claim of a JWT-shaped string without any other
/// validation. Used for refresh tokens, which are opaque to the gateway but
/// are often JWTs.
pub(crate) fn peek_expiry(token: &str) -> Option<DateTime<Utc>> {
    let segments = split_segments(token).ok()?;
    let payload = decode_json_object(segments[1], "payload").ok()?;
    payload
        .get("exp")
        .and_then(Value::as_i64)
        .and_then(|exp| DateTime::from_timestamp(exp, 0))
}

fn split_segments(token: &str) -> Result<[&str; 3]> {
    let mut parts = token.split('.');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(h), Some(p), Some(s), None) if !h.is_empty() && !p.is_empty() && !s.is_empty() => {
            Ok([h, p, s])
        }
        _ => Err(Error::invalid_token(
            "expected three non-empty dot-separated segments",
        )),
    }
}

fn decode_segment(segment: &str, what: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(segment.trim_end_matches('='))
        .map_err(|_| Error::invalid_token(format!("{what} is not base64url")))
}

fn decode_json_object(segment: &str, what: &str) -> Result<serde_json::Map<String, Value>> {
    let bytes = decode_segment(segment, what)?;
    match serde_json::from_slice::<Value>(&bytes) {
        Ok(Value::Object(map)) => Ok(map),
        _ => Err(Error::invalid_token(format!("{what} is not a JSON object"))),
    }
}

fn required(value: Option<String>, claim: &str) -> Result<String> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| Error::invalid_token(format!("missing claim '{claim}'")))
}
