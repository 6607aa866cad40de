//! Refresh credentials and rotation results

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::claims::peek_expiry;
use crate::{Error, Result};

/// Shortest refresh token accepted
pub const MIN_REFRESH_TOKEN_LENGTH: usize = 32;

/// A refresh credential presented by a client
#[derive(Clone, PartialEq, Eq)]
pub struct RefreshToken {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl RefreshToken {
    /// Wrap a refresh token value.
    ///
    /// Rejects values shorter than [`MIN_REFRESH_TOKEN_LENGTH`] or containing
    /// whitespace. When the value is a JWT its `exp` claim is remembered so
    /// the blacklist entry can expire with the token.
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        if value.len() < MIN_REFRESH_TOKEN_LENGTH {
            return Err(Error::invalid_token(format!(
                "refresh token shorter than {MIN_REFRESH_TOKEN_LENGTH} characters"
            )));
        }
        if value.chars().any(char::is_whitespace) {
            return Err(Error::invalid_token("refresh token contains whitespace"));
        }

        let expires_at = peek_expiry(&value);
        Ok(Self { value, expires_at })
    }

    /// Override the expiry (e.g. from a cookie `Max-Age`)
    #[must_use]
    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// The raw value
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.value
    }

    /// Known expiry, if any
    #[must_use]
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// SHA-256 hex digest of the value. Blacklist keys and logs only ever
    /// see this, never the token itself.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(self.value.as_bytes()))
    }

    /// Time left before the token expires, or `fallback` when the expiry is
    /// unknown. Never shorter than one second, so a blacklist entry always
    /// outlives the request that wrote it.
    #[must_use]
    pub fn remaining_lifetime(&self, now: DateTime<Utc>, fallback: Duration) -> Duration {
        let remaining = match self.expires_at {
            Some(exp) => (exp - now).to_std().unwrap_or(Duration::ZERO),
            None => fallback,
        };
        remaining.max(Duration::from_secs(1))
    }
}

impl fmt::Debug for RefreshToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshToken")
            .field("fingerprint", &&self.fingerprint()[..12])
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// New credentials returned by the origin after a rotation
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    /// New access token
    pub access_token: String,
    /// New refresh token
    pub refresh_token: String,
    /// Access token lifetime in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    /// Refresh token lifetime in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_expires_in: Option<u64>,
}

impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("expires_in", &self.expires_in)
            .field("refresh_expires_in", &self.refresh_expires_in)
            .finish_non_exhaustive()
    }
}
