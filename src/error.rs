//! Error types for the gateway auth core

use std::io;

use thiserror::Error;

/// Result type alias for the gateway auth core
pub type Result<T> = std::result::Result<T, Error>;

/// Gateway auth errors
///
/// The first group is the taxonomy callers branch on. The second group holds
/// infrastructure failures; coordinators wrap those into the nearest
/// taxonomy kind before returning.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed token or missing required claim
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    /// Signature valid but the token is past its expiry
    #[error("Token expired")]
    TokenExpired,

    /// Key-id unknown even after a fresh fetch of the active key set
    #[error("Public key not found: {0}")]
    PublicKeyNotFound(String),

    /// Fetching the active key set from the origin failed
    #[error("Public key refresh failed: {0}")]
    KeyRefreshFailed(String),

    /// Another rotation for the same (tenant, user) holds the lock
    #[error("Refresh lock not acquired for {0}")]
    LockAcquisitionFailed(String),

    /// A refresh token that was already rotated was presented again
    #[error("Refresh token reuse detected")]
    RefreshTokenReused,

    /// The origin refused or failed the refresh exchange
    #[error("Upstream refresh failed: {0}")]
    UpstreamRefreshFailed(String),

    /// The caller lacks the permissions or roles the endpoint requires
    #[error("Permission denied")]
    PermissionDenied,

    /// No endpoint in the permission spec matches the request
    #[error("No permission spec entry for {method} {path}")]
    PermissionSpecNotFound {
        /// Request path
        path: String,
        /// Request method
        method: String,
    },

    /// The permission spec or a permission digest could not be loaded
    #[error("Permission lookup failed: {0}")]
    PermissionLookupFailed(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Origin call failed (non-success status, timeout, bad body)
    #[error("Origin error: {0}")]
    Origin(String),

    /// Cache, blacklist or lock store failure
    #[error("Store error: {0}")]
    Store(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Stable, payload-free error classification for callers and logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// See [`Error::InvalidToken`]
    InvalidToken,
    /// See [`Error::TokenExpired`]
    TokenExpired,
    /// See [`Error::PublicKeyNotFound`]
    PublicKeyNotFound,
    /// See [`Error::KeyRefreshFailed`]
    KeyRefreshFailed,
    /// See [`Error::LockAcquisitionFailed`]
    LockAcquisitionFailed,
    /// See [`Error::RefreshTokenReused`]
    RefreshTokenReused,
    /// See [`Error::UpstreamRefreshFailed`]
    UpstreamRefreshFailed,
    /// See [`Error::PermissionDenied`]
    PermissionDenied,
    /// See [`Error::PermissionSpecNotFound`]
    PermissionSpecNotFound,
    /// See [`Error::PermissionLookupFailed`]
    PermissionLookupFailed,
    /// Any infrastructure failure that escaped wrapping
    Internal,
}

impl Error {
    /// Create an invalid-token error
    pub fn invalid_token(reason: impl Into<String>) -> Self {
        Self::InvalidToken(reason.into())
    }

    /// Classify this error
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidToken(_) => ErrorKind::InvalidToken,
            Self::TokenExpired => ErrorKind::TokenExpired,
            Self::PublicKeyNotFound(_) => ErrorKind::PublicKeyNotFound,
            Self::KeyRefreshFailed(_) => ErrorKind::KeyRefreshFailed,
            Self::LockAcquisitionFailed(_) => ErrorKind::LockAcquisitionFailed,
            Self::RefreshTokenReused => ErrorKind::RefreshTokenReused,
            Self::UpstreamRefreshFailed(_) => ErrorKind::UpstreamRefreshFailed,
            Self::PermissionDenied => ErrorKind::PermissionDenied,
            Self::PermissionSpecNotFound { .. } => ErrorKind::PermissionSpecNotFound,
            Self::PermissionLookupFailed(_) => ErrorKind::PermissionLookupFailed,
            Self::Config(_)
            | Self::Origin(_)
            | Self::Store(_)
            | Self::Io(_)
            | Self::Json(_)
            | Self::Http(_)
            | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// `true` for outcomes that resolve to "request denied"
    #[must_use]
    pub fn is_denial(&self) -> bool {
        matches!(
            self,
            Self::PermissionDenied
                | Self::PermissionSpecNotFound { .. }
                | Self::PermissionLookupFailed(_)
        )
    }

    /// `true` for outcomes that resolve to "not authenticated"
    #[must_use]
    pub fn is_unauthenticated(&self) -> bool {
        matches!(
            self,
            Self::InvalidToken(_)
                | Self::TokenExpired
                | Self::PublicKeyNotFound(_)
                | Self::RefreshTokenReused
        )
    }

    /// `true` for refresh failures the caller may retry later
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::LockAcquisitionFailed(_)
                | Self::UpstreamRefreshFailed(_)
                | Self::KeyRefreshFailed(_)
                | Self::PublicKeyNotFound(_)
                | Self::PermissionLookupFailed(_)
        )
    }
}
