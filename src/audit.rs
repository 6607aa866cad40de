//! Audit logging for security decisions.
//!
//! Every event is emitted on the `audit` tracing target as one JSON blob in
//! the `audit` field, so log aggregators can extract it without parsing the
//! message. Token values never appear; refresh tokens are identified by a
//! short SHA-256 fingerprint prefix.
//!
//! # Events
//!
//! | Event | When |
//! |-------|------|
//! | `refresh.rotated` | A refresh token was exchanged and blacklisted |
//! | `refresh.reuse_detected` | A blacklisted refresh token was presented again |
//! | `refresh.lock_contended` | Another rotation for the same user holds the lock |
//! | `permission.denied` | A request lacked required permissions or roles |
//! | `permission.spec_missing` | No endpoint rule matched (default-deny) |
//! | `keys.refreshed` | The active key set was fetched and cached |

use serde::Serialize;
use uuid::Uuid;

/// Length of the refresh-token fingerprint prefix written to the log
const FINGERPRINT_PREFIX: usize = 12;

/// Structured audit event
#[derive(Debug, Serialize)]
pub struct AuditEvent {
    /// Unique id for correlating the log line with downstream reports
    pub event_id: Uuid,
    /// Event type string (e.g., `"refresh.rotated"`).
    pub event: &'static str,
    /// Tenant of the affected user.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    /// Affected user (token subject).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Fingerprint prefix of the refresh token involved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_fingerprint: Option<String>,
    /// Request path (for permission events).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Request method (for permission events).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Permissions the caller lacked (for `permission.denied`).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub missing_permissions: Vec<String>,
    /// Whether a required role was missing (for `permission.denied`).
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub missing_role: bool,
    /// Number of keys cached (for `keys.refreshed`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_count: Option<usize>,
}

impl AuditEvent {
    fn new(event: &'static str) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event,
            tenant_id: None,
            user_id: None,
            token_fingerprint: None,
            path: None,
            method: None,
            missing_permissions: Vec::new(),
            missing_role: false,
            key_count: None,
        }
    }

    fn for_user(event: &'static str, tenant_id: &str, user_id: &str) -> Self {
        Self {
            tenant_id: Some(tenant_id.to_string()),
            user_id: Some(user_id.to_string()),
            ..Self::new(event)
        }
    }

    fn with_fingerprint(mut self, fingerprint: &str) -> Self {
        let end = fingerprint.len().min(FINGERPRINT_PREFIX);
        self.token_fingerprint = Some(fingerprint[..end].to_string());
        self
    }

    /// A refresh token was exchanged for a new pair.
    #[must_use]
    pub fn rotated(tenant_id: &str, user_id: &str, fingerprint: &str) -> Self {
        Self::for_user("refresh.rotated", tenant_id, user_id).with_fingerprint(fingerprint)
    }

    /// A consumed refresh token was presented again.
    #[must_use]
    pub fn reuse_detected(tenant_id: &str, user_id: &str, fingerprint: &str) -> Self {
        Self::for_user("refresh.reuse_detected", tenant_id, user_id).with_fingerprint(fingerprint)
    }

    /// The rotation lock for this user is already held.
    #[must_use]
    pub fn lock_contended(tenant_id: &str, user_id: &str) -> Self {
        Self::for_user("refresh.lock_contended", tenant_id, user_id)
    }

    /// The caller lacked permissions or roles for the matched endpoint.
    #[must_use]
    pub fn denied(
        tenant_id: &str,
        user_id: &str,
        path: &str,
        method: &str,
        missing_permissions: Vec<String>,
        missing_role: bool,
    ) -> Self {
        Self {
            path: Some(path.to_string()),
            method: Some(method.to_string()),
            missing_permissions,
            missing_role,
            ..Self::for_user("permission.denied", tenant_id, user_id)
        }
    }

    /// No endpoint rule matched the request.
    #[must_use]
    pub fn spec_missing(tenant_id: &str, user_id: &str, path: &str, method: &str) -> Self {
        Self {
            path: Some(path.to_string()),
            method: Some(method.to_string()),
            ..Self::for_user("permission.spec_missing", tenant_id, user_id)
        }
    }

    /// The active key set was fetched and cached.
    #[must_use]
    pub fn keys_refreshed(key_count: usize) -> Self {
        Self {
            key_count: Some(key_count),
            ..Self::new("keys.refreshed")
        }
    }

    /// Events that indicate an attack or a misbehaving client
    fn is_alert(&self) -> bool {
        self.event == "refresh.reuse_detected"
    }
}

/// Emit an audit event on the `audit` target.
///
/// ```text
/// INFO audit: audit={"event":"refresh.rotated","tenant_id":"acme",...}
/// ```
pub fn emit(event: &AuditEvent) {
    match serde_json::to_string(event) {
        Ok(ref json) if event.is_alert() => tracing::warn!(target: "audit", audit = %json, "security audit"),
        Ok(ref json) => tracing::info!(target: "audit", audit = %json, "security audit"),
        Err(ref e) => tracing::warn!(error = %e, "Failed to serialize audit event"),
    }
}
