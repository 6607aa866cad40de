//! Permission model for the gateway auth core
//!
//! Value types shared between the origin client and the permission
//! validation coordinator:
//!
//! - [`PermissionSpec`]: the tenant-independent table of routable endpoints
//! - [`EndpointPermission`]: one endpoint's policy
//! - [`PermissionHash`]: a user's permission digest
//!
//! plus endpoint lookup with [`PathPattern`] matching. Lookup is
//! default-deny: an endpoint that is not declared is never matched.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod pattern;

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use pattern::{PathPattern, Segment, is_ambiguous};

/// Policy for one routable endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointPermission {
    /// Backend service that owns the endpoint
    pub service: String,
    /// Path pattern (`/orders/{id}`, `/static/**`)
    pub path: PathPattern,
    /// HTTP method; `*` or `ANY` matches every method
    pub method: String,
    /// Permissions the caller must hold (all of them)
    #[serde(default)]
    pub required_permissions: BTreeSet<String>,
    /// Roles of which the caller must hold at least one (empty = no role check)
    #[serde(default)]
    pub required_roles: BTreeSet<String>,
    /// Public endpoints skip every permission and role check
    #[serde(default)]
    pub public: bool,
}

/// Result of checking a caller's grants against an endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessCheck {
    /// All requirements met
    Granted,
    /// Requirements not met
    Denied {
        /// Required permissions the caller lacks
        missing_permissions: Vec<String>,
        /// `true` when roles are required and the caller holds none of them
        missing_role: bool,
    },
}

impl AccessCheck {
    /// `true` for [`AccessCheck::Granted`]
    #[must_use]
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted)
    }
}

impl EndpointPermission {
    /// Create an endpoint policy
    #[must_use]
    pub fn new(service: &str, path: &str, method: &str) -> Self {
        Self {
            service: service.to_string(),
            path: PathPattern::parse(path),
            method: method.to_string(),
            required_permissions: BTreeSet::new(),
            required_roles: BTreeSet::new(),
            public: false,
        }
    }

    /// Require the given permissions
    #[must_use]
    pub fn with_permissions<I, S>(mut self, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_permissions = permissions.into_iter().map(Into::into).collect();
        self
    }

    /// Require one of the given roles
    #[must_use]
    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_roles = roles.into_iter().map(Into::into).collect();
        self
    }

    /// Mark the endpoint public
    #[must_use]
    pub fn public(mut self) -> Self {
        self.public = true;
        self
    }

    /// Whether the method matches (case-insensitive, `*`/`ANY` wildcard)
    #[must_use]
    pub fn matches_method(&self, method: &str) -> bool {
        self.is_any_method() || self.method.eq_ignore_ascii_case(method)
    }

    fn is_any_method(&self) -> bool {
        self.method == "*" || self.method.eq_ignore_ascii_case("ANY")
    }

    /// Whether `(path, method)` is routed to this endpoint
    #[must_use]
    pub fn matches(&self, path: &str, method: &str) -> bool {
        self.matches_method(method) && self.path.matches(path)
    }

    /// Check a caller's permission and role sets against this endpoint.
    ///
    /// Granted iff `permissions ⊇ required_permissions` and either no roles
    /// are required or `roles ∩ required_roles ≠ ∅`. Public endpoints are
    /// always granted.
    #[must_use]
    pub fn check(&self, permissions: &BTreeSet<String>, roles: &BTreeSet<String>) -> AccessCheck {
        if self.public {
            return AccessCheck::Granted;
        }

        let missing_permissions: Vec<String> = self
            .required_permissions
            .difference(permissions)
            .cloned()
            .collect();
        let missing_role =
            !self.required_roles.is_empty() && self.required_roles.is_disjoint(roles);

        if missing_permissions.is_empty() && !missing_role {
            AccessCheck::Granted
        } else {
            AccessCheck::Denied {
                missing_permissions,
                missing_role,
            }
        }
    }
}

/// Tenant-wide authorization table, replaced wholesale on refresh
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionSpec {
    /// Monotonic spec version assigned by the origin
    pub version: u64,
    /// When the origin last changed the spec
    pub updated_at: DateTime<Utc>,
    /// Declared endpoints
    #[serde(default)]
    pub endpoints: Vec<EndpointPermission>,
}

impl PermissionSpec {
    /// Find the endpoint that routes `(path, method)`.
    ///
    /// When several endpoints match, the most specific pattern wins, and an
    /// explicit method beats a wildcard method. Ties keep declaration order.
    /// Returns `None` for undeclared endpoints.
    #[must_use]
    pub fn find_endpoint(&self, path: &str, method: &str) -> Option<&EndpointPermission> {
        let mut best: Option<(&EndpointPermission, (usize, usize, bool, bool))> = None;

        for endpoint in self.endpoints.iter().filter(|e| e.matches(path, method)) {
            let (literals, len, no_rest) = endpoint.path.specificity();
            let rank = (literals, len, no_rest, !endpoint.is_any_method());
            match best {
                Some((_, best_rank)) if best_rank >= rank => {}
                _ => best = Some((endpoint, rank)),
            }
        }

        best.map(|(endpoint, _)| endpoint)
    }
}

/// A user's permission digest, cached per (tenant, user)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionHash {
    /// Digest of the permission and role sets
    pub hash: String,
    /// Granted permissions
    #[serde(default)]
    pub permissions: BTreeSet<String>,
    /// Granted roles
    #[serde(default)]
    pub roles: BTreeSet<String>,
    /// When the origin computed the digest
    pub generated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    fn spec(endpoints: Vec<EndpointPermission>) -> PermissionSpec {
        PermissionSpec {
            version: 1,
            updated_at: Utc::now(),
            endpoints,
        }
    }

    #[test]
    fn find_endpoint_is_default_deny() {
        let spec = spec(vec![EndpointPermission::new("orders", "/orders", "GET")]);
        assert!(spec.find_endpoint("/invoices", "GET").is_none());
        assert!(spec.find_endpoint("/orders", "DELETE").is_none());
    }

    #[test]
    fn find_endpoint_matches_method_case_insensitively() {
        let spec = spec(vec![EndpointPermission::new("orders", "/orders", "get")]);
        assert!(spec.find_endpoint("/orders", "GET").is_some());
    }

    #[test]
    fn find_endpoint_prefers_most_specific() {
        let spec = spec(vec![
            EndpointPermission::new("users", "/users/**", "*"),
            EndpointPermission::new("users", "/users/{id}", "GET"),
            EndpointPermission::new("users", "/users/me", "GET").public(),
        ]);

        let me = spec.find_endpoint("/users/me", "GET").unwrap();
        assert!(me.public);

        let by_id = spec.find_endpoint("/users/42", "GET").unwrap();
        assert_eq!(by_id.path.as_str(), "/users/{id}");

        let nested = spec.find_endpoint("/users/42/avatar", "PUT").unwrap();
        assert_eq!(nested.path.as_str(), "/users/**");
    }

    #[test]
    fn explicit_method_beats_wildcard() {
        let spec = spec(vec![
            EndpointPermission::new("a", "/x", "ANY"),
            EndpointPermission::new("b", "/x", "POST"),
        ]);
        assert_eq!(spec.find_endpoint("/x", "POST").unwrap().service, "b");
        assert_eq!(spec.find_endpoint("/x", "GET").unwrap().service, "a");
    }

    #[test]
    fn ties_keep_declaration_order() {
        let spec = spec(vec![
            EndpointPermission::new("first", "/x/{a}", "GET"),
            EndpointPermission::new("second", "/x/*", "GET"),
        ]);
        assert_eq!(spec.find_endpoint("/x/1", "GET").unwrap().service, "first");
    }

    #[test]
    fn check_requires_superset_of_permissions() {
        let ep = EndpointPermission::new("orders", "/orders", "POST")
            .with_permissions(["orders:write", "orders:read"]);

        assert!(ep.check(&set(&["orders:write", "orders:read", "x"]), &set(&[])).is_granted());

        let denied = ep.check(&set(&["orders:read"]), &set(&[]));
        assert_eq!(
            denied,
            AccessCheck::Denied {
                missing_permissions: vec!["orders:write".to_string()],
                missing_role: false,
            }
        );
    }

    #[test]
    fn check_requires_role_intersection_when_roles_required() {
        let ep = EndpointPermission::new("admin", "/admin", "GET").with_roles(["admin", "owner"]);

        assert!(ep.check(&set(&[]), &set(&["owner"])).is_granted());
        assert_eq!(
            ep.check(&set(&[]), &set(&["viewer"])),
            AccessCheck::Denied {
                missing_permissions: vec![],
                missing_role: true,
            }
        );
    }

    #[test]
    fn public_endpoint_is_always_granted() {
        let ep = EndpointPermission::new("docs", "/docs", "GET")
            .with_permissions(["never-granted"])
            .with_roles(["nobody"])
            .public();
        assert!(ep.check(&set(&[]), &set(&[])).is_granted());
    }

    #[test]
    fn spec_deserializes_from_origin_json() {
        let json = serde_json::json!({
            "version": 7,
            "updatedAt": "2026-01-01T00:00:00Z",
            "endpoints": [{
                "service": "billing",
                "path": "/invoices/{id}",
                "method": "GET",
                "requiredPermissions": ["invoices:read"],
                "requiredRoles": []
            }]
        });

        let spec: PermissionSpec = serde_json::from_value(json).unwrap();
        assert_eq!(spec.version, 7);
        let ep = spec.find_endpoint("/invoices/9", "GET").unwrap();
        assert!(!ep.public);
        assert!(ep.required_permissions.contains("invoices:read"));
    }
}
