//! Configuration management

use std::{env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Environment variable prefix; nested keys use `__`
/// (`GATEWAY_AUTH_ORIGIN__BASE_URL`).
pub const ENV_PREFIX: &str = "GATEWAY_AUTH_";

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP listener
    pub server: ServerConfig,
    /// Admin endpoints
    pub admin: AdminConfig,
    /// Origin (identity authority) client
    pub origin: OriginConfig,
    /// Public key cache
    pub keys: KeysConfig,
    /// Permission spec and digest caching
    pub permissions: PermissionsConfig,
    /// Refresh-token rotation
    pub refresh: RefreshConfig,
    /// In-process store housekeeping
    pub store: StoreConfig,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))
    }

    /// Reject settings the coordinators cannot run with
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first offending setting.
    pub fn validate(&self) -> Result<()> {
        if self.origin.base_url.trim().is_empty() {
            return Err(Error::Config("origin.base_url is required".to_string()));
        }

        let non_zero = [
            ("origin.connect_timeout", self.origin.connect_timeout),
            ("origin.request_timeout", self.origin.request_timeout),
            ("keys.ttl", self.keys.ttl),
            ("permissions.spec_ttl", self.permissions.spec_ttl),
            ("permissions.hash_ttl", self.permissions.hash_ttl),
            ("refresh.lock_lease", self.refresh.lock_lease),
            ("refresh.token_lifetime", self.refresh.token_lifetime),
            ("store.reap_interval", self.store.reap_interval),
        ];
        if let Some((name, _)) = non_zero.iter().find(|(_, d)| d.is_zero()) {
            return Err(Error::Config(format!("{name} must be greater than zero")));
        }

        // The lease must outlive the origin call made while holding it
        if self.refresh.lock_lease <= self.origin.request_timeout {
            return Err(Error::Config(format!(
                "refresh.lock_lease ({:?}) must be longer than origin.request_timeout ({:?})",
                self.refresh.lock_lease, self.origin.request_timeout
            )));
        }

        let retry = &self.origin.retry;
        if retry.enabled {
            if retry.max_attempts == 0 {
                return Err(Error::Config(
                    "origin.retry.max_attempts must be at least 1".to_string(),
                ));
            }
            if retry.multiplier < 1.0 {
                return Err(Error::Config(
                    "origin.retry.multiplier must be at least 1.0".to_string(),
                ));
            }
        }

        Ok(())
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Per-request timeout for the HTTP surface
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Grace period for in-flight requests on shutdown
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 39500,
            request_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(15),
        }
    }
}

/// Admin endpoint configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Bearer token for `/admin/*`. `env:VAR` reads it from the environment.
    /// Admin routes answer 503 while unset.
    pub bearer_token: Option<String>,
}

impl AdminConfig {
    /// Resolved admin token, if any
    #[must_use]
    pub fn resolve_bearer_token(&self) -> Option<String> {
        self.bearer_token.as_deref().and_then(resolve_secret)
    }
}

/// Origin client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OriginConfig {
    /// Base URL of the origin API
    pub base_url: String,
    /// Service credential sent as a bearer token. `env:VAR` reads it from the
    /// environment.
    pub service_token: Option<String>,
    /// TCP connect timeout
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Total timeout per request
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Retry policy for idempotent reads
    pub retry: RetryConfig,
}

impl Default for OriginConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            service_token: None,
            connect_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(5),
            retry: RetryConfig::default(),
        }
    }
}

impl OriginConfig {
    /// Resolved service token, if any
    #[must_use]
    pub fn resolve_service_token(&self) -> Option<String> {
        self.service_token.as_deref().and_then(resolve_secret)
    }
}

/// Retry configuration for idempotent origin reads
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Enable retries
    pub enabled: bool,
    /// Maximum attempts, the first one included
    pub max_attempts: u32,
    /// Initial backoff
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    /// Maximum backoff
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub multiplier: f32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            multiplier: 2.0,
        }
    }
}

/// Public key cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeysConfig {
    /// TTL of each cached key
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// Share one in-flight key-set fetch among concurrent misses
    pub coalesce_fetches: bool,
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            coalesce_fetches: true,
        }
    }
}

/// Permission caching configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionsConfig {
    /// TTL of the cached permission spec
    #[serde(with = "humantime_serde")]
    pub spec_ttl: Duration,
    /// TTL of each cached user digest
    #[serde(with = "humantime_serde")]
    pub hash_ttl: Duration,
}

impl Default for PermissionsConfig {
    fn default() -> Self {
        Self {
            spec_ttl: Duration::from_secs(3600),
            hash_ttl: Duration::from_secs(900),
        }
    }
}

/// Refresh rotation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    /// Lease on the per-user rotation lock
    #[serde(with = "humantime_serde")]
    pub lock_lease: Duration,
    /// Blacklist TTL for refresh tokens that carry no expiry
    #[serde(with = "humantime_serde")]
    pub token_lifetime: Duration,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            lock_lease: Duration::from_secs(30),
            token_lifetime: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

/// In-process store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// How often expired entries and leases are reaped
    #[serde(with = "humantime_serde")]
    pub reap_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            reap_interval: Duration::from_secs(60),
        }
    }
}

/// `env:VAR` → value of `VAR` (absent or empty → `None`); anything else is
/// taken literally. Blank values resolve to `None`.
fn resolve_secret(raw: &str) -> Option<String> {
    let value = match raw.strip_prefix("env:") {
        Some(var) => env::var(var.trim()).ok()?,
        None => raw.to_string(),
    };
    let value = value.trim().to_string();
    (!value.is_empty()).then_some(value)
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (`"30s"`, or `"250ms"`
    /// when not a whole number of seconds)
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "100ms",
    /// "2h", "7d"); a bare number is seconds.
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Secs(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(s) => parse(s.trim()).map_err(serde::de::Error::custom),
        }
    }

    fn parse(s: &str) -> Result<Duration, String> {
        let number = |n: &str| {
            n.trim()
                .parse::<u64>()
                .map_err(|e| format!("invalid duration '{s}': {e}"))
        };
        let scaled = |n: &str, unit: u64| {
            number(n)?
                .checked_mul(unit)
                .map(Duration::from_secs)
                .ok_or_else(|| format!("duration '{s}' is out of range"))
        };

        // "ms" before "s" and "m"
        if let Some(ms) = s.strip_suffix("ms") {
            number(ms).map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            number(secs).map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            scaled(mins, 60)
        } else if let Some(hours) = s.strip_suffix('h') {
            scaled(hours, 3600)
        } else if let Some(days) = s.strip_suffix('d') {
            scaled(days, 86_400)
        } else {
            number(s).map(Duration::from_secs)
        }
    }
}
