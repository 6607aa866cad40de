//! Gateway Auth Library
//!
//! Request-time security core for a multi-tenant API gateway.
//!
//! # Features
//!
//! - **Claims codec**: bearer token parsing, claim extraction, clock-driven expiry
//! - **Signature verification**: RSA/PSS via `jsonwebtoken`, key built from JWK components
//! - **Public key cache**: fetch-through on miss, full key-set upsert, single-flight fetches
//! - **Refresh rotation**: per-user distributed lock, reuse detection, blacklist of consumed tokens
//! - **Permission validation**: default-deny endpoint matching, cached permission digests,
//!   invalidation signals
//!
//! Shared state (cache, locks, blacklist) and the origin are injected as trait
//! objects; in-memory stores and an HTTP origin client ship with the crate.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod audit;
pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod gatekeeper;
pub mod keys;
pub mod origin;
pub mod permission;
pub mod refresh;
pub mod server;
pub mod store;
pub mod token;

pub use error::{Error, ErrorKind, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// `RUST_LOG` takes precedence over `level`. `format` `"json"` selects the
/// JSON formatter; anything else is human-readable text.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    };

    installed.map_err(|e| Error::Internal(format!("tracing already initialized: {e}")))
}
