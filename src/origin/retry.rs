//! Retry with exponential backoff for idempotent origin reads

use std::future::Future;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use tracing::debug;

use crate::Error;
use crate::config::RetryConfig;

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Whether retries are enabled
    pub enabled: bool,
    /// Maximum attempts, the first one included
    pub max_attempts: u32,
    /// Initial backoff
    pub initial_backoff: Duration,
    /// Maximum backoff
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub multiplier: f32,
}

impl RetryPolicy {
    /// Create from config
    #[must_use]
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            enabled: config.enabled,
            max_attempts: config.max_attempts.max(1),
            initial_backoff: config.initial_backoff,
            max_backoff: config.max_backoff,
            multiplier: config.multiplier,
        }
    }

    /// A policy that never retries
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::new(&RetryConfig::default())
        }
    }

    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.initial_backoff)
            .with_max_delay(self.max_backoff)
            .with_factor(self.multiplier)
            .with_max_times(self.max_attempts.saturating_sub(1) as usize)
    }
}

/// Execute `f`, retrying transport-level failures per `policy`.
///
/// # Errors
///
/// Returns the last error from `f` once attempts are exhausted or the error
/// is not retryable.
pub async fn with_retry<F, Fut, T>(policy: &RetryPolicy, name: &str, f: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut f = f;
    if !policy.enabled {
        return f().await;
    }

    f.retry(policy.backoff())
        .when(is_retryable)
        .notify(|e: &Error, delay: Duration| {
            debug!(
                operation = name,
                delay_ms = delay.as_millis(),
                error = %e,
                "Retrying after backoff"
            );
        })
        .await
}

/// Timeouts, connection failures, 5xx and 429 are worth another attempt
fn is_retryable(error: &Error) -> bool {
    match error {
        Error::Http(e) => {
            e.is_timeout()
                || e.is_connect()
                || e
                    .status()
                    .is_some_and(|s| s.is_server_error() || s.as_u16() == 429)
        }
        Error::Io(_) => true,
        _ => false,
    }
}
