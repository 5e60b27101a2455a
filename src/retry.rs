//! Retry logic with exponential backoff.
//!
//! Provides configurable retry behavior for transient API failures.
//! Different presets are available for different use cases.
//!
//! # Example
//!
//! ```
//! use crm_sync::RetryConfig;
//! use std::time::Duration;
//!
//! // Request: quick retry, then hand the error to the queue
//! let request = RetryConfig::request();
//! assert_eq!(request.max_retries, Some(3));
//!
//! // Startup: fail fast on bad config
//! let startup = RetryConfig::startup();
//! assert_eq!(startup.max_retries, Some(5));
//! ```

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Configuration for operation retry behavior.
///
/// Use the preset constructors for common patterns:
/// - [`RetryConfig::startup()`] - Fast-fail for the initial connectivity check
/// - [`RetryConfig::request()`] - Quick retry for individual API requests
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub max_retries: Option<usize>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::request()
    }
}

impl RetryConfig {
    /// Fast-fail retry for the startup connectivity check.
    /// Attempts 5 times with exponential backoff, failing after a few
    /// seconds. Use this to detect configuration errors quickly.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_retries: Some(5),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Quick retry for individual API requests (don't block the cycle).
    /// 3 attempts with fast backoff - persistent failures go to the
    /// durable queue instead.
    #[must_use]
    pub fn request() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            factor: 2.0,
        }
    }

    /// Retry with a custom attempt ceiling, keeping the request pacing.
    #[must_use]
    pub fn with_max_attempts(max_attempts: usize) -> Self {
        Self {
            max_retries: Some(max_attempts.max(1)),
            ..Self::request()
        }
    }

    /// Fast retry for tests (minimal delays)
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }
}

/// Retry `operation` until it succeeds, the attempt ceiling is hit, or
/// `is_retryable` rejects the error.
///
/// Non-retryable errors (auth failures, validation rejections from the
/// remote API) are returned immediately without sleeping.
pub async fn retry_if<F, Fut, T, E, P>(
    operation_name: &str,
    config: &RetryConfig,
    mut is_retryable: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: FnMut(&E) -> bool,
{
    let mut delay = config.initial_delay;
    let mut attempts = 0;

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!(
                        "Operation '{}' succeeded after {} retries",
                        operation_name, attempts
                    );
                }
                return Ok(val);
            }
            Err(err) => {
                attempts += 1;

                if !is_retryable(&err) {
                    return Err(err);
                }

                if let Some(max) = config.max_retries {
                    if attempts >= max {
                        warn!(
                            "Operation '{}' failed after {} attempts: {}",
                            operation_name, attempts, err
                        );
                        return Err(err);
                    }
                }

                warn!(
                    "Operation '{}' failed (attempt {}): {}. Retrying in {:?}...",
                    operation_name, attempts, err, delay
                );

                sleep(delay).await;
                delay = (delay.mul_f64(config.factor)).min(config.max_delay);
            }
        }
    }
}

/// Retry `operation` treating every error as retryable.
pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_if(operation_name, config, |_| true, operation).await
}
