//! Retry utilities with exponential backoff and jitter.
//!
//! Provisioner invocations are retried when `retry_failed_steps` is set and the
//! failure looks transient. Validators never go through here; probes carry
//! their own polling.
//!
//! # Example
//!
//! ```ignore
//! use eks_harness::retry::{retry_with_backoff_if, RetryConfig};
//!
//! let result = retry_with_backoff_if(
//!     &RetryConfig::provisioner(),
//!     "up",
//!     |e: &Error| e.is_retryable(),
//!     || async { provisioner.up(&ctx, &opts).await },
//! ).await?;
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::provisioner()
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Self::provisioner()
        }
    }

    /// Bounded policy for provisioner steps: three attempts starting 15s apart
    pub fn provisioner() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(15),
            max_delay: Duration::from_secs(120),
            backoff_multiplier: 2.0,
        }
    }

    /// A single attempt, used when `retry_failed_steps` is off
    pub fn no_retry() -> Self {
        Self::with_max_attempts(1)
    }
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Only errors accepted by `should_retry` are retried, until `max_attempts`
/// is exhausted (0 = infinite). Returns the attempt count alongside the value or the final error so callers
/// can record it.
pub async fn retry_with_backoff_if<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    should_retry: P,
    mut operation: F,
) -> Result<(T, u32), (E, u32)>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok((result, attempt)),
            Err(e) => {
                if !should_retry(&e) {
                    return Err((e, attempt));
                }

                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err((e, attempt));
                }

                // Add jitter: 0.5x to 1.5x of the delay
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered_delay = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = jittered_delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(jittered_delay).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}
