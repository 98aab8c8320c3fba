//! Retry logic with exponential backoff
//!
//! Transient failures are retried at the component boundary where they occur
//! (replication connect, buffer write, object upload). Any other error kind is
//! returned immediately.

use crate::config::Config;
use crate::error::{CdcError, Result};
use backoff::backoff::Backoff;
use backoff::future::retry;
use backoff::{Error as BackoffError, ExponentialBackoff};
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Configuration for retry logic
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub max_duration: Duration,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for RetryConfig {
    fn from(config: &Config) -> Self {
        Self {
            max_attempts: config.max_retry_attempts,
            initial_delay: config.initial_retry_delay,
            max_delay: config.max_retry_delay,
            multiplier: config.retry_multiplier,
            max_duration: config.max_retry_duration,
            jitter: config.retry_jitter,
        }
    }
}

impl RetryConfig {
    /// Create an exponential backoff policy from retry configuration
    pub fn to_backoff(&self) -> ExponentialBackoff {
        let mut backoff = ExponentialBackoff {
            current_interval: self.initial_delay,
            initial_interval: self.initial_delay,
            randomization_factor: if self.jitter { 0.3 } else { 0.0 },
            multiplier: self.multiplier,
            max_interval: self.max_delay,
            max_elapsed_time: Some(self.max_duration),
            ..Default::default()
        };

        backoff.reset();
        backoff
    }

    /// Deterministic delay before retry number `attempt` (1-based), without jitter
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }

    /// Fast policy for tests
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 1.0,
            max_duration: Duration::from_secs(5),
            jitter: false,
        }
    }
}

/// Run `operation` until it succeeds, retrying transient errors with backoff.
///
/// Gives up with [`CdcError::RetryExhausted`] after `max_attempts` attempts or
/// once the backoff's elapsed-time budget is spent. Non-transient errors are
/// returned unchanged on first occurrence.
pub async fn retry_transient<T, F, Fut>(config: &RetryConfig, what: &str, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let start_time = Instant::now();
    let max_attempts = config.max_attempts.max(1);
    let mut attempt: u32 = 0;

    let result = retry(config.to_backoff(), || {
        attempt += 1;
        let current = attempt;
        let fut = operation();
        async move {
            match fut.await {
                Ok(value) => Ok(value),
                Err(e) if e.is_transient() && current < max_attempts => {
                    warn!("{} failed (attempt {}/{}): {}", what, current, max_attempts, e);
                    Err(BackoffError::Transient {
                        err: e,
                        retry_after: None,
                    })
                }
                Err(e) if e.is_transient() => {
                    error!("{} failed after {} attempts: {}", what, current, e);
                    Err(BackoffError::Permanent(CdcError::retry_exhausted(format!(
                        "{}: {}",
                        what, e
                    ))))
                }
                Err(e) => Err(BackoffError::Permanent(e)),
            }
        }
    })
    .await;

    match &result {
        Ok(_) if attempt > 1 => info!(
            "{} succeeded after {} attempts in {:?}",
            what,
            attempt,
            start_time.elapsed()
        ),
        Ok(_) => debug!("{} succeeded", what),
        Err(e) if e.is_transient() => {
            // backoff stopped on elapsed time with a transient error still pending
            return Err(CdcError::retry_exhausted(format!("{}: {}", what, e)));
        }
        Err(_) => {}
    }

    result
}
