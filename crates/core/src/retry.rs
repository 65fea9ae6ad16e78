//! Request-level retry with backoff
//!
//! Wraps a single remote request. Network failures, throttling and transient
//! server statuses are retried; every other reply goes straight back to the
//! caller, which classifies it once with [`Error::from_status`].
//!
//! [`Error::from_status`]: crate::error::Error::from_status

use crate::error::{Error, Result};
use crate::transport::HttpReply;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// How the wait grows between attempts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// `base * (attempt + 1)`
    Linear,
    /// `base * 2^attempt`
    #[default]
    Exponential,
}

/// Retry ceiling and wait schedule for one remote request
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

/// Statuses worth another attempt of the same request
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &Error) -> bool {
    matches!(err, Error::Network(_) | Error::Timeout)
}

impl RetryPolicy {
    /// Policy that never retries
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Wait before retry number `attempt` (0-based), without jitter
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let delay = match self.strategy {
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt.saturating_add(1)),
            BackoffStrategy::Exponential => {
                let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
        };
        delay.min(self.max_delay)
    }

    /// Wait before retry number `attempt`, honoring a server hint
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let computed = self.backoff_delay(attempt);
        let base = match retry_after {
            Some(hint) => hint.max(computed),
            None => computed,
        };
        let jitter_cap = (base.as_millis() / 10) as u64;
        let jitter = if jitter_cap > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_cap))
        } else {
            Duration::ZERO
        };
        (base + jitter).min(self.max_delay)
    }

    /// Run `request` until it yields a non-retryable reply or the retry
    /// ceiling is reached. The last reply (or error) is returned as-is.
    pub async fn execute<F, Fut>(&self, operation: &str, mut request: F) -> Result<HttpReply>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<HttpReply>>,
    {
        let mut attempt = 0u32;
        loop {
            let outcome = request().await;
            let retry_after = match &outcome {
                Ok(reply) if is_retryable_status(reply.status.as_u16()) => reply.retry_after,
                Err(e) if is_retryable_error(e) => None,
                _ => return outcome,
            };

            if attempt >= self.max_retries {
                return outcome;
            }

            let delay = self.delay_for(attempt, retry_after);
            match &outcome {
                Ok(reply) => warn!(
                    operation,
                    attempt = attempt + 1,
                    max = self.max_retries,
                    status = reply.status.as_u16(),
                    delay_ms = delay.as_millis() as u64,
                    "Retrying request"
                ),
                Err(e) => warn!(
                    operation,
                    attempt = attempt + 1,
                    max = self.max_retries,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying request"
                ),
            }
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
