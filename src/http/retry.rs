//! Retry helper for idempotent calls

use crate::config::HttpConfig;
use crate::error::ToolError;
use reqwest::Method;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Whether repeating a request is safe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Idempotency {
    Idempotent,
    NonIdempotent,
}

impl Idempotency {
    /// GET, HEAD and OPTIONS are idempotent; everything else is not
    pub fn of_method(method: &Method) -> Self {
        if *method == Method::GET || *method == Method::HEAD || *method == Method::OPTIONS {
            Idempotency::Idempotent
        } else {
            Idempotency::NonIdempotent
        }
    }
}

/// Exponential backoff with jitter
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&HttpConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &HttpConfig) -> Self {
        Self {
            max_attempts: config.retry_attempts.max(1),
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
        }
    }

    /// A single attempt
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (1-based): base * 2^(retry-1), capped, plus up to 10%
    pub fn delay_for(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let exp = 2u32.saturating_pow(retry - 1);
        let delay = self.base_delay.saturating_mul(exp).min(self.max_delay);
        let jitter = delay.mul_f64(rand::random::<f64>() * 0.1);
        delay + jitter
    }
}

/// Run `f`, retrying transient failures of idempotent calls
///
/// Non-idempotent calls run exactly once.
pub async fn with_retry<F, Fut, T>(
    policy: &RetryPolicy,
    idempotency: Idempotency,
    mut f: F,
) -> Result<T, ToolError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ToolError>>,
{
    let max_attempts = match idempotency {
        Idempotency::Idempotent => policy.max_attempts.max(1),
        Idempotency::NonIdempotent => 1,
    };

    let mut attempt = 1u32;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let delay = policy.delay_for(attempt);
                debug!(
                    "Attempt {}/{} failed ({}), retrying in {:?}",
                    attempt, max_attempts, e, delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
