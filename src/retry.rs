//! Retry with exponential backoff and jitter.
//!
//! Strategy:
//! - `Network` (5xx, timeouts, resets) → retry with backoff
//! - `RateLimited` → wait the advertised interval when given, else back off
//! - everything else (auth, 4xx, 409 conflict, validation) → fail immediately
//! - backoff: `initial * 2^(attempt-1)`, capped at `max_backoff`, jittered

use rand::Rng;
use std::future::Future;
use std::time::Duration;

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Upper bound on the advertised retry-after we are willing to honor.
    pub max_retry_after: Duration,
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            max_retry_after: Duration::from_secs(60),
            jitter: 0.5,
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before attempt `attempt + 1`, given the error from `attempt`.
    pub fn delay_for(&self, attempt: u32, err: &EngineError) -> Duration {
        if let Some(advertised) = err.retry_after() {
            return advertised.min(self.max_retry_after);
        }
        let exp = attempt.saturating_sub(1).min(16);
        let base = self
            .initial_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let factor = rand::thread_rng().gen_range((1.0 - self.jitter.min(0.99))..=1.0);
        base.mul_f64(factor)
    }
}

/// Run `op` until it succeeds, fails permanently, or attempts run out.
pub async fn retry_with_backoff<T, F, Fut>(policy: &RetryPolicy, context: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                let wait = policy.delay_for(attempt, &err);
                tracing::warn!(
                    context,
                    attempt,
                    wait_ms = wait.as_millis() as u64,
                    error = %err,
                    "transient failure, retrying"
                );
                tokio::time::sleep(wait).await;
            }
            Err(err) => {
                if err.is_retryable() {
                    tracing::debug!(context, attempt, error = %err, "retries exhausted");
                }
                return Err(err);
            }
        }
    }
}
