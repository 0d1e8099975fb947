use crate::error::Result;
use crate::types::RetryConfig;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Delay before the n-th retry: doubles from `initial` up to `ceiling`, then
/// scaled by a random factor in `[1 - jitter, 1 + jitter]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    initial: Duration,
    ceiling: Duration,
    jitter: f64,
}

impl Backoff {
    pub fn new(initial: Duration, ceiling: Duration, jitter: f64) -> Self {
        let initial = initial.max(Duration::from_millis(1));
        Self {
            initial,
            ceiling: ceiling.max(initial),
            jitter: if jitter.is_finite() { jitter.clamp(0.0, 1.0) } else { 0.0 },
        }
    }

    /// Delay before retry number `retry` (0 for the first retry)
    pub fn delay(&self, retry: u32) -> Duration {
        let doubled = 1u32
            .checked_shl(retry)
            .and_then(|factor| self.initial.checked_mul(factor))
            .unwrap_or(self.ceiling);
        let capped = doubled.min(self.ceiling);

        if self.jitter == 0.0 {
            return capped;
        }
        let factor = rand::thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        capped.mul_f64(factor)
    }
}

/// Ledger calls are retried only while the node is unreachable; any other
/// error is returned on the spot.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    attempts: u32,
    backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(attempts: u32, backoff: Backoff) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
        }
    }

    /// Single attempt
    pub fn none() -> Self {
        Self::new(1, Backoff::new(Duration::ZERO, Duration::ZERO, 0.0))
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Run `call` until it succeeds, fails with a non-retryable error, or the
    /// attempts are used up. `action` names the call in logs.
    pub async fn retry_async<F, Fut, T>(&self, action: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut failures = 0;
        loop {
            let err = match call().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            failures += 1;
            if !err.is_retryable() || failures >= self.attempts {
                return Err(err);
            }

            let delay = self.backoff.delay(failures - 1);
            warn!(
                "{} failed ({}/{}), retrying in {}ms: {}",
                action,
                failures,
                self.attempts,
                delay.as_millis(),
                err
            );
            tokio::time::sleep(delay).await;
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        let backoff = Backoff::new(
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.jitter_pct,
        );
        Self::new(u32::try_from(config.max_attempts).unwrap_or(u32::MAX), backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            5,
            Backoff::new(Duration::from_millis(250), Duration::from_secs(5), 0.2),
        )
    }
}
