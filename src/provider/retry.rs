//! Timeouts and retries around provider calls.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::ProviderError;

/// Default number of attempts per provider call.
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default delay before the first retry in milliseconds.
const DEFAULT_BASE_DELAY_MS: u64 = 1000;

/// Default cap on the retry delay in milliseconds.
const DEFAULT_MAX_DELAY_MS: u64 = 30_000;

/// Default provider call timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// How provider calls are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry; doubled for every further retry.
    pub base_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Timeout of a single attempt.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Returns the delay before retry number `retry` (1-based).
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Runs a provider call with a per-attempt timeout, retrying transient
    /// failures. `on_retry` is told about every retry before its delay.
    ///
    /// # Errors
    ///
    /// Returns the first fatal error, or `RetriesExhausted` once transient
    /// failures used up the attempt budget.
    pub async fn run<T, F, Fut, R>(
        &self,
        resource: &str,
        mut operation: F,
        mut on_retry: R,
    ) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
        R: FnMut(u32, &ProviderError),
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let result = match tokio::time::timeout(self.timeout, operation()).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout {
                    resource: resource.to_string(),
                    timeout_secs: self.timeout.as_secs(),
                }),
            };

            let error = match result {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => e,
            };

            if attempt >= max_attempts {
                warn!("Giving up on '{resource}' after {attempt} attempts: {error}");
                if max_attempts == 1 {
                    return Err(error);
                }
                return Err(ProviderError::RetriesExhausted {
                    resource: resource.to_string(),
                    attempts: attempt,
                    last_error: error.to_string(),
                });
            }

            let delay = self.delay_for(attempt);
            debug!(
                "Attempt {attempt}/{max_attempts} for '{resource}' failed ({error}), retrying in {}ms",
                delay.as_millis()
            );
            on_retry(attempt, &error);
            tokio::time::sleep(delay).await;
        }
    }
}
