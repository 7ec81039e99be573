//! Bounded exponential backoff shared by every external call site.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::{Result, RetrievalError};

/// Retry policy applied at the embedding and upsert boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Always at least 1.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles for each further attempt.
    pub base_delay: Duration,
    /// Upper bound for a single delay (before jitter).
    pub max_delay: Duration,
    /// Adds up to 50% random extra delay to spread out concurrent retries.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Policy with `max_attempts` attempts and no sleeping between them.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    /// Backoff before attempt `attempt + 1`, without jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << exponent);
        delay.min(self.max_delay)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let extra = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 2);
        delay + Duration::from_millis(extra)
    }

    /// Runs `call` until it succeeds, fails permanently, or attempts run out.
    ///
    /// `call` receives the 1-based attempt number. Only errors for which
    /// [`RetrievalError::is_transient`] is true are retried.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1u32;
        loop {
            match call(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    let delay = self.jittered(self.delay_for(attempt));
                    tracing::warn!(
                        operation,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    if attempt > 1 {
                        tracing::error!(operation, attempts = attempt, error = %err, "giving up");
                    }
                    return Err(err);
                }
            }
        }
    }
}

/// Maps a reqwest transport failure onto the retry classification.
pub(crate) fn is_retryable_transport(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request() || err.is_body()
}

/// HTTP statuses worth retrying: rate limits and server errors.
pub(crate) fn is_retryable_status(status: reqwest::StatusCode) -> bool {
    status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Helper for callers that need a permanent configuration failure.
pub(crate) fn ensure_attempts(policy: &RetryPolicy) -> Result<()> {
    if policy.max_attempts == 0 {
        return Err(RetrievalError::Config(
            "retry policy needs at least one attempt".into(),
        ));
    }
    Ok(())
}
