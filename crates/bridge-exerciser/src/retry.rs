//! Exponential backoff with jitter, shared by chain queries and gap resubmission.

use crate::chain::ChainError;
use rand::Rng;
use std::time::Duration;
use tracing::{debug, warn};

/// Bounded exponential backoff: `initial_delay * 2^attempt`, capped at `max_delay`,
/// plus up to 25% jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub const fn new(max_retries: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay,
        }
    }

    /// Delay before retry number `attempt` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let initial_ms = u64::try_from(self.initial_delay.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);

        let base_delay = initial_ms.saturating_mul(1 << attempt.min(10));
        let capped_delay = base_delay.min(max_ms);
        let jitter = if capped_delay >= 4 {
            rand::thread_rng().gen_range(0..=capped_delay / 4)
        } else {
            0
        };
        Duration::from_millis(capped_delay + jitter)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(100), Duration::from_secs(5))
    }
}

/// Runs `f` until it succeeds, fails with a non-transient error, or the policy is exhausted.
pub async fn with_retry<F, Fut, T>(
    operation_name: &str,
    policy: &RetryPolicy,
    mut f: F,
) -> Result<T, ChainError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ChainError>>,
{
    let mut attempt = 0;

    loop {
        match f().await {
            Ok(result) => return Ok(result),
            Err(err) => {
                if !err.is_transient() {
                    debug!(
                        operation = %operation_name,
                        error = %err,
                        "Non-transient error, not retrying"
                    );
                    return Err(err);
                }

                if attempt >= policy.max_retries {
                    warn!(
                        operation = %operation_name,
                        attempts = %attempt,
                        error = %err,
                        "Max retries exceeded"
                    );
                    return Err(err);
                }

                let delay = policy.delay_for(attempt);
                warn!(
                    operation = %operation_name,
                    attempt = %(attempt + 1),
                    max_attempts = %policy.max_retries,
                    delay_ms = %delay.as_millis(),
                    error = %err,
                    "Transient chain error, retrying"
                );

                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
