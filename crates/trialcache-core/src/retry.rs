//! Retry with exponential backoff.
//!
//! `retry_on_conflict` re-runs an attempt while its error satisfies a
//! conflict predicate, sleeping `base * 2^attempt` between tries. Any other
//! error ends the loop immediately.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// Default retries for an optimistic read-modify-write.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default base delay between retries.
pub const DEFAULT_BASE_DELAY_MS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }
}

/// Why a retried operation gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError<E> {
    /// Every retry hit a conflict; carries the last conflict.
    Exhausted { retries: u32, last: E },
    /// A non-conflict error ended the loop.
    Failed(E),
}

/// Run `attempt` until it succeeds, fails with a non-conflict error, or has
/// been retried `policy.max_retries` times.
pub async fn retry_on_conflict<T, E, F, Fut, P>(
    policy: RetryPolicy,
    mut attempt: F,
    is_conflict: P,
) -> std::result::Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let mut retries = 0;
    loop {
        match attempt(retries).await {
            Ok(value) => return Ok(value),
            Err(e) if is_conflict(&e) => {
                if retries >= policy.max_retries {
                    return Err(RetryError::Exhausted { retries, last: e });
                }
                let delay = policy.backoff(retries);
                debug!(retry = retries + 1, delay_ms = delay.as_millis() as u64, "Conflict, backing off");
                tokio::time::sleep(delay).await;
                retries += 1;
            }
            Err(e) => return Err(RetryError::Failed(e)),
        }
    }
}
