//! Bounded retry with a fixed delay, for user-initiated sends.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// How many times to try an operation and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// A single attempt, no retries.
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }
}

impl Default for RetryPolicy {
    /// 17 attempts, 250ms apart: a send survives a few seconds of reconnect.
    fn default() -> Self {
        Self::new(17, Duration::from_millis(250))
    }
}

/// Run `op` until it succeeds or the policy is exhausted, returning the last
/// error on failure.
pub async fn retry<T, E, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= policy.max_attempts => return Err(e),
            Err(e) => {
                debug!(attempt, max = policy.max_attempts, error = %e, "Attempt failed, retrying");
                attempt += 1;
                tokio::time::sleep(policy.delay).await;
            }
        }
    }
}
