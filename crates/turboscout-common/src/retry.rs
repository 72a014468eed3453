//! Bounded retries and deadlines for async operations.

use std::future::Future;
use std::iter;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

/// How often, and how patiently, to retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total attempts including the first. Zero is treated as one.
    pub max_attempts: u32,
    /// Pause before the second attempt. Doubles for each attempt after that.
    pub initial_delay: Duration,
    /// Ceiling for any single pause.
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::attempts(1)
    }
}

impl RetryConfig {
    /// Single attempt.
    pub fn none() -> Self {
        Self::attempts(1)
    }

    /// `max_attempts` attempts with the default schedule (200ms doubling, capped at 5s).
    pub fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }

    /// Pauses between consecutive attempts, `max_attempts - 1` of them.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        let first = self.initial_delay.min(self.max_delay);
        iter::successors(Some(first), move |prev| {
            Some(prev.saturating_mul(2).min(self.max_delay))
        })
        .take(self.max_attempts.max(1) as usize - 1)
    }
}

/// Run `operation` until it succeeds or the attempts in `config` run out.
///
/// The error of the last attempt is returned.
pub async fn retry_with_backoff<T, E, F, Fut>(config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delays = config.delays();
    let mut attempt = 1u32;

    loop {
        let error = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        let Some(delay) = delays.next() else {
            if attempt > 1 {
                warn!(attempt, error = %error, "Giving up");
            }
            return Err(error);
        };

        debug!(attempt, ?delay, error = %error, "Attempt failed, retrying");
        sleep(delay).await;
        attempt += 1;
    }
}

/// Fail with [`CommonError::Timeout`](crate::CommonError::Timeout) if `operation` outlives
/// `timeout`.
pub async fn with_timeout<T, F, Fut>(timeout: Duration, operation: F) -> crate::Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, operation())
        .await
        .map_err(|_| crate::CommonError::Timeout(timeout))
}
