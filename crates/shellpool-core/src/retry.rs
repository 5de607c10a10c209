use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;
use crate::error::ShellError;

/// Bounded exponential backoff with jitter for transient backend failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

impl RetryPolicy {
    /// No retries: every error is returned as-is.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Upper bound of the delay before retry number `attempt + 1`.
    #[must_use]
    pub fn delay_ceiling(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Jittered delay in `[ceiling / 2, ceiling]`.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let ceiling = u64::try_from(self.delay_ceiling(attempt).as_millis()).unwrap_or(u64::MAX);
        let half = ceiling / 2;
        Duration::from_millis(half + rand::rng().random_range(0..=ceiling - half))
    }
}

/// Run `f`, retrying transient failures according to `policy`.
///
/// # Errors
///
/// Returns the first non-transient error, or the last transient one once all
/// attempts are used.
pub async fn with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    f: F,
) -> Result<T, ShellError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ShellError>>,
{
    retry_when(policy, operation, ShellError::is_transient, f).await
}

/// Run `f`, retrying only the failures `retryable` accepts.
///
/// Writes that act on a live shell pass [`ShellError::is_undelivered`] so
/// input that may have arrived is never typed twice.
///
/// # Errors
///
/// Returns the first error `retryable` rejects, or the last accepted one once
/// all attempts are used.
pub async fn retry_when<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    retryable: impl Fn(&ShellError) -> bool,
    mut f: F,
) -> Result<T, ShellError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ShellError>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if retryable(&e) && attempt + 1 < policy.max_attempts => {
                let delay = policy.backoff(attempt);
                tracing::warn!(
                    operation,
                    attempt = attempt + 1,
                    max_attempts = policy.max_attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "transient backend error, retrying: {e}"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
