use std::{future::Future, time::Duration};

use backon::{ExponentialBuilder, Retryable as _};

/// Errors that tell the retry loop whether another attempt could succeed.
pub trait Retryable {
    fn is_exhausted(&self) -> bool;
}

/// Exponential backoff applied while connections are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.base_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_attempts.saturating_sub(1) as usize)
    }
}

pub async fn with_backoff<T, E, F, Fut>(policy: &RetryPolicy, op: F) -> Result<T, E>
where
    E: Retryable,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    op.retry(policy.backoff())
        .when(|error: &E| error.is_exhausted())
        .notify(|_, delay| tracing::warn!(?delay, "connections exhausted, backing off"))
        .await
}
