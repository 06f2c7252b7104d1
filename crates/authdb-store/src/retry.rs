//! Retrying transactions that lost a write-write race.

use std::future::Future;
use std::time::Duration;

use backoff::exponential::{ExponentialBackoff, ExponentialBackoffBuilder};
use backoff::SystemClock;

use crate::error::{Result, StoreError};

/// Bounded exponential backoff for [`StoreError::Conflict`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub min_delay: Duration,
    /// Upper bound on the un-randomized delay.
    pub max_delay: Duration,
    /// Total attempts, the first one included.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(500),
            max_attempts: 10,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// The delay schedule between attempts.
    ///
    /// Starts at `min_delay` and doubles up to `max_delay`, each delay
    /// randomized by up to half either way. The schedule never runs out on
    /// its own; `max_attempts` ends it.
    pub fn backoff(&self) -> ExponentialBackoff<SystemClock> {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.min_delay)
            .with_max_interval(self.max_delay)
            .with_multiplier(2.0)
            .with_randomization_factor(0.5)
            .with_max_elapsed_time(None)
            .build()
    }
}

/// Run `op` until it succeeds, fails with anything but a conflict, or the
/// policy's attempts run out.
pub async fn retry_on_conflict<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    let operation = || {
        attempt += 1;
        let last = attempt >= policy.max_attempts;
        let fut = op();
        async move {
            match fut.await {
                Ok(value) => Ok(value),
                Err(err @ StoreError::Conflict(_)) if !last => Err(backoff::Error::transient(err)),
                Err(err) => Err(backoff::Error::permanent(err)),
            }
        }
    };
    let notify = |err: StoreError, delay: Duration| {
        tracing::debug!(?delay, error = %err, "transaction conflict, retrying");
    };

    backoff::future::retry_notify(policy.backoff(), operation, notify).await
}
