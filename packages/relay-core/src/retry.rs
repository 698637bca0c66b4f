//! Backoff policies.
//!
//! Transient errors (network, malformed ledger responses) are retried with a
//! capped exponential backoff and no deadline. Logical failures (bad proof,
//! rejected submission) are retried against a bounded [`AttemptBudget`].

use std::future::Future;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use log::warn;

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay: max_delay.max(initial_delay),
        }
    }

    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_delay)
            .with_max_interval(self.max_delay)
            .with_max_elapsed_time(None)
            .build()
    }

    pub fn budget(&self, attempts: u32, max_attempts: u32) -> AttemptBudget<ExponentialBackoff> {
        AttemptBudget::new(self.backoff(), attempts, max_attempts)
    }
}

/// Wraps a backoff and stops it once `max_attempts` failures were recorded.
///
/// `attempts` is seeded from the persisted record so a restart does not
/// hand a nonce a fresh budget.
#[derive(Debug, Clone)]
pub struct AttemptBudget<B> {
    inner: B,
    attempts: u32,
    max_attempts: u32,
}

impl<B: Backoff> AttemptBudget<B> {
    pub fn new(inner: B, attempts: u32, max_attempts: u32) -> Self {
        Self {
            inner,
            attempts,
            max_attempts,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

impl<B: Backoff> Backoff for AttemptBudget<B> {
    /// Records one failed attempt.
    fn next_backoff(&mut self) -> Option<Duration> {
        self.attempts = self.attempts.saturating_add(1);
        if self.exhausted() {
            None
        } else {
            self.inner.next_backoff()
        }
    }

    fn reset(&mut self) {
        self.inner.reset();
    }
}

/// Runs `op` until it succeeds or fails with a non-transient error.
pub async fn retry_transient<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    backoff::future::retry_notify(
        policy.backoff(),
        || {
            let fut = op();
            async move {
                fut.await.map_err(|e| {
                    if e.is_transient() {
                        backoff::Error::transient(e)
                    } else {
                        backoff::Error::permanent(e)
                    }
                })
            }
        },
        |e: Error, wait: Duration| {
            warn!("{}: transient error, retrying in {:?}: {}", label, wait, e);
        },
    )
    .await
}
