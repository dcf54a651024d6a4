//! Bounded retry for pushes racing other operations on the same branch.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

use super::WorkingCopy;

const MAX_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    #[default]
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    pub delay: Duration,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(2),
            backoff: Backoff::Fixed,
        }
    }
}

impl RetryPolicy {
    pub fn start(&self) -> RetryState<'_> {
        RetryState {
            policy: self,
            failures: 0,
        }
    }

    /// Wait before the attempt following the `failures`-th failure.
    pub fn delay_after(&self, failures: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Exponential => {
                let factor = 2u32.saturating_pow(failures.saturating_sub(1));
                self.delay.saturating_mul(factor).min(MAX_BACKOFF)
            }
        }
    }
}

/// Attempt bookkeeping for one retried action.
#[derive(Debug)]
pub struct RetryState<'a> {
    policy: &'a RetryPolicy,
    failures: u32,
}

impl RetryState<'_> {
    /// Attempts made so far, counting the one in flight.
    pub fn attempts(&self) -> u32 {
        self.failures + 1
    }

    /// Record a failed attempt.
    ///
    /// Sleeps and returns `Ok` when another attempt is allowed; hands the error
    /// back once the budget is spent.
    pub async fn failed(&mut self, err: StoreError) -> Result<(), StoreError> {
        self.failures += 1;
        if self.failures >= self.policy.max_attempts {
            return Err(err);
        }
        let delay = self.policy.delay_after(self.failures);
        tracing::warn!(
            attempt = self.failures,
            max_attempts = self.policy.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "retrying after failure"
        );
        tokio::time::sleep(delay).await;
        Ok(())
    }
}

/// Result of a successful retried push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushReport {
    pub attempts: u32,
    pub rebases: u32,
}

/// Push that never succeeded.
#[derive(Debug)]
pub struct PushFailure {
    pub attempts: u32,
    pub rebases: u32,
    pub source: StoreError,
}

/// Push the working copy, rebasing onto the new branch head after each rejection.
pub async fn push_with_retry(
    working_copy: &mut dyn WorkingCopy,
    policy: &RetryPolicy,
) -> Result<PushReport, PushFailure> {
    let mut retry = policy.start();
    let mut rebases = 0;
    loop {
        let err = match working_copy.push().await {
            Ok(()) => {
                return Ok(PushReport {
                    attempts: retry.attempts(),
                    rebases,
                });
            }
            Err(err) => err,
        };
        let attempts = retry.attempts();
        if !err.is_retryable() {
            return Err(PushFailure {
                attempts,
                rebases,
                source: err,
            });
        }
        if let Err(source) = retry.failed(err).await {
            return Err(PushFailure {
                attempts,
                rebases,
                source,
            });
        }
        rebases += 1;
        rebase_for_retry(working_copy).await.map_err(|source| PushFailure {
            attempts,
            rebases,
            source,
        })?;
    }
}

/// Rebase after a rejected push; a transient fetch failure is left for the next push to surface.
pub(crate) async fn rebase_for_retry(working_copy: &mut dyn WorkingCopy) -> Result<(), StoreError> {
    match working_copy.rebase().await {
        Ok(()) => Ok(()),
        Err(err) if matches!(err, StoreError::Transient { .. }) => {
            tracing::warn!(error = %err, "rebase hit a transient failure; retrying push anyway");
            Ok(())
        }
        Err(err) => Err(err),
    }
}
