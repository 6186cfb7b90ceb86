//! Poll and retry policy for awaiting computation jobs.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    /// Every retry waits `initial_delay`.
    Fixed,
    /// Delay doubles per consecutive failure, capped at `max_delay`.
    Exponential,
}

/// Bound on consecutive transient failures and the delay between them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub backoff: BackoffKind,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            backoff: BackoffKind::Exponential,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: delay,
            backoff: BackoffKind::Fixed,
            max_delay: delay,
        }
    }

    pub fn exponential(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            backoff: BackoffKind::Exponential,
            max_delay,
        }
    }

    /// Delay before retrying after the `failures`-th consecutive failure
    /// (1-based).
    pub fn delay_after(&self, failures: u32) -> Duration {
        match self.backoff {
            BackoffKind::Fixed => self.initial_delay,
            BackoffKind::Exponential => {
                let shift = failures.saturating_sub(1).min(31);
                self.initial_delay
                    .checked_mul(1u32 << shift)
                    .unwrap_or(self.max_delay)
                    .min(self.max_delay)
            }
        }
    }

    /// True once `failures` consecutive failures use up the budget.
    pub fn exhausted(&self, failures: u32) -> bool {
        failures >= self.max_attempts
    }
}

/// How `await_finalization` polls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwaitPolicy {
    pub poll_interval: Duration,
    /// Overall bound on one await call.
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for AwaitPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            timeout: Duration::from_secs(120),
            retry: RetryPolicy::default(),
        }
    }
}
