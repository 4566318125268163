//! Retry policy: decides what happens to a job after a failed attempt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::job::duration_serde;

/// How often and how late a failing job is retried.
///
/// `max_retries` bounds the number of recorded failures: the failure that
/// brings the count to `max_retries` exhausts the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Failures after which the job is exhausted.
    pub max_retries: u32,
    /// Delay before each retry; the last entry repeats once the list runs out.
    #[serde(with = "duration_serde")]
    pub delays: Vec<Duration>,
}

/// Outcome of applying a policy to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule another attempt at the given time.
    RetryAt(DateTime<Utc>),
    /// Give up; the job moves to `FailedExhausted`.
    Exhausted,
}

impl RetryPolicy {
    /// Create a policy from an explicit delay sequence.
    pub fn new(max_retries: u32, delays: impl IntoIterator<Item = Duration>) -> Self {
        Self {
            max_retries,
            delays: delays.into_iter().collect(),
        }
    }

    /// Same delay before every retry.
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self::new(max_retries, [delay])
    }

    /// Doubling delays starting at `base`, capped at `cap`.
    pub fn exponential(max_retries: u32, base: Duration, cap: Duration) -> Self {
        let delays = (0..max_retries.max(1)).map(|attempt| {
            let multiplier = 2u32.saturating_pow(attempt);
            base.checked_mul(multiplier).unwrap_or(cap).min(cap)
        });
        Self::new(max_retries, delays)
    }

    /// Fail straight to `FailedExhausted`.
    pub fn no_retries() -> Self {
        Self::new(0, [])
    }

    /// Delay before the retry that follows failure number `failures` (1-based).
    pub fn delay_for(&self, failures: u32) -> Duration {
        let index = failures.saturating_sub(1) as usize;
        self.delays
            .get(index)
            .or_else(|| self.delays.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }

    /// Decide the next step after failure number `failures`.
    pub fn decide(&self, failures: u32, fatal: bool, now: DateTime<Utc>) -> RetryDecision {
        if fatal || failures >= self.max_retries {
            return RetryDecision::Exhausted;
        }
        let delay = chrono::Duration::from_std(self.delay_for(failures))
            .unwrap_or_else(|_| chrono::Duration::days(365));
        RetryDecision::RetryAt(now + delay)
    }
}
