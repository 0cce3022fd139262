//! # Retry
//!
//! Pacing for handler results that ask to see the same message again.
use std::time;

#[derive(Clone, Debug, PartialEq, Eq)]
/// Backoff applied between attempts at the same message.
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every past attempt.
    pub backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    pub initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    pub maximum_interval: Option<time::Duration>,
}

impl RetryPolicy {
    pub fn new(
        backoff_coefficient: u32,
        initial_interval: time::Duration,
        maximum_interval: Option<time::Duration>,
    ) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            maximum_interval,
        }
    }

    /// Determine interval for retrying at a given attempt number, starting at 1.
    pub fn retry_interval(&self, attempt: u32) -> time::Duration {
        let multiplier = self
            .backoff_coefficient
            .checked_pow(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        let candidate_interval = self.initial_interval.saturating_mul(multiplier);

        match self.maximum_interval {
            Some(max_interval) => std::cmp::min(candidate_interval, max_interval),
            None => candidate_interval,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            2,
            time::Duration::from_millis(10),
            Some(time::Duration::from_secs(5)),
        )
    }
}
