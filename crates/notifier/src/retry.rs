//! Retry policy for failed delivery attempts.
//!
//! The delay is a pure function of the attempt's `retry_count`, so the same
//! request always waits the same amount before the same attempt.

use std::time::Duration;

/// Default number of attempts (initial + retries) before dead-lettering.
const DEFAULT_MAX_RETRIES: u32 = 4;

/// Default backoff base.
const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(2_000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts allowed before the request is dead-lettered
    pub max_retries: u32,
    /// Delay before the first retry; doubles with each further attempt
    pub base_delay: Duration,
}

/// What to do with a request whose attempt just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-publish with `retry_count = next_retry` after `delay`.
    Retry { next_retry: u32, delay: Duration },
    /// Attempts exhausted.
    DeadLetter,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Backoff before re-publishing an attempt that failed with `retry_count`:
    /// `base_delay * 2^retry_count`, saturating.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let factor = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    pub fn decide(&self, retry_count: u32) -> RetryDecision {
        let next_retry = retry_count.saturating_add(1);
        if next_retry >= self.max_retries {
            RetryDecision::DeadLetter
        } else {
            RetryDecision::Retry {
                next_retry,
                delay: self.delay_for(retry_count),
            }
        }
    }
}
