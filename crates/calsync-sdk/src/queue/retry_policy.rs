use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::CalsyncError;

/// Retry policy for sync queue items
///
/// Every failed attempt (transport error, nack, ack timeout) increments the
/// item's `retry_count`. While the count stays below `max_retries` the item
/// goes back to `pending` after an exponential, capped, jittered delay; once it
/// reaches `max_retries` the item is failed permanently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// Delay before the first retry (milliseconds)
    pub base_delay_ms: u64,
    /// Upper bound for any delay (milliseconds)
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
    /// Random jitter factor (0.0-1.0) applied around the computed delay
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_factor: 2.0,
            jitter_factor: 0.1,
        }
    }
}

/// What to do with an item after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

impl RetryPolicy {
    /// Decide for an item whose retry count has already been incremented
    pub fn decide(&self, retry_count: u32, error: &CalsyncError) -> RetryDecision {
        if !self.should_retry(retry_count, error) {
            return RetryDecision::GiveUp;
        }
        RetryDecision::RetryAfter(self.delay_for(retry_count.saturating_sub(1)))
    }

    pub fn should_retry(&self, retry_count: u32, error: &CalsyncError) -> bool {
        retry_count < self.max_retries && error.is_retryable()
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        backoff_delay(
            self.base_delay_ms,
            self.backoff_factor,
            self.max_delay_ms,
            self.jitter_factor,
            attempt,
        )
    }
}

/// `base * factor^attempt`, capped at `max`, with `±jitter/2` noise
pub(crate) fn backoff_delay(base_ms: u64, factor: f64, max_ms: u64, jitter: f64, attempt: u32) -> Duration {
    let raw = base_ms as f64 * factor.powf(attempt as f64);
    let capped = raw.min(max_ms as f64);
    let noise = if jitter > 0.0 {
        capped * jitter * (rand::random::<f64>() - 0.5)
    } else {
        0.0
    };
    let final_ms = (capped + noise).clamp(0.0, max_ms as f64);
    Duration::from_millis(final_ms as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> RetryPolicy {
        RetryPolicy {
            jitter_factor: 0.0,
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn test_exponential_delay_is_capped() {
        let policy = RetryPolicy {
            max_delay_ms: 5_000,
            ..no_jitter()
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(1), Duration::from_millis(2_000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(4_000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(5_000));
        assert_eq!(policy.delay_for(30), Duration::from_millis(5_000));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            let delay = policy.delay_for(0).as_millis();
            assert!((950..=1_050).contains(&delay), "delay {} out of bounds", delay);
        }
    }

    #[test]
    fn test_gives_up_at_max_retries() {
        let policy = no_jitter();
        let timeout = CalsyncError::SendTimeout { item_id: "a".into(), attempts: 1 };

        assert_eq!(policy.decide(1, &timeout), RetryDecision::RetryAfter(Duration::from_millis(1_000)));
        assert_eq!(policy.decide(2, &timeout), RetryDecision::RetryAfter(Duration::from_millis(2_000)));
        assert_eq!(policy.decide(3, &timeout), RetryDecision::GiveUp);
        assert_eq!(policy.decide(4, &timeout), RetryDecision::GiveUp);
    }

    #[test]
    fn test_non_retryable_error_gives_up_immediately() {
        let policy = no_jitter();
        let rejected = CalsyncError::SendFailed { item_id: "a".into(), reason: "forbidden".into() };
        assert_eq!(policy.decide(1, &rejected), RetryDecision::GiveUp);
    }
}
