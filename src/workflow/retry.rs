//! Retry policy for failed node executions.
//!
//! Attempts are bounded by the node record's retry budget; this module
//! decides whether an error class is worth repeating and how long to wait
//! between attempts (exponential backoff with optional jitter).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Backoff configuration for retryable failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial_delay_ms: u64,
    /// Upper bound on the delay between attempts.
    pub max_delay_ms: u64,
    /// Multiplier applied per attempt.
    pub backoff_multiplier: f64,
    /// Randomize each delay by ±25% to avoid thundering herds.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Immediate retries, for tests and inline execution.
    pub fn immediate() -> Self {
        Self {
            initial_delay_ms: 0,
            max_delay_ms: 0,
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }

    /// Delay before retry attempt `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay_ms as f64;
        let multiplier = self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let mut delay_ms = (base * multiplier) as u64;
        delay_ms = delay_ms.min(self.max_delay_ms);

        if self.jitter && delay_ms > 0 {
            let jitter_range = delay_ms / 4;
            if jitter_range > 0 {
                let jitter = rand::random::<u64>() % (jitter_range * 2);
                delay_ms = delay_ms.saturating_sub(jitter_range) + jitter;
            }
        }

        Duration::from_millis(delay_ms)
    }
}

/// Outcome of consulting the retry classifier after a failure.
#[derive(Debug, Clone)]
pub enum RetryDecision {
    /// Try again after the given delay.
    Retry { delay: Duration, attempt: u32 },
    /// The error class is not retryable.
    Fatal,
    /// The record's retry budget is consumed.
    Exhausted { attempts: u32 },
}

/// Decide whether a failed attempt should be repeated.
///
/// `retry_count` is the number of retries already consumed and
/// `max_retries` the record's budget.
pub fn classify(
    policy: &RetryPolicy,
    error: &EngineError,
    retry_count: u32,
    max_retries: u32,
) -> RetryDecision {
    if !error.is_retryable() {
        return RetryDecision::Fatal;
    }
    if retry_count >= max_retries {
        return RetryDecision::Exhausted {
            attempts: retry_count,
        };
    }

    let attempt = retry_count + 1;
    RetryDecision::Retry {
        delay: policy.delay_for_attempt(attempt),
        attempt,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_error_is_retried_with_backoff() {
        let policy = RetryPolicy {
            jitter: false,
            ..Default::default()
        };
        let error = EngineError::UpstreamFailure("connection reset".into());

        match classify(&policy, &error, 0, 3) {
            RetryDecision::Retry { delay, attempt } => {
                assert_eq!(attempt, 1);
                assert_eq!(delay.as_millis(), 1_000);
            }
            other => panic!("expected Retry, got {:?}", other),
        }

        match classify(&policy, &error, 2, 3) {
            RetryDecision::Retry { delay, attempt } => {
                assert_eq!(attempt, 3);
                assert_eq!(delay.as_millis(), 4_000);
            }
            other => panic!("expected Retry, got {:?}", other),
        }
    }

    #[test]
    fn fatal_errors_are_not_retried() {
        let policy = RetryPolicy::default();
        let error = EngineError::InvalidGraph("dangling edge".into());
        assert!(matches!(
            classify(&policy, &error, 0, 3),
            RetryDecision::Fatal
        ));
    }

    #[test]
    fn exhausted_budget_stops_retrying() {
        let policy = RetryPolicy::default();
        let error = EngineError::Timeout { seconds: 30 };
        assert!(matches!(
            classify(&policy, &error, 3, 3),
            RetryDecision::Exhausted { attempts: 3 }
        ));
    }

    #[test]
    fn delay_is_capped_at_max() {
        let policy = RetryPolicy {
            initial_delay_ms: 1_000,
            max_delay_ms: 5_000,
            backoff_multiplier: 10.0,
            jitter: false,
        };
        assert_eq!(policy.delay_for_attempt(4).as_millis(), 5_000);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_multiplier: 1.0,
            jitter: true,
        };
        for _ in 0..50 {
            let delay = policy.delay_for_attempt(1).as_millis() as u64;
            assert!((750..=1_250).contains(&delay));
        }
    }
}
