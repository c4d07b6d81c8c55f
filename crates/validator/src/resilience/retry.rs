//! Capped exponential backoff with jitter.
//!
//! The delay after the *n*th failure is `min(max_backoff, min_backoff * 2^(n-1))`,
//! then scaled by a random factor in `[1 - jitter, 1 + jitter]` so concurrent
//! checks do not retry against the same endpoint in lockstep. The jittered
//! delay never exceeds `max_backoff`.
//!
//! Only transient errors are retried. After `max_retries` retries the next
//! failure is surfaced as `RetryExhausted` by the caller.

use common::error::ValidationError;
use rand::Rng;
use std::time::Duration;

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default delay before the first retry.
pub const DEFAULT_MIN_BACKOFF: Duration = Duration::from_millis(1000);

/// Default ceiling for any single delay.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_millis(8000);

/// Default jitter fraction (±20%).
pub const DEFAULT_JITTER: f64 = 0.2;

/// Outcome of [`RetryPolicy::should_retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub retry: bool,
    pub delay: Duration,
}

impl RetryDecision {
    const STOP: RetryDecision = RetryDecision {
        retry: false,
        delay: Duration::ZERO,
    };
}

/// Pure retry decision logic.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_retries: u32,
    min_backoff: Duration,
    max_backoff: Duration,
    jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES, DEFAULT_MIN_BACKOFF, DEFAULT_MAX_BACKOFF)
    }
}

impl RetryPolicy {
    /// Create a policy with the default jitter.
    ///
    /// `max_backoff` is raised to `min_backoff` if configured below it.
    #[must_use]
    pub fn new(max_retries: u32, min_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_retries,
            min_backoff,
            max_backoff: max_backoff.max(min_backoff),
            jitter: DEFAULT_JITTER,
        }
    }

    /// Set the jitter fraction, clamped to `[0, 1]`.
    #[must_use]
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Maximum number of calls made for one operation (first try + retries).
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before jitter for the retry following failure number `attempt` (1-based).
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.min_backoff
            .checked_mul(1u32 << exponent)
            .map_or(self.max_backoff, |delay| delay.min(self.max_backoff))
    }

    /// Apply jitter to a base delay.
    #[must_use]
    pub fn jittered(&self, base: Duration) -> Duration {
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let factor = rand::thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        base.mul_f64(factor)
    }

    /// Decide whether to retry after failure number `attempt` (1-based).
    #[must_use]
    pub fn should_retry(&self, attempt: u32, error: &ValidationError) -> RetryDecision {
        if !error.is_retryable() || attempt == 0 || attempt > self.max_retries {
            return RetryDecision::STOP;
        }
        RetryDecision {
            retry: true,
            delay: self.jittered(self.base_delay(attempt)).min(self.max_backoff),
        }
    }
}

/// Per-call-site attempt counter.
#[derive(Debug)]
pub struct RetryState<'a> {
    policy: &'a RetryPolicy,
    failures: u32,
}

impl<'a> RetryState<'a> {
    #[must_use]
    pub fn new(policy: &'a RetryPolicy) -> Self {
        Self {
            policy,
            failures: 0,
        }
    }

    /// Record a failed attempt and return the policy's decision.
    pub fn record_failure(&mut self, error: &ValidationError) -> RetryDecision {
        self.failures = self.failures.saturating_add(1).min(self.policy.max_attempts());
        self.policy.should_retry(self.failures, error)
    }

    /// Number of attempts made so far.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.failures
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn transient() -> ValidationError {
        ValidationError::Transient("503 Service Unavailable".to_string())
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_secs(1), Duration::from_secs(8)).with_jitter(0.0)
    }

    #[test]
    fn test_base_delays_double_until_cap() {
        let policy = policy();
        assert_eq!(policy.base_delay(1), Duration::from_secs(1));
        assert_eq!(policy.base_delay(2), Duration::from_secs(2));
        assert_eq!(policy.base_delay(3), Duration::from_secs(4));
        assert_eq!(policy.base_delay(4), Duration::from_secs(8));
        assert_eq!(policy.base_delay(10), Duration::from_secs(8));
        assert_eq!(policy.base_delay(40), Duration::from_secs(8));
    }

    #[test]
    fn test_base_delay_is_monotonic() {
        let policy = RetryPolicy::new(20, Duration::from_millis(250), Duration::from_secs(30));
        let mut previous = Duration::ZERO;
        for attempt in 1..=20 {
            let delay = policy.base_delay(attempt);
            assert!(delay >= previous);
            assert!(delay <= Duration::from_secs(30));
            previous = delay;
        }
    }

    #[test]
    fn test_fourth_failure_stops_retrying() {
        let policy = policy();
        let err = transient();

        let delays: Vec<_> = (1..=3)
            .map(|attempt| policy.should_retry(attempt, &err))
            .collect();
        assert!(delays.iter().all(|d| d.retry));
        assert_eq!(
            delays.iter().map(|d| d.delay).collect::<Vec<_>>(),
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );

        assert!(!policy.should_retry(4, &err).retry);
    }

    #[test]
    fn test_permanent_errors_are_not_retried() {
        let policy = policy();
        let decision = policy.should_retry(1, &ValidationError::Permanent("403".to_string()));
        assert!(!decision.retry);
    }

    #[test]
    fn test_jitter_stays_within_twenty_percent() {
        let policy = RetryPolicy::new(3, Duration::from_secs(1), Duration::from_secs(8));
        for _ in 0..200 {
            let delay = policy.should_retry(2, &transient()).delay;
            assert!(delay >= Duration::from_millis(1600), "{delay:?}");
            assert!(delay <= Duration::from_millis(2400), "{delay:?}");
        }
    }

    #[test]
    fn test_jittered_delay_never_exceeds_max_backoff() {
        let policy = RetryPolicy::new(6, Duration::from_secs(1), Duration::from_secs(8))
            .with_jitter(1.0);
        for attempt in 1..=6 {
            for _ in 0..200 {
                let delay = policy.should_retry(attempt, &transient()).delay;
                assert!(delay <= Duration::from_secs(8), "attempt {attempt}: {delay:?}");
            }
        }
        // Jitter below the cap still applies at the ceiling.
        let policy = RetryPolicy::new(3, Duration::from_secs(8), Duration::from_secs(8));
        for _ in 0..200 {
            let delay = policy.should_retry(1, &transient()).delay;
            assert!(delay >= Duration::from_millis(6400), "{delay:?}");
            assert!(delay <= Duration::from_secs(8), "{delay:?}");
        }
    }

    #[test]
    fn test_retry_state_never_exceeds_max_attempts() {
        let policy = policy();
        let mut state = RetryState::new(&policy);
        for _ in 0..10 {
            state.record_failure(&transient());
        }
        assert_eq!(state.attempts(), policy.max_attempts());
    }

    #[test]
    fn test_max_backoff_not_below_min() {
        let policy = RetryPolicy::new(3, Duration::from_secs(5), Duration::from_secs(1));
        assert_eq!(policy.base_delay(1), Duration::from_secs(5));
        assert_eq!(policy.base_delay(3), Duration::from_secs(5));
    }
}
