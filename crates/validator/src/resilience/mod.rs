//! Protection for calls into the cluster client.
//!
//! - `retry` - capped exponential backoff decisions
//! - `circuit_breaker` - per-operation failure-rate gates
//! - `eventual` - polling for eventually-consistent state
//!
//! [`Resilience`] combines the first two: every attempt is gated by the
//! operation's breaker, transient failures are retried per the policy, and
//! exhaustion surfaces as `RetryExhausted`.

pub mod circuit_breaker;
pub mod eventual;
pub mod retry;

pub use circuit_breaker::{BreakerConfig, BreakerMode, BreakerRegistry, CircuitBreaker};
pub use eventual::{poll_until, PollConfig};
pub use retry::{RetryDecision, RetryPolicy, RetryState};

use crate::cluster::ClusterError;
use crate::observability::metrics;
use common::error::ValidationError;
use std::future::Future;
use tracing::{debug, warn};

/// Retry policy plus breakers, shared by everything in one run.
#[derive(Debug, Default)]
pub struct Resilience {
    retry: RetryPolicy,
    breakers: BreakerRegistry,
}

impl Resilience {
    #[must_use]
    pub fn new(retry: RetryPolicy, breaker_config: BreakerConfig) -> Self {
        Self {
            retry,
            breakers: BreakerRegistry::new(breaker_config),
        }
    }

    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    #[must_use]
    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    /// Run `call` under the breaker for `operation` with retries.
    ///
    /// Only transient failures count against the breaker; a permanent error
    /// means the control plane answered and is returned immediately.
    pub async fn call<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, ValidationError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ClusterError>>,
    {
        let breaker = self.breakers.get(operation);
        let mut state = RetryState::new(&self.retry);

        loop {
            if !breaker.can_proceed() {
                debug!(
                    target: "validator.retry",
                    operation = operation,
                    "Circuit open, failing fast"
                );
                return Err(ValidationError::CircuitOpen {
                    operation: operation.to_string(),
                });
            }

            let err: ValidationError = match call().await {
                Ok(value) => {
                    breaker.record_success();
                    return Ok(value);
                }
                Err(e) => e.into(),
            };

            if !err.is_retryable() {
                return Err(err);
            }

            breaker.record_failure();
            let decision = state.record_failure(&err);
            if !decision.retry {
                warn!(
                    target: "validator.retry",
                    operation = operation,
                    attempts = state.attempts(),
                    error = %err,
                    "Retries exhausted"
                );
                return Err(ValidationError::RetryExhausted {
                    operation: operation.to_string(),
                    attempts: state.attempts(),
                    last_error: Box::new(err),
                });
            }

            metrics::record_retry(operation);
            debug!(
                target: "validator.retry",
                operation = operation,
                attempt = state.attempts(),
                delay_ms = u64::try_from(decision.delay.as_millis()).unwrap_or(u64::MAX),
                error = %err,
                "Transient failure, retrying"
            );
            tokio::time::sleep(decision.delay).await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::error::ErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn resilience(threshold: usize) -> Resilience {
        Resilience::new(
            RetryPolicy::new(3, Duration::from_secs(1), Duration::from_secs(8)).with_jitter(0.0),
            BreakerConfig {
                failure_threshold: threshold,
                window: Duration::from_secs(60),
                reset_timeout: Duration::from_secs(30),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_then_success() {
        let resilience = resilience(10);
        let calls = AtomicU32::new(0);

        let result = resilience
            .call("get", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(ClusterError::Unavailable("503".to_string()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fourth_failure_is_retry_exhausted() {
        let resilience = resilience(10);
        let calls = AtomicU32::new(0);
        let start = tokio::time::Instant::now();

        let err = resilience
            .call("create", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(ClusterError::Timeout("i/o timeout".to_string())) }
            })
            .await
            .expect_err("Should exhaust retries");

        assert_eq!(err.kind(), ErrorKind::RetryExhausted);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        // 1s + 2s + 4s of backoff before the fourth failure
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(7), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(8), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_is_not_retried() {
        let resilience = resilience(10);
        let calls = AtomicU32::new(0);

        let err = resilience
            .call("create", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(ClusterError::Forbidden("rbac".to_string())) }
            })
            .await
            .expect_err("Should fail");

        assert_eq!(err.kind(), ErrorKind::Permanent);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(resilience.breakers().get("create").recent_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_fails_fast() {
        let resilience = resilience(2);
        let calls = AtomicU32::new(0);

        let err = resilience
            .call("delete", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(ClusterError::Unavailable("apiserver overloaded".to_string())) }
            })
            .await
            .expect_err("Should fail");

        // Second failure opens the breaker, the retry after it fails fast.
        assert_eq!(err.kind(), ErrorKind::CircuitOpen);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let err = resilience
            .call("delete", || async { Ok::<_, ClusterError>(()) })
            .await
            .expect_err("Breaker still open");
        assert_eq!(err.kind(), ErrorKind::CircuitOpen);
    }
}
