//! Per-operation circuit breaker over a trailing failure window.
//!
//! - `Closed`: calls proceed; failures are timestamped.
//! - `Open`: entered when failures within `window` reach `threshold`; calls
//!   fail fast until `reset_timeout` has elapsed since opening.
//! - `HalfOpen`: the first `can_proceed` after `reset_timeout` admits calls;
//!   one success closes the breaker, one failure re-opens it.
//!
//! Time is read from `tokio::time::Instant` so tests can pause the clock.

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Default failures within the window before opening.
pub const DEFAULT_FAILURE_THRESHOLD: usize = 5;

/// Default trailing window for counting failures.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Default time an open breaker waits before probing.
pub const DEFAULT_RESET_TIMEOUT: Duration = Duration::from_secs(30);

/// Breaker mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BreakerMode {
    Closed,
    Open,
    HalfOpen,
}

/// Breaker tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    pub failure_threshold: usize,
    pub window: Duration,
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            window: DEFAULT_WINDOW,
            reset_timeout: DEFAULT_RESET_TIMEOUT,
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    mode: BreakerMode,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
}

/// Failure-rate gate for one protected operation.
#[derive(Debug)]
pub struct CircuitBreaker {
    operation: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(operation: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            operation: operation.into(),
            config,
            inner: Mutex::new(BreakerInner {
                mode: BreakerMode::Closed,
                failures: VecDeque::new(),
                opened_at: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn prune(&self, inner: &mut BreakerInner, now: Instant) {
        while let Some(oldest) = inner.failures.front() {
            if now.saturating_duration_since(*oldest) >= self.config.window {
                inner.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn open(&self, inner: &mut BreakerInner, now: Instant) {
        inner.mode = BreakerMode::Open;
        inner.opened_at = Some(now);
        crate::observability::metrics::record_breaker_opened(&self.operation);
        warn!(
            target: "validator.breaker",
            operation = %self.operation,
            failures = inner.failures.len(),
            "Circuit breaker opened"
        );
    }

    /// Whether a call may be attempted now.
    pub fn can_proceed(&self) -> bool {
        let now = Instant::now();
        let mut inner = self.lock();
        match inner.mode {
            BreakerMode::Closed | BreakerMode::HalfOpen => true,
            BreakerMode::Open => {
                let elapsed = inner
                    .opened_at
                    .map_or(self.config.reset_timeout, |at| now.saturating_duration_since(at));
                if elapsed >= self.config.reset_timeout {
                    inner.mode = BreakerMode::HalfOpen;
                    info!(
                        target: "validator.breaker",
                        operation = %self.operation,
                        "Circuit breaker half-open, admitting probe"
                    );
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.mode == BreakerMode::HalfOpen {
            inner.mode = BreakerMode::Closed;
            inner.opened_at = None;
            inner.failures.clear();
            info!(
                target: "validator.breaker",
                operation = %self.operation,
                "Circuit breaker closed"
            );
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut inner = self.lock();
        inner.failures.push_back(now);
        self.prune(&mut inner, now);
        match inner.mode {
            BreakerMode::HalfOpen => self.open(&mut inner, now),
            BreakerMode::Closed => {
                if inner.failures.len() >= self.config.failure_threshold {
                    self.open(&mut inner, now);
                }
            }
            BreakerMode::Open => {}
        }
    }

    /// Operator override: close the breaker and forget all failures.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.mode = BreakerMode::Closed;
        inner.opened_at = None;
        inner.failures.clear();
    }

    #[must_use]
    pub fn mode(&self) -> BreakerMode {
        self.lock().mode
    }

    /// Failures inside the trailing window.
    #[must_use]
    pub fn recent_failures(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.lock();
        self.prune(&mut inner, now);
        inner.failures.len()
    }

    #[must_use]
    pub fn operation(&self) -> &str {
        &self.operation
    }
}

/// Lazily-created breakers keyed by operation name.
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Breaker for `operation`, created on first use.
    pub fn get(&self, operation: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            breakers
                .entry(operation.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(operation, self.config))),
        )
    }

    /// Reset every breaker.
    pub fn reset_all(&self) {
        let breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        for breaker in breakers.values() {
            breaker.reset();
        }
    }

    /// Current mode per operation, sorted by name.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(String, BreakerMode)> {
        let breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        let mut modes: Vec<_> = breakers
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.mode()))
            .collect();
        modes.sort_by(|a, b| a.0.cmp(&b.0));
        modes
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(
            "delete",
            BreakerConfig {
                failure_threshold: 3,
                window: Duration::from_secs(60),
                reset_timeout: Duration::from_secs(30),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_within_window() {
        let breaker = breaker();
        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.can_proceed());
        breaker.record_failure();
        assert_eq!(breaker.mode(), BreakerMode::Open);
        assert!(!breaker.can_proceed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sparse_failures_do_not_open() {
        let breaker = breaker();
        breaker.record_failure();
        tokio::time::advance(Duration::from_secs(40)).await;
        breaker.record_failure();
        tokio::time::advance(Duration::from_secs(40)).await;
        breaker.record_failure();
        assert_eq!(breaker.mode(), BreakerMode::Closed);
        assert_eq!(breaker.recent_failures(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_reset_timeout_then_success_closes() {
        let breaker = breaker();
        for _ in 0..3 {
            breaker.record_failure();
        }
        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(!breaker.can_proceed());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(breaker.can_proceed());
        assert_eq!(breaker.mode(), BreakerMode::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.mode(), BreakerMode::Closed);
        assert!(breaker.can_proceed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let breaker = breaker();
        for _ in 0..3 {
            breaker.record_failure();
        }
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(breaker.can_proceed());

        breaker.record_failure();
        assert_eq!(breaker.mode(), BreakerMode::Open);
        assert!(!breaker.can_proceed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_reset() {
        let breaker = breaker();
        for _ in 0..3 {
            breaker.record_failure();
        }
        breaker.reset();
        assert_eq!(breaker.mode(), BreakerMode::Closed);
        assert_eq!(breaker.recent_failures(), 0);
        assert!(breaker.can_proceed());
    }

    #[tokio::test]
    async fn test_registry_reuses_breakers_per_operation() {
        let registry = BreakerRegistry::new(BreakerConfig::default());
        let a = registry.get("create");
        let b = registry.get("create");
        let c = registry.get("delete");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));

        let snapshot = registry.snapshot();
        assert_eq!(
            snapshot,
            vec![
                ("create".to_string(), BreakerMode::Closed),
                ("delete".to_string(), BreakerMode::Closed)
            ]
        );
    }
}
