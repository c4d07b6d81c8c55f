//! Eventual consistency helpers for control-plane state transitions.
//!
//! Polls a condition with exponential backoff until it holds or a deadline
//! passes. Used for "namespace became Active" and "deleted object is gone".

use common::error::ValidationError;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Backoff bounds for a polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// Give up after this long.
    pub timeout: Duration,
    /// Delay before the second probe.
    pub initial_delay: Duration,
    /// Cap on any single delay.
    pub max_delay: Duration,
}

impl PollConfig {
    #[must_use]
    pub fn new(timeout: Duration, initial_delay: Duration) -> Self {
        Self {
            timeout,
            initial_delay,
            max_delay: initial_delay.saturating_mul(8),
        }
    }
}

/// Wait until `condition` returns `Ok(true)`.
///
/// Transient errors from the condition count as "not yet". Any other error
/// aborts polling and is returned as is. When the deadline passes the result
/// is `ValidationError::Timeout` naming `operation`.
///
/// Uses exponential backoff with the following strategy:
/// - Initial delay: `config.initial_delay`
/// - Exponential multiplier: 2x, capped at `config.max_delay`
/// - Final delay capped at the remaining time
pub async fn poll_until<F, Fut>(
    operation: &str,
    config: PollConfig,
    mut condition: F,
) -> Result<(), ValidationError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, ValidationError>>,
{
    let start = Instant::now();
    let mut delay = config.initial_delay;

    loop {
        match condition().await {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(e) if e.is_retryable() => {}
            Err(e) => return Err(e),
        }

        let elapsed = start.elapsed();
        if elapsed >= config.timeout {
            return Err(ValidationError::timeout(operation, elapsed));
        }

        // Cap delay at remaining time
        let remaining = config.timeout.saturating_sub(elapsed);
        sleep(delay.min(remaining)).await;

        delay = delay.saturating_mul(2).min(config.max_delay);
    }
}
