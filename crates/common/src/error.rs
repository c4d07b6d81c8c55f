//! Validation error taxonomy shared across Deploy Validator components.
//!
//! Every failure surfaced by the engine carries exactly one [`ErrorKind`].
//! Propagation rules:
//!
//! - `Transient` is recovered by the retry policy and only escapes as
//!   `RetryExhausted`.
//! - `Permanent` and `Configuration` fail the enclosing check or run.
//! - `Timeout` becomes a terminal check result but never blocks teardown.
//! - `CleanupDegraded` is reported as a warning, never as a failure.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Serializable classification of a [`ValidationError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Retryable: network blips, propagation races.
    Transient,
    /// Non-retryable: malformed request, authorization failure.
    Permanent,
    /// An operation or a whole check exceeded its bound.
    Timeout,
    /// A transient error persisted past the configured attempts.
    RetryExhausted,
    /// Fast-fail because the protecting circuit breaker is open.
    CircuitOpen,
    /// Invalid phase or check wiring. Fatal at startup.
    Configuration,
    /// Teardown only succeeded via forced finalizer removal.
    CleanupDegraded,
}

impl ErrorKind {
    /// Stable label used in logs, metrics, and reports.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Timeout => "timeout",
            ErrorKind::RetryExhausted => "retry_exhausted",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::Configuration => "configuration",
            ErrorKind::CleanupDegraded => "cleanup_degraded",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced by the validation engine.
#[derive(Error, Debug, Clone)]
pub enum ValidationError {
    /// Retryable failure of an external call.
    #[error("Transient error: {0}")]
    Transient(String),

    /// Non-retryable failure of an external call.
    #[error("Permanent error: {0}")]
    Permanent(String),

    /// Operation exceeded its time bound.
    #[error("Timed out after {elapsed:?}: {operation}")]
    Timeout { operation: String, elapsed: Duration },

    /// Transient failures persisted past the retry budget.
    #[error("Retries exhausted after {attempts} attempts for {operation}: {last_error}")]
    RetryExhausted {
        operation: String,
        attempts: u32,
        last_error: Box<ValidationError>,
    },

    /// Call rejected without being attempted.
    #[error("Circuit open for {operation}")]
    CircuitOpen { operation: String },

    /// Invalid configuration or wiring.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Cleanup needed forced finalizer removal.
    #[error("Cleanup degraded: {0}")]
    CleanupDegraded(String),
}

impl ValidationError {
    /// Returns the taxonomy classification of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            ValidationError::Transient(_) => ErrorKind::Transient,
            ValidationError::Permanent(_) => ErrorKind::Permanent,
            ValidationError::Timeout { .. } => ErrorKind::Timeout,
            ValidationError::RetryExhausted { .. } => ErrorKind::RetryExhausted,
            ValidationError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            ValidationError::Configuration(_) => ErrorKind::Configuration,
            ValidationError::CleanupDegraded(_) => ErrorKind::CleanupDegraded,
        }
    }

    /// Whether the retry policy may attempt the call again.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, ValidationError::Transient(_))
    }

    /// Shorthand for a timeout error.
    #[must_use]
    pub fn timeout(operation: impl Into<String>, elapsed: Duration) -> Self {
        ValidationError::Timeout {
            operation: operation.into(),
            elapsed,
        }
    }
}

/// Result type alias using `ValidationError`
pub type Result<T> = std::result::Result<T, ValidationError>;
