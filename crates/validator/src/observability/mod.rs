//! Observability for the validator.
//!
//! - `metrics` - Prometheus metric definitions
//! - `logging` - tracing subscriber setup for the binary

pub mod logging;
pub mod metrics;
