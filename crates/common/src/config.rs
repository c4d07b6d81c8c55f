//! Common configuration types for Deploy Validator components.

use serde::{Deserialize, Serialize};

/// Default log filter when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "validator=info,deploy_validator=info";

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log filter directive (e.g. `validator=debug`)
    pub log_level: String,
    /// Enable JSON-formatted logs
    pub json_logs: bool,
    /// Where to write the Prometheus exposition text after a run
    pub metrics_path: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: DEFAULT_LOG_FILTER.to_string(),
            json_logs: false,
            metrics_path: None,
        }
    }
}
