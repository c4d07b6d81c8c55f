//! Validator configuration.
//!
//! Two layers:
//!
//! - [`ValidatorConfig`]: process settings loaded from `VALIDATOR_*`
//!   environment variables, with defaults for everything but the phase and
//!   the pipeline file.
//! - [`PipelineConfig`]: the phase → ordered check list mapping, read from a
//!   JSON file and validated against the check registry before anything runs.

use crate::capability::Capability;
use crate::checks::CheckRegistry;
use crate::environment::{EnvironmentConfig, QuotaSpec, DEFAULT_NAMESPACE_PREFIX};
use crate::environment::{DEFAULT_READY_POLL_INTERVAL, DEFAULT_READY_TIMEOUT};
use crate::progress::{DEFAULT_STALL_TIMEOUT, DEFAULT_WATCHDOG_INTERVAL};
use crate::resilience::circuit_breaker::{
    DEFAULT_FAILURE_THRESHOLD, DEFAULT_RESET_TIMEOUT, DEFAULT_WINDOW,
};
use crate::resilience::retry::{
    DEFAULT_JITTER, DEFAULT_MAX_BACKOFF, DEFAULT_MAX_RETRIES, DEFAULT_MIN_BACKOFF,
};
use crate::resilience::{BreakerConfig, PollConfig, RetryPolicy};
use crate::tracker::{CleanupConfig, DEFAULT_DELETE_POLL_INTERVAL, DEFAULT_DELETE_TIMEOUT};
use common::config::{ObservabilityConfig, DEFAULT_LOG_FILTER};
use common::error::ValidationError;
use common::types::{Phase, Severity};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default number of checks running at once.
pub const DEFAULT_MAX_PARALLELISM: usize = 4;

/// Default bound on a whole run.
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(1800);

/// Default bound on one check, environment setup included.
pub const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(300);

/// Default bound on one kubectl invocation.
pub const DEFAULT_KUBECTL_TIMEOUT: Duration = Duration::from_secs(60);

/// Default kubectl binary.
pub const DEFAULT_KUBECTL: &str = "kubectl";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {name}: {reason}")]
    InvalidValue { name: String, reason: String },

    #[error("Failed to read pipeline configuration {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Failed to parse pipeline configuration: {0}")]
    Parse(String),

    #[error("No checks configured for phase {0}")]
    MissingPhase(Phase),

    #[error("Unknown check '{check}' referenced by {name} in phase {phase}")]
    UnknownCheck {
        phase: Phase,
        name: String,
        check: String,
    },

    #[error("Duplicate check name '{name}' in phase {phase}")]
    DuplicateCheck { phase: Phase, name: String },

    #[error("Invalid check '{name}' in phase {phase}: {reason}")]
    InvalidCheck {
        phase: Phase,
        name: String,
        reason: String,
    },
}

impl From<ConfigError> for ValidationError {
    fn from(err: ConfigError) -> Self {
        ValidationError::Configuration(err.to_string())
    }
}

/// Process configuration.
#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    /// Phase to run.
    pub phase: Phase,
    /// Run-level parameters passed to every check.
    pub context_parameters: BTreeMap<String, String>,
    /// Pipeline configuration file.
    pub pipeline_path: PathBuf,

    pub max_parallelism: usize,
    pub run_timeout: Duration,
    /// Applied to checks that do not set `timeout_seconds`.
    pub check_timeout: Duration,

    pub max_retries: u32,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    /// Fraction of the base delay, in `[0, 1]`.
    pub jitter: f64,

    pub breaker_threshold: usize,
    pub breaker_window: Duration,
    pub breaker_reset: Duration,

    pub namespace_prefix: String,
    pub ready_timeout: Duration,
    pub ready_poll_interval: Duration,
    pub delete_timeout: Duration,

    pub stall_timeout: Duration,
    pub watchdog_interval: Duration,

    /// Also write the JSON report here.
    pub report_path: Option<PathBuf>,
    pub kubectl: String,
    pub kubectl_timeout: Duration,
    pub observability: ObservabilityConfig,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            phase: Phase::PreDeployment,
            context_parameters: BTreeMap::new(),
            pipeline_path: PathBuf::from("validator-pipeline.json"),
            max_parallelism: DEFAULT_MAX_PARALLELISM,
            run_timeout: DEFAULT_RUN_TIMEOUT,
            check_timeout: DEFAULT_CHECK_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            min_backoff: DEFAULT_MIN_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            jitter: DEFAULT_JITTER,
            breaker_threshold: DEFAULT_FAILURE_THRESHOLD,
            breaker_window: DEFAULT_WINDOW,
            breaker_reset: DEFAULT_RESET_TIMEOUT,
            namespace_prefix: DEFAULT_NAMESPACE_PREFIX.to_string(),
            ready_timeout: DEFAULT_READY_TIMEOUT,
            ready_poll_interval: DEFAULT_READY_POLL_INTERVAL,
            delete_timeout: DEFAULT_DELETE_TIMEOUT,
            stall_timeout: DEFAULT_STALL_TIMEOUT,
            watchdog_interval: DEFAULT_WATCHDOG_INTERVAL,
            report_path: None,
            kubectl: DEFAULT_KUBECTL.to_string(),
            kubectl_timeout: DEFAULT_KUBECTL_TIMEOUT,
            observability: ObservabilityConfig::default(),
        }
    }
}

fn parse_var<T>(vars: &HashMap<String, String>, name: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match vars.get(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                name: name.to_string(),
                reason: format!("got '{raw}': {e}"),
            }),
    }
}

/// Parse a strictly positive integer.
fn positive(vars: &HashMap<String, String>, name: &str) -> Result<Option<u64>, ConfigError> {
    match parse_var::<u64>(vars, name)? {
        Some(0) => Err(ConfigError::InvalidValue {
            name: name.to_string(),
            reason: "must be greater than 0".to_string(),
        }),
        other => Ok(other),
    }
}

fn seconds(
    vars: &HashMap<String, String>,
    name: &str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    Ok(positive(vars, name)?.map_or(default, Duration::from_secs))
}

fn millis(
    vars: &HashMap<String, String>,
    name: &str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    Ok(positive(vars, name)?.map_or(default, Duration::from_millis))
}

/// Parse `key=value` pairs separated by commas.
fn parse_parameters(raw: &str) -> Result<BTreeMap<String, String>, ConfigError> {
    let mut params = BTreeMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').ok_or_else(|| ConfigError::InvalidValue {
            name: "VALIDATOR_PARAMS".to_string(),
            reason: format!("'{pair}' is not key=value"),
        })?;
        params.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(params)
}

/// Namespace prefixes must leave room for the `-xxxxxxxx` suffix within the
/// 63-character DNS label limit.
fn validate_prefix(prefix: &str) -> Result<(), ConfigError> {
    let valid = !prefix.is_empty()
        && prefix.len() <= 40
        && prefix
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !prefix.starts_with('-')
        && !prefix.ends_with('-');
    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue {
            name: "VALIDATOR_NAMESPACE_PREFIX".to_string(),
            reason: format!(
                "'{prefix}' must be 1-40 lowercase alphanumerics or '-', not starting or ending with '-'"
            ),
        })
    }
}

impl ValidatorConfig {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// See [`ValidatorConfig::from_vars`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    ///
    /// # Errors
    ///
    /// `MissingEnvVar` when `VALIDATOR_PHASE` or `VALIDATOR_PIPELINE_CONFIG`
    /// is unset; `InvalidValue` for anything unparseable or out of range.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let phase = vars
            .get("VALIDATOR_PHASE")
            .ok_or_else(|| ConfigError::MissingEnvVar("VALIDATOR_PHASE".to_string()))?
            .parse::<Phase>()
            .map_err(|reason| ConfigError::InvalidValue {
                name: "VALIDATOR_PHASE".to_string(),
                reason,
            })?;

        let pipeline_path = vars
            .get("VALIDATOR_PIPELINE_CONFIG")
            .map(PathBuf::from)
            .ok_or_else(|| ConfigError::MissingEnvVar("VALIDATOR_PIPELINE_CONFIG".to_string()))?;

        let context_parameters = match vars.get("VALIDATOR_PARAMS") {
            Some(raw) => parse_parameters(raw)?,
            None => BTreeMap::new(),
        };

        let max_parallelism = positive(vars, "VALIDATOR_MAX_PARALLELISM")?
            .map_or(Ok(defaults.max_parallelism), |n| {
                usize::try_from(n).map_err(|e| ConfigError::InvalidValue {
                    name: "VALIDATOR_MAX_PARALLELISM".to_string(),
                    reason: e.to_string(),
                })
            })?;

        let max_retries = parse_var::<u32>(vars, "VALIDATOR_MAX_RETRIES")?.unwrap_or(defaults.max_retries);
        let min_backoff = millis(vars, "VALIDATOR_MIN_BACKOFF_MS", defaults.min_backoff)?;
        let max_backoff = millis(vars, "VALIDATOR_MAX_BACKOFF_MS", defaults.max_backoff)?;
        if max_backoff < min_backoff {
            return Err(ConfigError::InvalidValue {
                name: "VALIDATOR_MAX_BACKOFF_MS".to_string(),
                reason: format!(
                    "{}ms is below VALIDATOR_MIN_BACKOFF_MS {}ms",
                    max_backoff.as_millis(),
                    min_backoff.as_millis()
                ),
            });
        }

        let jitter = parse_var::<f64>(vars, "VALIDATOR_JITTER")?.unwrap_or(defaults.jitter);
        if !(0.0..=1.0).contains(&jitter) {
            return Err(ConfigError::InvalidValue {
                name: "VALIDATOR_JITTER".to_string(),
                reason: format!("{jitter} is outside [0, 1]"),
            });
        }

        let breaker_threshold = positive(vars, "VALIDATOR_BREAKER_THRESHOLD")?
            .map_or(Ok(defaults.breaker_threshold), |n| {
                usize::try_from(n).map_err(|e| ConfigError::InvalidValue {
                    name: "VALIDATOR_BREAKER_THRESHOLD".to_string(),
                    reason: e.to_string(),
                })
            })?;

        let namespace_prefix = vars
            .get("VALIDATOR_NAMESPACE_PREFIX")
            .cloned()
            .unwrap_or(defaults.namespace_prefix);
        validate_prefix(&namespace_prefix)?;

        let json_logs = parse_var::<bool>(vars, "VALIDATOR_JSON_LOGS")?.unwrap_or(false);
        let observability = ObservabilityConfig {
            log_level: vars
                .get("VALIDATOR_LOG_LEVEL")
                .cloned()
                .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string()),
            json_logs,
            metrics_path: vars.get("VALIDATOR_METRICS_PATH").cloned(),
        };

        Ok(Self {
            phase,
            context_parameters,
            pipeline_path,
            max_parallelism,
            run_timeout: seconds(vars, "VALIDATOR_RUN_TIMEOUT_SECONDS", defaults.run_timeout)?,
            check_timeout: seconds(vars, "VALIDATOR_CHECK_TIMEOUT_SECONDS", defaults.check_timeout)?,
            max_retries,
            min_backoff,
            max_backoff,
            jitter,
            breaker_threshold,
            breaker_window: seconds(vars, "VALIDATOR_BREAKER_WINDOW_SECONDS", defaults.breaker_window)?,
            breaker_reset: seconds(vars, "VALIDATOR_BREAKER_RESET_SECONDS", defaults.breaker_reset)?,
            namespace_prefix,
            ready_timeout: seconds(vars, "VALIDATOR_READY_TIMEOUT_SECONDS", defaults.ready_timeout)?,
            ready_poll_interval: millis(
                vars,
                "VALIDATOR_READY_POLL_INTERVAL_MS",
                defaults.ready_poll_interval,
            )?,
            delete_timeout: seconds(vars, "VALIDATOR_DELETE_TIMEOUT_SECONDS", defaults.delete_timeout)?,
            stall_timeout: seconds(vars, "VALIDATOR_STALL_TIMEOUT_SECONDS", defaults.stall_timeout)?,
            watchdog_interval: seconds(
                vars,
                "VALIDATOR_WATCHDOG_INTERVAL_SECONDS",
                defaults.watchdog_interval,
            )?,
            report_path: vars.get("VALIDATOR_REPORT_PATH").map(PathBuf::from),
            kubectl: vars
                .get("VALIDATOR_KUBECTL")
                .cloned()
                .unwrap_or(defaults.kubectl),
            kubectl_timeout: seconds(
                vars,
                "VALIDATOR_KUBECTL_TIMEOUT_SECONDS",
                defaults.kubectl_timeout,
            )?,
            observability,
        })
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.min_backoff, self.max_backoff).with_jitter(self.jitter)
    }

    #[must_use]
    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.breaker_threshold,
            window: self.breaker_window,
            reset_timeout: self.breaker_reset,
        }
    }

    #[must_use]
    pub fn environment_config(&self) -> EnvironmentConfig {
        EnvironmentConfig {
            namespace_prefix: self.namespace_prefix.clone(),
            ready: PollConfig::new(self.ready_timeout, self.ready_poll_interval),
            default_quota: QuotaSpec::default(),
        }
    }

    #[must_use]
    pub fn cleanup_config(&self) -> CleanupConfig {
        CleanupConfig {
            delete_poll: PollConfig::new(self.delete_timeout, DEFAULT_DELETE_POLL_INTERVAL),
        }
    }
}

/// Where a check runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum EnvironmentMode {
    /// No environment; the check only reads the cluster.
    #[default]
    None,
    /// A fresh environment for this check alone.
    Dedicated,
    /// One environment shared by every check naming the same group.
    /// Checks in a group run one at a time, in configuration order.
    Shared(String),
}

impl fmt::Display for EnvironmentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvironmentMode::None => f.write_str("none"),
            EnvironmentMode::Dedicated => f.write_str("dedicated"),
            EnvironmentMode::Shared(group) => write!(f, "shared:{group}"),
        }
    }
}

impl TryFrom<String> for EnvironmentMode {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "none" => Ok(EnvironmentMode::None),
            "dedicated" => Ok(EnvironmentMode::Dedicated),
            other => match other.strip_prefix("shared:") {
                Some(group) if !group.trim().is_empty() => {
                    Ok(EnvironmentMode::Shared(group.trim().to_string()))
                }
                _ => Err(format!(
                    "environment must be none, dedicated, or shared:<group>, got '{other}'"
                )),
            },
        }
    }
}

impl From<EnvironmentMode> for String {
    fn from(value: EnvironmentMode) -> Self {
        value.to_string()
    }
}

/// One configured check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckSpec {
    /// Unique name within the phase; the first `.`-separated segment is its
    /// component in recommendations.
    pub name: String,
    /// Registered implementation; defaults to `name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check: Option<String>,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub blocking: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub requires: Vec<Capability>,
    #[serde(default)]
    pub environment: EnvironmentMode,
    /// Quota overrides for this check's environment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota: Option<QuotaSpec>,
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

impl CheckSpec {
    /// A spec with defaults for everything but the name.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            check: None,
            severity: Severity::default(),
            blocking: false,
            timeout_seconds: None,
            requires: Vec::new(),
            environment: EnvironmentMode::None,
            quota: None,
            params: serde_json::Map::new(),
        }
    }

    /// Name of the registered implementation.
    #[must_use]
    pub fn implementation(&self) -> &str {
        self.check.as_deref().unwrap_or(&self.name)
    }
}

/// Phase → ordered check list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    #[serde(default)]
    pub phases: BTreeMap<Phase, Vec<CheckSpec>>,
}

impl PipelineConfig {
    /// Parse pipeline configuration from JSON text.
    ///
    /// # Errors
    ///
    /// `ConfigError::Parse` for malformed JSON or unknown fields, including
    /// malformed capability and environment strings.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Read and parse a pipeline configuration file.
    ///
    /// # Errors
    ///
    /// `ConfigError::Io` if the file cannot be read, otherwise see
    /// [`PipelineConfig::from_json`].
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ConfigError::Io {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        Self::from_json(&text)
    }

    /// Checks configured for `phase`, validated against `registry`.
    ///
    /// # Errors
    ///
    /// - `MissingPhase` if the phase is not configured at all
    /// - `UnknownCheck` for names the registry does not know
    /// - `DuplicateCheck` for repeated names
    /// - `InvalidCheck` for zero timeouts or blank names
    pub fn checks_for(&self, phase: Phase, registry: &CheckRegistry) -> Result<&[CheckSpec], ConfigError> {
        let checks = self.phases.get(&phase).ok_or(ConfigError::MissingPhase(phase))?;
        let mut seen = HashSet::new();
        for spec in checks {
            if spec.name.trim().is_empty() {
                return Err(ConfigError::InvalidCheck {
                    phase,
                    name: spec.name.clone(),
                    reason: "name must not be blank".to_string(),
                });
            }
            if !seen.insert(spec.name.as_str()) {
                return Err(ConfigError::DuplicateCheck {
                    phase,
                    name: spec.name.clone(),
                });
            }
            if !registry.contains(spec.implementation()) {
                return Err(ConfigError::UnknownCheck {
                    phase,
                    name: spec.name.clone(),
                    check: spec.implementation().to_string(),
                });
            }
            if spec.timeout_seconds == Some(0) {
                return Err(ConfigError::InvalidCheck {
                    phase,
                    name: spec.name.clone(),
                    reason: "timeout_seconds must be greater than 0".to_string(),
                });
            }
        }
        Ok(checks)
    }
}
