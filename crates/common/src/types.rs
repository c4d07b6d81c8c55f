//! Common data types for Deploy Validator components.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for a validation run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Create a new random run ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a test environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EnvironmentId(pub Uuid);

impl EnvironmentId {
    /// Create a new random environment ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Short collision-resistant suffix for cluster object names.
    #[must_use]
    pub fn short(&self) -> String {
        self.0.simple().to_string().chars().take(8).collect()
    }
}

impl Default for EnvironmentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EnvironmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Named validation stage.
///
/// Phases are independently invocable; CI may run each as a separate process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    PreDeployment,
    PostDeployment,
    Continuous,
}

impl Phase {
    /// All phases in their nominal order.
    pub const ALL: [Phase; 3] = [
        Phase::PreDeployment,
        Phase::PostDeployment,
        Phase::Continuous,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::PreDeployment => "pre-deployment",
            Phase::PostDeployment => "post-deployment",
            Phase::Continuous => "continuous",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pre-deployment" => Ok(Phase::PreDeployment),
            "post-deployment" => Ok(Phase::PostDeployment),
            "continuous" => Ok(Phase::Continuous),
            other => Err(format!("unknown phase: {other}")),
        }
    }
}

/// Terminal outcome of a single check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    /// Assertion held.
    Pass,
    /// Assertion deliberately failed.
    Fail,
    /// Infrastructure or unrecoverable error while running the check.
    Error,
    /// Not run (missing prerequisite or short-circuited by a blocking check).
    Skipped,
}

impl CheckStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            CheckStatus::Pass => "pass",
            CheckStatus::Fail => "fail",
            CheckStatus::Error => "error",
            CheckStatus::Skipped => "skipped",
        }
    }

    /// `Fail` or `Error`.
    #[must_use]
    pub fn is_failure(self) -> bool {
        matches!(self, CheckStatus::Fail | CheckStatus::Error)
    }
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Check-declared severity. Never inferred from status.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

impl Severity {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
        }
    }

    /// Whether a non-passing check of this severity fails the run.
    #[must_use]
    pub fn gates_run(self) -> bool {
        matches!(self, Severity::Critical | Severity::High)
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Overall status of a run. Always agrees with the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Pass,
    Fail,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_round_trips_through_str() {
        for phase in Phase::ALL {
            assert_eq!(phase.as_str().parse::<Phase>().unwrap(), phase);
        }
        assert!("deploy".parse::<Phase>().is_err());
    }

    #[test]
    fn test_phase_serde_is_kebab_case() {
        let json = serde_json::to_string(&Phase::PostDeployment).unwrap();
        assert_eq!(json, "\"post-deployment\"");
    }

    #[test]
    fn test_severity_gates() {
        assert!(Severity::Critical.gates_run());
        assert!(Severity::High.gates_run());
        assert!(!Severity::Medium.gates_run());
        assert!(!Severity::Low.gates_run());
    }

    #[test]
    fn test_environment_short_id_is_eight_hex_chars() {
        let id = EnvironmentId::new();
        let short = id.short();
        assert_eq!(short.len(), 8);
        assert!(short.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_failure_statuses() {
        assert!(CheckStatus::Fail.is_failure());
        assert!(CheckStatus::Error.is_failure());
        assert!(!CheckStatus::Skipped.is_failure());
        assert!(!CheckStatus::Pass.is_failure());
    }
}
