//! Check interface and registry.
//!
//! A check is a named unit of validation logic. The pipeline decides when it
//! runs, in which environment, under which timeout; the check only inspects
//! the cluster through its [`CheckContext`] and returns a [`CheckVerdict`].
//! Returning `Err` marks the check `error` with the error's kind.

pub mod cluster;
pub mod environment;
pub mod manifests;
pub mod workloads;

use crate::cluster::ClusterClient;
use crate::environment::TestEnvironment;
use crate::resilience::Resilience;
use common::error::ValidationError;
use common::types::{CheckStatus, Phase, RunId};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// What a check concluded.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckVerdict {
    pub status: CheckStatus,
    pub message: String,
    pub details: Map<String, Value>,
}

impl CheckVerdict {
    fn with_status(status: CheckStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            details: Map::new(),
        }
    }

    #[must_use]
    pub fn pass(message: impl Into<String>) -> Self {
        Self::with_status(CheckStatus::Pass, message)
    }

    #[must_use]
    pub fn fail(message: impl Into<String>) -> Self {
        Self::with_status(CheckStatus::Fail, message)
    }

    #[must_use]
    pub fn skipped(message: impl Into<String>) -> Self {
        Self::with_status(CheckStatus::Skipped, message)
    }

    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}

/// Everything a running check may use.
#[derive(Clone)]
pub struct CheckContext {
    pub run_id: RunId,
    pub phase: Phase,
    pub check_name: String,
    /// Present when the check asked for an environment.
    pub environment: Option<Arc<TestEnvironment>>,
    /// Per-check parameters from pipeline configuration.
    pub params: Map<String, Value>,
    /// Run-level context parameters from the request.
    pub run_params: BTreeMap<String, String>,
    pub client: Arc<dyn ClusterClient>,
    pub resilience: Arc<Resilience>,
    /// Cancelled when the check times out or the run is abandoned.
    pub cancel: CancellationToken,
}

impl fmt::Debug for CheckContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckContext")
            .field("run_id", &self.run_id)
            .field("phase", &self.phase)
            .field("check_name", &self.check_name)
            .field("environment", &self.environment)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

impl CheckContext {
    /// String parameter, falling back to the run-level parameter of the
    /// same name.
    #[must_use]
    pub fn param_str(&self, key: &str) -> Option<String> {
        match self.params.get(key) {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            Some(Value::Bool(b)) => Some(b.to_string()),
            _ => self.run_params.get(key).cloned(),
        }
    }

    /// List-of-strings parameter. A single string is treated as a list of one.
    #[must_use]
    pub fn param_strings(&self, key: &str) -> Vec<String> {
        match self.params.get(key) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(ToString::to_string)
                .collect(),
            Some(Value::String(s)) => vec![s.clone()],
            _ => self
                .run_params
                .get(key)
                .map(|s| {
                    s.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(ToString::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        }
    }

    #[must_use]
    pub fn param_u64(&self, key: &str) -> Option<u64> {
        match self.params.get(key) {
            Some(Value::Number(n)) => n.as_u64(),
            Some(Value::String(s)) => s.parse().ok(),
            _ => self.run_params.get(key).and_then(|s| s.parse().ok()),
        }
    }

    /// The check's environment.
    ///
    /// # Errors
    ///
    /// `Configuration` if the check was configured without one.
    pub fn environment(&self) -> Result<&Arc<TestEnvironment>, ValidationError> {
        self.environment.as_ref().ok_or_else(|| {
            ValidationError::Configuration(format!(
                "check {} needs an environment but none is configured",
                self.check_name
            ))
        })
    }
}

/// A unit of validation logic.
#[async_trait::async_trait]
pub trait Check: Send + Sync {
    /// One-line description for logs and reports.
    fn description(&self) -> &str {
        ""
    }

    /// Run the check.
    ///
    /// # Errors
    ///
    /// Any error that prevented the check from reaching a verdict.
    async fn execute(&self, ctx: &CheckContext) -> Result<CheckVerdict, ValidationError>;
}

/// Check implementations by registered name.
#[derive(Default, Clone)]
pub struct CheckRegistry {
    checks: HashMap<String, Arc<dyn Check>>,
}

impl fmt::Debug for CheckRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckRegistry")
            .field("checks", &self.names())
            .finish()
    }
}

impl CheckRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in checks.
    #[must_use]
    pub fn with_builtin_checks() -> Self {
        let mut registry = Self::new();
        registry.register(cluster::API_REACHABLE, Arc::new(cluster::ApiReachable));
        registry.register(cluster::NODE_CAPACITY, Arc::new(cluster::NodeCapacity));
        registry.register(
            workloads::DEPLOYMENTS_READY,
            Arc::new(workloads::DeploymentsReady),
        );
        registry.register(
            environment::PROVISIONING,
            Arc::new(environment::EnvironmentProvisioning),
        );
        registry.register(manifests::MANIFESTS_PARSE, Arc::new(manifests::ManifestsParse));
        registry
    }

    /// Register `check` under `name`, replacing any previous entry.
    pub fn register(&mut self, name: impl Into<String>, check: Arc<dyn Check>) {
        self.checks.insert(name.into(), check);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Check>> {
        self.checks.get(name).cloned()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.checks.contains_key(name)
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.checks.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry() {
        let registry = CheckRegistry::with_builtin_checks();
        assert_eq!(
            registry.names(),
            vec![
                "cluster.api-reachable".to_string(),
                "cluster.node-capacity".to_string(),
                "config.manifests-parse".to_string(),
                "environment.provisioning".to_string(),
                "services.deployments-ready".to_string(),
            ]
        );
        assert!(registry.get("nope").is_none());
    }

    #[test]
    fn test_verdict_builders() {
        let verdict = CheckVerdict::fail("2 deployments unready").with_detail("unready", 2);
        assert_eq!(verdict.status, CheckStatus::Fail);
        assert_eq!(verdict.details.get("unready"), Some(&Value::from(2)));
    }
}
