//! Pre-configured test data for validator testing.
//!
//! Provides:
//! - Configuration with short timeouts for paused-time tests
//! - A builder for check specs
//! - Pipeline and environment constructors

use common::types::{Phase, Severity};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use validator::capability::Capability;
use validator::cluster::ClusterClient;
use validator::config::{CheckSpec, EnvironmentMode, PipelineConfig, ValidatorConfig};
use validator::environment::{EnvironmentConfig, QuotaSpec, TestEnvironment};
use validator::resilience::{BreakerConfig, PollConfig, Resilience, RetryPolicy};
use validator::tracker::{CleanupConfig, ResourceTracker};

/// Validator configuration with short retry, readiness and deletion bounds.
#[must_use]
pub fn fast_config(phase: Phase) -> ValidatorConfig {
    ValidatorConfig {
        phase,
        max_parallelism: 4,
        run_timeout: Duration::from_secs(600),
        check_timeout: Duration::from_secs(60),
        max_retries: 2,
        min_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(40),
        jitter: 0.0,
        ready_timeout: Duration::from_secs(5),
        ready_poll_interval: Duration::from_millis(100),
        delete_timeout: Duration::from_secs(2),
        stall_timeout: Duration::from_secs(120),
        watchdog_interval: Duration::from_secs(1),
        ..ValidatorConfig::default()
    }
}

/// Retry policy and breakers matching [`fast_config`].
#[must_use]
pub fn fast_resilience() -> Arc<Resilience> {
    Arc::new(Resilience::new(
        RetryPolicy::new(2, Duration::from_millis(10), Duration::from_millis(40)).with_jitter(0.0),
        BreakerConfig::default(),
    ))
}

#[must_use]
pub fn fast_environment_config() -> EnvironmentConfig {
    EnvironmentConfig {
        ready: PollConfig::new(Duration::from_secs(5), Duration::from_millis(100)),
        ..EnvironmentConfig::default()
    }
}

#[must_use]
pub fn fast_cleanup_config() -> CleanupConfig {
    CleanupConfig {
        delete_poll: PollConfig::new(Duration::from_secs(2), Duration::from_millis(100)),
    }
}

/// A tracker and a fresh environment over `client`.
#[must_use]
pub fn test_environment(
    client: Arc<dyn ClusterClient>,
    quota: QuotaSpec,
) -> (Arc<TestEnvironment>, Arc<ResourceTracker>) {
    let resilience = fast_resilience();
    let tracker = Arc::new(ResourceTracker::new(
        Arc::clone(&client),
        Arc::clone(&resilience),
        fast_cleanup_config(),
    ));
    let env = TestEnvironment::new(
        &fast_environment_config(),
        quota,
        client,
        resilience,
        Arc::clone(&tracker),
    );
    (Arc::new(env), tracker)
}

/// A quota with CPU, memory and pod limits.
#[must_use]
pub fn small_quota() -> QuotaSpec {
    QuotaSpec {
        cpu: Some("2".to_string()),
        memory: Some("4Gi".to_string()),
        pods: Some(10),
        extra: BTreeMap::new(),
    }
}

/// A pipeline with one phase.
#[must_use]
pub fn pipeline(phase: Phase, checks: Vec<CheckSpec>) -> PipelineConfig {
    let mut phases = BTreeMap::new();
    phases.insert(phase, checks);
    PipelineConfig { phases }
}

/// Builder for a [`CheckSpec`].
#[derive(Debug, Clone)]
pub struct TestCheck {
    spec: CheckSpec,
}

impl TestCheck {
    /// A check named `name`, implemented by the registry entry of the same
    /// name.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            spec: CheckSpec::named(name),
        }
    }

    /// Use the registry entry `check` instead of the check's own name.
    #[must_use]
    pub fn using(mut self, check: &str) -> Self {
        self.spec.check = Some(check.to_string());
        self
    }

    #[must_use]
    pub fn severity(mut self, severity: Severity) -> Self {
        self.spec.severity = severity;
        self
    }

    #[must_use]
    pub fn blocking(mut self) -> Self {
        self.spec.blocking = true;
        self
    }

    #[must_use]
    pub fn timeout_seconds(mut self, seconds: u64) -> Self {
        self.spec.timeout_seconds = Some(seconds);
        self
    }

    #[must_use]
    pub fn requires(mut self, capability: Capability) -> Self {
        self.spec.requires.push(capability);
        self
    }

    #[must_use]
    pub fn dedicated(mut self) -> Self {
        self.spec.environment = EnvironmentMode::Dedicated;
        self
    }

    #[must_use]
    pub fn shared(mut self, group: &str) -> Self {
        self.spec.environment = EnvironmentMode::Shared(group.to_string());
        self
    }

    #[must_use]
    pub fn quota(mut self, quota: QuotaSpec) -> Self {
        self.spec.quota = Some(quota);
        self
    }

    #[must_use]
    pub fn param(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.spec.params.insert(key.to_string(), value.into());
        self
    }

    #[must_use]
    pub fn build(self) -> CheckSpec {
        self.spec
    }
}
