//! Isolated test environments.
//!
//! A [`TestEnvironment`] owns one dedicated namespace (`{prefix}-{id}`) and
//! whatever is created inside it. Everything is registered with the shared
//! [`ResourceTracker`] before or as it is created, so teardown only has to
//! ask the tracker to clean up this environment's resources.
//!
//! Setup and teardown are serialized by a lifecycle lock: teardown never
//! starts while setup is in flight. Teardown is idempotent and runs even if
//! setup failed part-way.

use crate::capability::{missing_capabilities, Capability};
use crate::cluster::{ClusterClient, ClusterError, ObjectSpec, ResourceKind, ResourceRef};
use crate::observability::metrics;
use crate::progress::{ProgressHandle, ProgressStatus};
use crate::resilience::{poll_until, PollConfig, Resilience};
use crate::tracker::{CleanupReport, ResourceTracker, TrackedResource};
use common::error::ValidationError;
use common::types::EnvironmentId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{error, info, instrument, warn};

/// Default bound on waiting for the namespace to become active.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(120);

/// Default first delay between readiness probes.
pub const DEFAULT_READY_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Default namespace prefix.
pub const DEFAULT_NAMESPACE_PREFIX: &str = "validation";

/// Name of the quota object created in each environment.
pub const QUOTA_NAME: &str = "validation-quota";

/// Label carried by everything an environment creates.
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Label identifying the owning environment.
pub const ENVIRONMENT_LABEL: &str = "validator.dev/environment-id";

/// Environment lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentState {
    SettingUp,
    Ready,
    Failed,
    TearingDown,
    Closed,
}

impl fmt::Display for EnvironmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EnvironmentState::SettingUp => "setting_up",
            EnvironmentState::Ready => "ready",
            EnvironmentState::Failed => "failed",
            EnvironmentState::TearingDown => "tearing_down",
            EnvironmentState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Resource quota applied to an environment namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaSpec {
    /// CPU limit, e.g. `"2"` or `"1500m"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    /// Memory limit, e.g. `"4Gi"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pods: Option<u32>,
    /// Any other `hard` entries, passed through verbatim.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl QuotaSpec {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cpu.is_none() && self.memory.is_none() && self.pods.is_none() && self.extra.is_empty()
    }

    /// Overlay `overrides` on top of `self`.
    #[must_use]
    pub fn merged(&self, overrides: &QuotaSpec) -> QuotaSpec {
        let mut extra = self.extra.clone();
        extra.extend(overrides.extra.clone());
        QuotaSpec {
            cpu: overrides.cpu.clone().or_else(|| self.cpu.clone()),
            memory: overrides.memory.clone().or_else(|| self.memory.clone()),
            pods: overrides.pods.or(self.pods),
            extra,
        }
    }

    /// Quota `hard` map as the control plane expects it.
    #[must_use]
    pub fn hard_limits(&self) -> BTreeMap<String, String> {
        let mut hard = self.extra.clone();
        if let Some(cpu) = &self.cpu {
            hard.insert("limits.cpu".to_string(), cpu.clone());
        }
        if let Some(memory) = &self.memory {
            hard.insert("limits.memory".to_string(), memory.clone());
        }
        if let Some(pods) = self.pods {
            hard.insert("pods".to_string(), pods.to_string());
        }
        hard
    }
}

/// Environment tuning shared by all environments of a run.
#[derive(Debug, Clone)]
pub struct EnvironmentConfig {
    pub namespace_prefix: String,
    /// Bound on the namespace becoming active.
    pub ready: PollConfig,
    /// Quota applied when a check does not override it.
    pub default_quota: QuotaSpec,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            namespace_prefix: DEFAULT_NAMESPACE_PREFIX.to_string(),
            ready: PollConfig::new(DEFAULT_READY_TIMEOUT, DEFAULT_READY_POLL_INTERVAL),
            default_quota: QuotaSpec::default(),
        }
    }
}

/// Point-in-time view of an environment, for reports.
#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentSummary {
    pub id: String,
    pub namespace: String,
    pub state: EnvironmentState,
    /// Checks that ran in this environment.
    pub used_by: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub setup_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleanup: Option<CleanupReport>,
}

#[derive(Debug)]
struct EnvironmentInner {
    state: EnvironmentState,
    setup_error: Option<ValidationError>,
    cleanup: Option<CleanupReport>,
    used_by: Vec<String>,
}

/// Who an object found by a create call belongs to.
enum Creation {
    Ours,
    Foreign,
}

/// One isolated namespace plus the resources created in it.
pub struct TestEnvironment {
    id: EnvironmentId,
    namespace: String,
    quota: QuotaSpec,
    ready: PollConfig,
    client: Arc<dyn ClusterClient>,
    resilience: Arc<Resilience>,
    tracker: Arc<ResourceTracker>,
    progress: Option<ProgressHandle>,
    inner: Mutex<EnvironmentInner>,
    opened: AtomicBool,
    /// Serializes setup against teardown.
    lifecycle: tokio::sync::Mutex<()>,
}

impl fmt::Debug for TestEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestEnvironment")
            .field("id", &self.id)
            .field("namespace", &self.namespace)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl TestEnvironment {
    #[must_use]
    pub fn new(
        config: &EnvironmentConfig,
        quota: QuotaSpec,
        client: Arc<dyn ClusterClient>,
        resilience: Arc<Resilience>,
        tracker: Arc<ResourceTracker>,
    ) -> Self {
        let id = EnvironmentId::new();
        Self {
            namespace: format!("{}-{}", config.namespace_prefix, id.short()),
            id,
            quota,
            ready: config.ready,
            client,
            resilience,
            tracker,
            progress: None,
            inner: Mutex::new(EnvironmentInner {
                state: EnvironmentState::SettingUp,
                setup_error: None,
                cleanup: None,
                used_by: Vec::new(),
            }),
            opened: AtomicBool::new(false),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Report setup/teardown transitions under `handle`'s name.
    #[must_use]
    pub fn with_progress(mut self, handle: ProgressHandle) -> Self {
        self.progress = Some(handle);
        self
    }

    fn lock(&self) -> MutexGuard<'_, EnvironmentInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: EnvironmentState) {
        self.lock().state = state;
    }

    fn emit(&self, status: ProgressStatus) {
        if let Some(progress) = &self.progress {
            progress.update(status);
        }
    }

    #[must_use]
    pub fn id(&self) -> EnvironmentId {
        self.id
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    #[must_use]
    pub fn namespace_ref(&self) -> ResourceRef {
        ResourceRef::namespace(self.namespace.clone())
    }

    #[must_use]
    pub fn state(&self) -> EnvironmentState {
        self.lock().state
    }

    #[must_use]
    pub fn quota(&self) -> &QuotaSpec {
        &self.quota
    }

    #[must_use]
    pub fn client(&self) -> &Arc<dyn ClusterClient> {
        &self.client
    }

    /// Record that `check` ran here.
    pub fn add_user(&self, check: &str) {
        let mut inner = self.lock();
        if !inner.used_by.iter().any(|c| c == check) {
            inner.used_by.push(check.to_string());
        }
    }

    /// Provision the namespace and quota, then wait for the namespace to
    /// become active.
    ///
    /// Calling `setup` on a ready environment is a no-op; calling it after a
    /// failed setup returns the original error. If setup fails, the
    /// environment is torn down before the error is returned.
    ///
    /// # Errors
    ///
    /// - `Timeout` if the namespace does not become active in time
    /// - any cluster error that survives the retry policy
    /// - `Configuration` if the environment was already closed
    #[instrument(skip(self), fields(namespace = %self.namespace))]
    pub async fn setup(&self) -> Result<(), ValidationError> {
        let guard = self.lifecycle.lock().await;
        {
            let inner = self.lock();
            // A failed setup tears down, so the original error outlives
            // the Failed state.
            if let Some(e) = &inner.setup_error {
                return Err(e.clone());
            }
            match inner.state {
                EnvironmentState::Ready => return Ok(()),
                EnvironmentState::Failed => {
                    return Err(inner.setup_error.clone().unwrap_or_else(|| {
                        ValidationError::Configuration(format!(
                            "environment {} failed earlier",
                            self.namespace
                        ))
                    }))
                }
                EnvironmentState::TearingDown | EnvironmentState::Closed => {
                    return Err(ValidationError::Configuration(format!(
                        "environment {} is {}",
                        self.namespace, inner.state
                    )))
                }
                EnvironmentState::SettingUp => {}
            }
        }

        if !self.opened.swap(true, Ordering::SeqCst) {
            metrics::environment_opened();
        }
        self.emit(ProgressStatus::SettingUp);
        info!(target: "validator.environment", namespace = %self.namespace, "Setting up environment");

        match self.provision().await {
            Ok(()) => {
                self.set_state(EnvironmentState::Ready);
                info!(target: "validator.environment", namespace = %self.namespace, "Environment ready");
                Ok(())
            }
            Err(e) => {
                {
                    let mut inner = self.lock();
                    inner.state = EnvironmentState::Failed;
                    inner.setup_error = Some(e.clone());
                }
                error!(
                    target: "validator.environment",
                    namespace = %self.namespace,
                    error = %e,
                    "Environment setup failed, tearing down"
                );
                drop(guard);
                self.teardown().await;
                Err(e)
            }
        }
    }

    async fn provision(&self) -> Result<(), ValidationError> {
        let namespace = ObjectSpec::new(self.namespace_ref());
        self.provision_object(namespace, None).await?;

        let hard = self.quota.hard_limits();
        if !hard.is_empty() {
            let quota = ObjectSpec::new(ResourceRef::namespaced(
                ResourceKind::ResourceQuota,
                self.namespace.clone(),
                QUOTA_NAME,
            ))
            .with_spec(serde_json::json!({ "spec": { "hard": hard } }));
            self.provision_object(quota, None).await?;
        }

        let ns = self.namespace_ref();
        let operation = format!("namespace {} to become active", self.namespace);
        poll_until(&operation, self.ready, || async {
            let status = self.client.get(&ns).await?;
            Ok(status.phase.as_deref() == Some("Active") || status.ready)
        })
        .await
    }

    /// Track, create under retry, confirm.
    async fn provision_object(
        &self,
        object: ObjectSpec,
        after: Option<ResourceRef>,
    ) -> Result<ResourceRef, ValidationError> {
        let object = object
            .with_label(MANAGED_BY_LABEL, "deploy-validator")
            .with_label(ENVIRONMENT_LABEL, self.id.to_string());
        let id = object.id.clone();

        let mut tracked = TrackedResource::new(id.clone(), self.id);
        if let Some(after) = after {
            tracked = tracked.after(after);
        }
        self.tracker.track_pending(tracked).await?;

        let client = &self.client;
        let object = &object;
        // Set once an attempt failed in a way that may have left the object
        // behind; only then is `AlreadyExists` our own earlier create.
        let landed = AtomicBool::new(false);
        let landed = &landed;
        let created = self
            .resilience
            .call("create", || async move {
                match client.create(object).await {
                    Ok(()) => Ok(Creation::Ours),
                    Err(ClusterError::AlreadyExists(_)) if landed.load(Ordering::Acquire) => {
                        Ok(Creation::Ours)
                    }
                    Err(ClusterError::AlreadyExists(_)) => Ok(Creation::Foreign),
                    Err(e) => {
                        if matches!(e, ClusterError::Timeout(_) | ClusterError::Unavailable(_)) {
                            landed.store(true, Ordering::Release);
                        }
                        Err(e)
                    }
                }
            })
            .await;

        match created {
            Ok(Creation::Ours) => {
                self.tracker.confirm(&id).await?;
                Ok(id)
            }
            Ok(Creation::Foreign) => {
                // Not ours to delete.
                self.tracker.forget(&id).await?;
                warn!(
                    target: "validator.environment",
                    environment = %self.id,
                    resource = %id,
                    "Object already exists and was not created by this environment"
                );
                Err(ValidationError::Permanent(format!(
                    "{id} already exists and was not created by this environment"
                )))
            }
            Err(e) => {
                self.tracker.mark_failed(&id).await?;
                Err(e)
            }
        }
    }

    /// Create an object inside this environment and track it.
    ///
    /// `after` names a resource that must be deleted before this one.
    ///
    /// # Errors
    ///
    /// - `Configuration` if the environment is not ready, or the object is
    ///   outside this environment's namespace
    /// - any cluster error that survives the retry policy
    pub async fn create_resource(
        &self,
        object: ObjectSpec,
        after: Option<ResourceRef>,
    ) -> Result<ResourceRef, ValidationError> {
        let state = self.state();
        if state != EnvironmentState::Ready {
            return Err(ValidationError::Configuration(format!(
                "cannot create {} in environment {} while {state}",
                object.id, self.namespace
            )));
        }
        if !object.id.kind.is_namespaced() || object.id.namespace.as_deref() != Some(&self.namespace)
        {
            return Err(ValidationError::Configuration(format!(
                "{} is outside environment namespace {}",
                object.id, self.namespace
            )));
        }
        self.provision_object(object, after).await
    }

    /// Whether the cluster satisfies every capability in `required`.
    ///
    /// # Errors
    ///
    /// Cluster errors that survive the retry policy.
    pub async fn validate_dependencies(
        &self,
        required: &[Capability],
    ) -> Result<bool, ValidationError> {
        let missing = missing_capabilities(self.client.as_ref(), &self.resilience, required).await?;
        if !missing.is_empty() {
            let names: Vec<String> = missing.iter().map(ToString::to_string).collect();
            warn!(
                target: "validator.environment",
                namespace = %self.namespace,
                missing = %names.join(", "),
                "Environment prerequisites missing"
            );
        }
        Ok(missing.is_empty())
    }

    /// Delete everything this environment created, namespace last.
    ///
    /// Safe to call repeatedly and after a failed setup. If some deletions
    /// failed, the environment stays `Failed` so a later call retries them.
    #[instrument(skip(self), fields(namespace = %self.namespace))]
    pub async fn teardown(&self) -> CleanupReport {
        let _guard = self.lifecycle.lock().await;
        if self.state() == EnvironmentState::Closed {
            return self.lock().cleanup.clone().unwrap_or_default();
        }

        self.set_state(EnvironmentState::TearingDown);
        self.emit(ProgressStatus::TearingDown);
        info!(target: "validator.environment", namespace = %self.namespace, "Tearing down environment");

        let report = self.tracker.cleanup_owned_by(self.id).await;
        let closed = report.failed.is_empty();
        {
            let mut inner = self.lock();
            inner.state = if closed {
                EnvironmentState::Closed
            } else {
                EnvironmentState::Failed
            };
            inner.cleanup = Some(report.clone());
        }
        if closed && self.opened.swap(false, Ordering::SeqCst) {
            metrics::environment_closed();
        }

        if report.is_clean() {
            info!(
                target: "validator.environment",
                namespace = %self.namespace,
                deleted = report.deleted.len(),
                "Environment closed"
            );
        } else {
            warn!(
                target: "validator.environment",
                namespace = %self.namespace,
                degraded = report.degraded.len(),
                failed = report.failed.len(),
                "Environment teardown incomplete or degraded"
            );
        }
        report
    }

    #[must_use]
    pub fn summary(&self) -> EnvironmentSummary {
        let inner = self.lock();
        EnvironmentSummary {
            id: self.id.to_string(),
            namespace: self.namespace.clone(),
            state: inner.state,
            used_by: inner.used_by.clone(),
            setup_error: inner.setup_error.as_ref().map(ToString::to_string),
            cleanup: inner.cleanup.clone(),
        }
    }
}
