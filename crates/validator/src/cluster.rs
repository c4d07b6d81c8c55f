//! Cluster client surface consumed by the engine.
//!
//! The engine never embeds cluster wire logic. Everything it needs from the
//! control plane goes through [`ClusterClient`], injected as
//! `Arc<dyn ClusterClient>`. Every method is a suspension point and is
//! expected to be called under the retry policy and circuit breaker
//! (see [`crate::resilience::Resilience`]).

use common::error::ValidationError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Kinds of objects the engine provisions or inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Namespace,
    ResourceQuota,
    Deployment,
    StatefulSet,
    Job,
    Pod,
    Service,
    ConfigMap,
    Secret,
    NetworkPolicy,
    PersistentVolumeClaim,
}

impl ResourceKind {
    /// kubectl resource name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Namespace => "namespace",
            ResourceKind::ResourceQuota => "resourcequota",
            ResourceKind::Deployment => "deployment",
            ResourceKind::StatefulSet => "statefulset",
            ResourceKind::Job => "job",
            ResourceKind::Pod => "pod",
            ResourceKind::Service => "service",
            ResourceKind::ConfigMap => "configmap",
            ResourceKind::Secret => "secret",
            ResourceKind::NetworkPolicy => "networkpolicy",
            ResourceKind::PersistentVolumeClaim => "persistentvolumeclaim",
        }
    }

    /// Deletion rank. Within one scope, lower ranks are deleted first.
    ///
    /// Workloads go before the objects they consume, volume claims after the
    /// workloads mounting them, quotas after everything they bound, and the
    /// namespace last.
    #[must_use]
    pub fn teardown_rank(self) -> u8 {
        match self {
            ResourceKind::Deployment
            | ResourceKind::StatefulSet
            | ResourceKind::Job
            | ResourceKind::Pod => 0,
            ResourceKind::Service
            | ResourceKind::NetworkPolicy
            | ResourceKind::ConfigMap
            | ResourceKind::Secret => 1,
            ResourceKind::PersistentVolumeClaim => 2,
            ResourceKind::ResourceQuota => 3,
            ResourceKind::Namespace => 4,
        }
    }

    #[must_use]
    pub fn is_namespaced(self) -> bool {
        !matches!(self, ResourceKind::Namespace)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a cluster object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceRef {
    /// A cluster-scoped namespace object.
    #[must_use]
    pub fn namespace(name: impl Into<String>) -> Self {
        Self {
            kind: ResourceKind::Namespace,
            namespace: None,
            name: name.into(),
        }
    }

    /// A namespaced object.
    #[must_use]
    pub fn namespaced(
        kind: ResourceKind,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// The namespace that scopes this object, or its own name for namespaces.
    #[must_use]
    pub fn scope(&self) -> &str {
        match (&self.kind, &self.namespace) {
            (ResourceKind::Namespace, _) => &self.name,
            (_, Some(ns)) => ns,
            (_, None) => "",
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// Desired state of an object to create.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectSpec {
    pub id: ResourceRef,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Kind-specific body (e.g. quota `hard` limits, configmap `data`).
    #[serde(default)]
    pub spec: serde_json::Value,
}

impl ObjectSpec {
    #[must_use]
    pub fn new(id: ResourceRef) -> Self {
        Self {
            id,
            labels: BTreeMap::new(),
            spec: serde_json::Value::Null,
        }
    }

    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_spec(mut self, spec: serde_json::Value) -> Self {
        self.spec = spec;
        self
    }
}

/// Observed state of an existing object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectStatus {
    pub id: ResourceRef,
    /// Lifecycle phase as reported by the control plane (e.g. `Active`).
    pub phase: Option<String>,
    /// Whether the object reports itself ready/available.
    pub ready: bool,
    #[serde(default)]
    pub finalizers: Vec<String>,
    /// Set once a delete request has been accepted.
    #[serde(default)]
    pub terminating: bool,
}

/// Aggregate schedulable capacity of the cluster.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSummary {
    pub ready_nodes: u32,
    pub allocatable_cpu_millis: u64,
    pub allocatable_memory_bytes: u64,
}

/// Output of a command executed inside a pod.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Failures reported by a cluster client implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClusterError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    /// Network failure or 5xx from the control plane.
    #[error("Control plane unavailable: {0}")]
    Unavailable(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),
}

impl ClusterError {
    /// Transient errors are retried; everything else propagates immediately.
    ///
    /// `NotFound`/`AlreadyExists`/`Conflict` are propagation races in an
    /// eventually-consistent control plane and settle on retry.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ClusterError::NotFound(_)
                | ClusterError::AlreadyExists(_)
                | ClusterError::Conflict(_)
                | ClusterError::Timeout(_)
                | ClusterError::Unavailable(_)
        )
    }
}

impl From<ClusterError> for ValidationError {
    fn from(err: ClusterError) -> Self {
        if err.is_transient() {
            ValidationError::Transient(err.to_string())
        } else {
            ValidationError::Permanent(err.to_string())
        }
    }
}

/// Capability surface of the cluster under test.
#[async_trait::async_trait]
pub trait ClusterClient: Send + Sync {
    /// Create an object. Fails with `AlreadyExists` if present.
    async fn create(&self, object: &ObjectSpec) -> Result<(), ClusterError>;

    /// Fetch the observed state of an object.
    async fn get(&self, id: &ResourceRef) -> Result<ObjectStatus, ClusterError>;

    /// List objects of a kind, optionally within one namespace.
    async fn list(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
    ) -> Result<Vec<ResourceRef>, ClusterError>;

    /// Request deletion. Acceptance does not imply the object is gone.
    async fn delete(&self, id: &ResourceRef) -> Result<(), ClusterError>;

    /// Strip finalizers so a stuck deletion can complete.
    async fn remove_finalizers(&self, id: &ResourceRef) -> Result<(), ClusterError>;

    /// Block until `condition` holds for the object or `timeout` elapses.
    async fn wait_for_condition(
        &self,
        id: &ResourceRef,
        condition: &str,
        timeout: Duration,
    ) -> Result<(), ClusterError>;

    /// Whether a CustomResourceDefinition is installed.
    async fn crd_exists(&self, name: &str) -> Result<bool, ClusterError>;

    /// Aggregate node capacity.
    async fn node_summary(&self) -> Result<NodeSummary, ClusterError>;

    /// Run a command in a pod container.
    async fn exec_in_pod(
        &self,
        namespace: &str,
        pod: &str,
        container: Option<&str>,
        command: &[String],
    ) -> Result<ExecOutput, ClusterError>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::error::ErrorKind;

    #[test]
    fn test_teardown_rank_orders_namespace_last() {
        let namespace_rank = ResourceKind::Namespace.teardown_rank();
        for kind in [
            ResourceKind::Deployment,
            ResourceKind::Service,
            ResourceKind::PersistentVolumeClaim,
            ResourceKind::ResourceQuota,
        ] {
            assert!(kind.teardown_rank() < namespace_rank, "{kind} before namespace");
        }
        assert!(
            ResourceKind::Deployment.teardown_rank()
                < ResourceKind::PersistentVolumeClaim.teardown_rank()
        );
    }

    #[test]
    fn test_resource_ref_scope() {
        let ns = ResourceRef::namespace("validation-abc");
        assert_eq!(ns.scope(), "validation-abc");

        let deploy = ResourceRef::namespaced(ResourceKind::Deployment, "validation-abc", "web");
        assert_eq!(deploy.scope(), "validation-abc");
        assert_eq!(deploy.to_string(), "deployment/validation-abc/web");
    }

    #[test]
    fn test_cluster_error_classification() {
        assert!(ClusterError::Unavailable("503".to_string()).is_transient());
        assert!(ClusterError::NotFound("ns".to_string()).is_transient());
        assert!(!ClusterError::Forbidden("rbac".to_string()).is_transient());
        assert!(!ClusterError::BadRequest("schema".to_string()).is_transient());

        let err: ValidationError = ClusterError::Timeout("i/o timeout".to_string()).into();
        assert_eq!(err.kind(), ErrorKind::Transient);

        let err: ValidationError = ClusterError::Unauthorized("token".to_string()).into();
        assert_eq!(err.kind(), ErrorKind::Permanent);
    }
}
