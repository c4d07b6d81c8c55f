//! In-memory cluster for validator testing.
//!
//! Implements `ClusterClient` over a map of objects with:
//! - Scripted failures per operation (next-N or always)
//! - Stuck finalizers per resource kind
//! - Slow or never-ready namespaces
//! - Per-operation latency (works with paused tokio time)
//! - Logs of created and deleted objects, in order
//!
//! # Example
//!
//! ```rust,ignore
//! use validator_test_utils::{ClusterOp, MockCluster};
//!
//! let cluster = MockCluster::new()
//!     .fail_next(ClusterOp::Create, ClusterError::Unavailable("503".into()))
//!     .with_namespace_ready_after(3);
//!
//! let client = cluster.client();
//! // ... drive the engine ...
//! assert!(cluster.namespaces().is_empty());
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use validator::cluster::{
    ClusterClient, ClusterError, ExecOutput, NodeSummary, ObjectSpec, ObjectStatus, ResourceKind,
    ResourceRef,
};

/// Finalizer placed on objects of stuck kinds.
pub const STUCK_FINALIZER: &str = "validator.test/stuck";

/// Cluster client operations, for fault injection and call counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClusterOp {
    Create,
    Get,
    List,
    Delete,
    RemoveFinalizers,
    Wait,
    CrdExists,
    NodeSummary,
    Exec,
}

#[derive(Debug, Clone)]
struct MockObject {
    status: ObjectStatus,
    labels: BTreeMap<String, String>,
    /// Gets remaining before a namespace reports `Active`.
    gets_until_ready: Option<u32>,
}

#[derive(Debug)]
struct MockClusterInner {
    objects: BTreeMap<ResourceRef, MockObject>,
    crds: BTreeSet<String>,
    nodes: NodeSummary,
    exec_output: ExecOutput,
    /// Consumed front to back, one per call.
    next_failures: HashMap<ClusterOp, VecDeque<ClusterError>>,
    always_failures: HashMap<ClusterOp, ClusterError>,
    create_failures: HashMap<ResourceKind, ClusterError>,
    delays: HashMap<ClusterOp, Duration>,
    stuck_kinds: BTreeSet<ResourceKind>,
    /// `None` means namespaces never become ready.
    namespace_ready_after: Option<u32>,
    calls: HashMap<ClusterOp, usize>,
    created: Vec<ResourceRef>,
    deleted: Vec<ResourceRef>,
}

impl Default for MockClusterInner {
    fn default() -> Self {
        Self {
            objects: BTreeMap::new(),
            crds: BTreeSet::new(),
            nodes: NodeSummary {
                ready_nodes: 3,
                allocatable_cpu_millis: 12_000,
                allocatable_memory_bytes: 48 << 30,
            },
            exec_output: ExecOutput::default(),
            next_failures: HashMap::new(),
            always_failures: HashMap::new(),
            create_failures: HashMap::new(),
            delays: HashMap::new(),
            stuck_kinds: BTreeSet::new(),
            namespace_ready_after: Some(0),
            calls: HashMap::new(),
            created: Vec::new(),
            deleted: Vec::new(),
        }
    }
}

impl MockClusterInner {
    fn remove(&mut self, id: &ResourceRef) {
        if id.kind == ResourceKind::Namespace {
            let contained: Vec<ResourceRef> = self
                .objects
                .keys()
                .filter(|o| o.kind.is_namespaced() && o.namespace.as_deref() == Some(&id.name))
                .cloned()
                .collect();
            for object in contained {
                self.objects.remove(&object);
                self.deleted.push(object);
            }
        }
        if self.objects.remove(id).is_some() {
            self.deleted.push(id.clone());
        }
    }
}

/// Mock cluster for testing the validator engine.
#[derive(Debug, Clone)]
pub struct MockCluster {
    inner: Arc<Mutex<MockClusterInner>>,
}

impl Default for MockCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCluster {
    /// A healthy cluster: three ready nodes, namespaces active immediately.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockClusterInner::default())),
        }
    }

    /// This cluster as an injectable client.
    #[must_use]
    pub fn client(&self) -> Arc<dyn ClusterClient> {
        Arc::new(self.clone())
    }

    /// Install a CustomResourceDefinition.
    #[must_use]
    pub fn with_crd(self, name: &str) -> Self {
        self.inner.lock().unwrap().crds.insert(name.to_string());
        self
    }

    /// Replace the node summary.
    #[must_use]
    pub fn with_nodes(self, ready_nodes: u32, cpu_millis: u64, memory_mib: u64) -> Self {
        self.inner.lock().unwrap().nodes = NodeSummary {
            ready_nodes,
            allocatable_cpu_millis: cpu_millis,
            allocatable_memory_bytes: memory_mib << 20,
        };
        self
    }

    /// A pre-existing namespace not created by the engine.
    #[must_use]
    pub fn with_namespace(self, name: &str) -> Self {
        self.insert(ObjectStatus {
            id: ResourceRef::namespace(name),
            phase: Some("Active".to_string()),
            ready: true,
            finalizers: Vec::new(),
            terminating: false,
        });
        self
    }

    /// A pre-existing deployment (and its namespace).
    #[must_use]
    pub fn with_deployment(self, namespace: &str, name: &str, ready: bool) -> Self {
        let cluster = self.with_namespace(namespace);
        cluster.insert(ObjectStatus {
            id: ResourceRef::namespaced(ResourceKind::Deployment, namespace, name),
            phase: None,
            ready,
            finalizers: Vec::new(),
            terminating: false,
        });
        cluster
    }

    /// Fail the next call of `op` with `error`. Repeated calls queue up.
    #[must_use]
    pub fn fail_next(self, op: ClusterOp, error: ClusterError) -> Self {
        self.inner
            .lock()
            .unwrap()
            .next_failures
            .entry(op)
            .or_default()
            .push_back(error);
        self
    }

    /// Fail every call of `op` with `error`.
    #[must_use]
    pub fn fail_always(self, op: ClusterOp, error: ClusterError) -> Self {
        self.inner.lock().unwrap().always_failures.insert(op, error);
        self
    }

    /// Fail every create of `kind` with `error`.
    #[must_use]
    pub fn fail_creates_of(self, kind: ResourceKind, error: ClusterError) -> Self {
        self.inner.lock().unwrap().create_failures.insert(kind, error);
        self
    }

    /// Every call of `op` takes `delay` before answering.
    #[must_use]
    pub fn with_delay(self, op: ClusterOp, delay: Duration) -> Self {
        self.inner.lock().unwrap().delays.insert(op, delay);
        self
    }

    /// Objects of `kind` are created with a finalizer that blocks deletion
    /// until removed.
    #[must_use]
    pub fn with_stuck_finalizers(self, kind: ResourceKind) -> Self {
        self.inner.lock().unwrap().stuck_kinds.insert(kind);
        self
    }

    /// New namespaces report `Active` only after `gets` reads.
    #[must_use]
    pub fn with_namespace_ready_after(self, gets: u32) -> Self {
        self.inner.lock().unwrap().namespace_ready_after = Some(gets);
        self
    }

    /// New namespaces never report `Active`.
    #[must_use]
    pub fn with_namespaces_never_ready(self) -> Self {
        self.inner.lock().unwrap().namespace_ready_after = None;
        self
    }

    /// Output returned by every exec.
    #[must_use]
    pub fn with_exec_output(self, output: ExecOutput) -> Self {
        self.inner.lock().unwrap().exec_output = output;
        self
    }

    /// Stop failing calls of `op`.
    pub fn heal(&self, op: ClusterOp) {
        let mut inner = self.inner.lock().unwrap();
        inner.always_failures.remove(&op);
        inner.next_failures.remove(&op);
    }

    /// Change a deployment's readiness.
    pub fn set_ready(&self, id: &ResourceRef, ready: bool) {
        if let Some(object) = self.inner.lock().unwrap().objects.get_mut(id) {
            object.status.ready = ready;
        }
    }

    fn insert(&self, status: ObjectStatus) {
        self.inner.lock().unwrap().objects.insert(
            status.id.clone(),
            MockObject {
                status,
                labels: BTreeMap::new(),
                gets_until_ready: None,
            },
        );
    }

    /// Whether an object currently exists.
    #[must_use]
    pub fn exists(&self, id: &ResourceRef) -> bool {
        self.inner.lock().unwrap().objects.contains_key(id)
    }

    /// Every object currently present.
    #[must_use]
    pub fn objects(&self) -> Vec<ResourceRef> {
        self.inner.lock().unwrap().objects.keys().cloned().collect()
    }

    /// Names of namespaces created through the client that still exist.
    #[must_use]
    pub fn namespaces(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .created
            .iter()
            .filter(|id| id.kind == ResourceKind::Namespace && inner.objects.contains_key(*id))
            .map(|id| id.name.clone())
            .collect()
    }

    /// Labels of an existing object.
    #[must_use]
    pub fn labels(&self, id: &ResourceRef) -> Option<BTreeMap<String, String>> {
        self.inner
            .lock()
            .unwrap()
            .objects
            .get(id)
            .map(|o| o.labels.clone())
    }

    /// Objects created through the client, in creation order.
    #[must_use]
    pub fn created_log(&self) -> Vec<ResourceRef> {
        self.inner.lock().unwrap().created.clone()
    }

    /// Objects that disappeared, in the order they did.
    #[must_use]
    pub fn deletion_log(&self) -> Vec<ResourceRef> {
        self.inner.lock().unwrap().deleted.clone()
    }

    /// Number of calls made to `op`, including failed ones.
    #[must_use]
    pub fn call_count(&self, op: ClusterOp) -> usize {
        self.inner
            .lock()
            .unwrap()
            .calls
            .get(&op)
            .copied()
            .unwrap_or(0)
    }

    /// Count the call, wait out any delay, and return an injected failure.
    async fn enter(&self, op: ClusterOp) -> Result<(), ClusterError> {
        let delay = {
            let mut inner = self.inner.lock().unwrap();
            *inner.calls.entry(op).or_default() += 1;
            inner.delays.get(&op).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.inner.lock().unwrap();
        if let Some(error) = inner.next_failures.get_mut(&op).and_then(VecDeque::pop_front) {
            return Err(error);
        }
        match inner.always_failures.get(&op) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl ClusterClient for MockCluster {
    async fn create(&self, object: &ObjectSpec) -> Result<(), ClusterError> {
        self.enter(ClusterOp::Create).await?;
        let mut inner = self.inner.lock().unwrap();
        let id = object.id.clone();
        if let Some(error) = inner.create_failures.get(&id.kind) {
            return Err(error.clone());
        }
        if inner.objects.contains_key(&id) {
            return Err(ClusterError::AlreadyExists(id.to_string()));
        }
        if let Some(ns) = &id.namespace {
            let scope = ResourceRef::namespace(ns.clone());
            match inner.objects.get(&scope) {
                None => return Err(ClusterError::NotFound(format!("namespace {ns}"))),
                Some(n) if n.status.terminating => {
                    return Err(ClusterError::Forbidden(format!(
                        "namespace {ns} is being terminated"
                    )))
                }
                Some(_) => {}
            }
        }

        let finalizers = if inner.stuck_kinds.contains(&id.kind) {
            vec![STUCK_FINALIZER.to_string()]
        } else {
            Vec::new()
        };
        let (phase, ready, gets_until_ready) = if id.kind == ResourceKind::Namespace {
            match inner.namespace_ready_after {
                Some(0) => (Some("Active".to_string()), true, None),
                Some(n) => (Some("Pending".to_string()), false, Some(n)),
                None => (Some("Pending".to_string()), false, Some(u32::MAX)),
            }
        } else {
            (None, true, None)
        };
        inner.objects.insert(
            id.clone(),
            MockObject {
                status: ObjectStatus {
                    id: id.clone(),
                    phase,
                    ready,
                    finalizers,
                    terminating: false,
                },
                labels: object.labels.clone(),
                gets_until_ready,
            },
        );
        inner.created.push(id);
        Ok(())
    }

    async fn get(&self, id: &ResourceRef) -> Result<ObjectStatus, ClusterError> {
        self.enter(ClusterOp::Get).await?;
        let mut inner = self.inner.lock().unwrap();
        let object = inner
            .objects
            .get_mut(id)
            .ok_or_else(|| ClusterError::NotFound(id.to_string()))?;
        // u32::MAX marks a namespace that never becomes ready.
        if let Some(remaining) = object.gets_until_ready.filter(|r| *r != u32::MAX) {
            if remaining <= 1 {
                object.gets_until_ready = None;
                object.status.phase = Some("Active".to_string());
                object.status.ready = true;
            } else {
                object.gets_until_ready = Some(remaining - 1);
            }
        }
        Ok(object.status.clone())
    }

    async fn list(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
    ) -> Result<Vec<ResourceRef>, ClusterError> {
        self.enter(ClusterOp::List).await?;
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .objects
            .keys()
            .filter(|id| id.kind == kind)
            .filter(|id| namespace.map_or(true, |ns| id.namespace.as_deref() == Some(ns)))
            .cloned()
            .collect())
    }

    async fn delete(&self, id: &ResourceRef) -> Result<(), ClusterError> {
        self.enter(ClusterOp::Delete).await?;
        let mut inner = self.inner.lock().unwrap();
        let object = inner
            .objects
            .get_mut(id)
            .ok_or_else(|| ClusterError::NotFound(id.to_string()))?;
        if object.status.finalizers.is_empty() {
            inner.remove(id);
        } else {
            object.status.terminating = true;
            if id.kind == ResourceKind::Namespace {
                object.status.phase = Some("Terminating".to_string());
            }
        }
        Ok(())
    }

    async fn remove_finalizers(&self, id: &ResourceRef) -> Result<(), ClusterError> {
        self.enter(ClusterOp::RemoveFinalizers).await?;
        let mut inner = self.inner.lock().unwrap();
        let object = inner
            .objects
            .get_mut(id)
            .ok_or_else(|| ClusterError::NotFound(id.to_string()))?;
        object.status.finalizers.clear();
        if object.status.terminating {
            inner.remove(id);
        }
        Ok(())
    }

    async fn wait_for_condition(
        &self,
        id: &ResourceRef,
        condition: &str,
        timeout: Duration,
    ) -> Result<(), ClusterError> {
        self.enter(ClusterOp::Wait).await?;
        let satisfied = {
            let inner = self.inner.lock().unwrap();
            match inner.objects.get(id) {
                None => condition == "delete",
                Some(object) => condition != "delete" && object.status.ready,
            }
        };
        if satisfied {
            Ok(())
        } else {
            tokio::time::sleep(timeout).await;
            Err(ClusterError::Timeout(format!(
                "{id} did not reach {condition}"
            )))
        }
    }

    async fn crd_exists(&self, name: &str) -> Result<bool, ClusterError> {
        self.enter(ClusterOp::CrdExists).await?;
        Ok(self.inner.lock().unwrap().crds.contains(name))
    }

    async fn node_summary(&self) -> Result<NodeSummary, ClusterError> {
        self.enter(ClusterOp::NodeSummary).await?;
        Ok(self.inner.lock().unwrap().nodes)
    }

    async fn exec_in_pod(
        &self,
        namespace: &str,
        pod: &str,
        _container: Option<&str>,
        _command: &[String],
    ) -> Result<ExecOutput, ClusterError> {
        self.enter(ClusterOp::Exec).await?;
        let inner = self.inner.lock().unwrap();
        let id = ResourceRef::namespaced(ResourceKind::Pod, namespace, pod);
        if !inner.objects.contains_key(&id) {
            return Err(ClusterError::NotFound(id.to_string()));
        }
        Ok(inner.exec_output.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_namespaced_create_requires_namespace() {
        let cluster = MockCluster::new();
        let cm = ObjectSpec::new(ResourceRef::namespaced(ResourceKind::ConfigMap, "ns", "cm"));
        assert!(matches!(
            cluster.create(&cm).await,
            Err(ClusterError::NotFound(_))
        ));

        cluster
            .create(&ObjectSpec::new(ResourceRef::namespace("ns")))
            .await
            .unwrap();
        cluster.create(&cm).await.unwrap();
        assert!(matches!(
            cluster.create(&cm).await,
            Err(ClusterError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_stuck_finalizer_blocks_deletion_until_removed() {
        let cluster = MockCluster::new().with_stuck_finalizers(ResourceKind::Namespace);
        let ns = ResourceRef::namespace("ns");
        cluster.create(&ObjectSpec::new(ns.clone())).await.unwrap();

        cluster.delete(&ns).await.unwrap();
        let status = cluster.get(&ns).await.unwrap();
        assert!(status.terminating);

        cluster.remove_finalizers(&ns).await.unwrap();
        assert!(!cluster.exists(&ns));
        assert_eq!(cluster.deletion_log(), vec![ns]);
    }

    #[tokio::test]
    async fn test_namespace_readiness_after_gets() {
        let cluster = MockCluster::new().with_namespace_ready_after(2);
        let ns = ResourceRef::namespace("ns");
        cluster.create(&ObjectSpec::new(ns.clone())).await.unwrap();
        assert!(!cluster.get(&ns).await.unwrap().ready);
        assert_eq!(
            cluster.get(&ns).await.unwrap().phase.as_deref(),
            Some("Active")
        );
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let cluster = MockCluster::new()
            .fail_next(ClusterOp::NodeSummary, ClusterError::Unavailable("503".to_string()));
        assert!(cluster.node_summary().await.is_err());
        assert!(cluster.node_summary().await.is_ok());
        assert_eq!(cluster.call_count(ClusterOp::NodeSummary), 2);
    }
}
