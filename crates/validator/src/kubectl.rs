//! [`ClusterClient`] backed by the `kubectl` binary.
//!
//! A thin adapter: each call shells out to kubectl with JSON output and maps
//! its stderr onto [`ClusterError`] kinds so the retry policy can tell
//! transient failures from permanent ones.

use crate::cluster::{
    ClusterClient, ClusterError, ExecOutput, NodeSummary, ObjectSpec, ObjectStatus, ResourceKind,
    ResourceRef,
};
use serde_json::{json, Value};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument};

/// Extra time allowed on top of a `kubectl wait` timeout for the process
/// itself.
const WAIT_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct KubectlClient {
    binary: String,
    timeout: Duration,
}

impl KubectlClient {
    /// `timeout` bounds every kubectl invocation except `wait`, which gets
    /// its own timeout plus a grace period.
    #[must_use]
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    async fn output(
        &self,
        args: &[String],
        stdin: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<std::process::Output, ClusterError> {
        debug!(target: "validator.kubectl", args = %args.join(" "), "Invoking kubectl");
        let mut command = Command::new(&self.binary);
        command
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| ClusterError::Unavailable(format!("cannot run {}: {e}", self.binary)))?;
        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(&input)
                .await
                .map_err(|e| ClusterError::Unavailable(format!("kubectl stdin: {e}")))?;
            drop(pipe);
        }

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(ClusterError::Unavailable(format!("kubectl failed: {e}"))),
            Err(_) => Err(ClusterError::Timeout(format!(
                "kubectl {} exceeded {}s",
                args.first().map_or("", String::as_str),
                timeout.as_secs()
            ))),
        }
    }

    /// Run kubectl and return stdout, classifying a non-zero exit.
    async fn run(&self, args: Vec<String>, stdin: Option<Vec<u8>>) -> Result<String, ClusterError> {
        self.run_with_timeout(args, stdin, self.timeout).await
    }

    async fn run_with_timeout(
        &self,
        args: Vec<String>,
        stdin: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<String, ClusterError> {
        let output = self.output(&args, stdin, timeout).await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(classify_stderr(&String::from_utf8_lossy(&output.stderr)))
        }
    }

    async fn get_json(&self, args: Vec<String>) -> Result<Value, ClusterError> {
        let stdout = self.run(args, None).await?;
        serde_json::from_str(&stdout)
            .map_err(|e| ClusterError::BadRequest(format!("unparseable kubectl output: {e}")))
    }
}

fn owned(args: &[&str]) -> Vec<String> {
    args.iter().map(ToString::to_string).collect()
}

/// `<kind> <name> [-n <namespace>]`
fn target_args(id: &ResourceRef) -> Vec<String> {
    let mut args = vec![id.kind.as_str().to_string(), id.name.clone()];
    if let Some(ns) = &id.namespace {
        args.push("-n".to_string());
        args.push(ns.clone());
    }
    args
}

/// Map kubectl stderr to an error kind.
pub(crate) fn classify_stderr(stderr: &str) -> ClusterError {
    let message = stderr.trim().to_string();
    let lower = message.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if has(&["(notfound)", "not found"]) {
        ClusterError::NotFound(message)
    } else if has(&["(alreadyexists)", "already exists"]) {
        ClusterError::AlreadyExists(message)
    } else if has(&["(conflict)", "the object has been modified"]) {
        ClusterError::Conflict(message)
    } else if has(&["(unauthorized)", "you must be logged in"]) {
        ClusterError::Unauthorized(message)
    } else if has(&["(forbidden)", "is forbidden"]) {
        ClusterError::Forbidden(message)
    } else if has(&["timed out", "i/o timeout", "deadline exceeded", "(timeout)"]) {
        ClusterError::Timeout(message)
    } else if has(&[
        "connection refused",
        "unable to connect",
        "(serviceunavailable)",
        "(internalerror)",
        "tls handshake",
        "connection reset",
        "etcdserver",
        "too many requests",
    ]) {
        ClusterError::Unavailable(message)
    } else {
        ClusterError::BadRequest(message)
    }
}

/// `(apiVersion, kind)` for a resource kind.
fn type_meta(kind: ResourceKind) -> (&'static str, &'static str) {
    match kind {
        ResourceKind::Namespace => ("v1", "Namespace"),
        ResourceKind::ResourceQuota => ("v1", "ResourceQuota"),
        ResourceKind::Deployment => ("apps/v1", "Deployment"),
        ResourceKind::StatefulSet => ("apps/v1", "StatefulSet"),
        ResourceKind::Job => ("batch/v1", "Job"),
        ResourceKind::Pod => ("v1", "Pod"),
        ResourceKind::Service => ("v1", "Service"),
        ResourceKind::ConfigMap => ("v1", "ConfigMap"),
        ResourceKind::Secret => ("v1", "Secret"),
        ResourceKind::NetworkPolicy => ("networking.k8s.io/v1", "NetworkPolicy"),
        ResourceKind::PersistentVolumeClaim => ("v1", "PersistentVolumeClaim"),
    }
}

/// Full manifest for `kubectl create -f -`. Top-level keys of the object's
/// body are merged next to `metadata`.
pub(crate) fn manifest(object: &ObjectSpec) -> Value {
    let (api_version, kind) = type_meta(object.id.kind);
    let mut metadata = json!({ "name": object.id.name });
    if let Some(ns) = &object.id.namespace {
        metadata["namespace"] = json!(ns);
    }
    if !object.labels.is_empty() {
        metadata["labels"] = json!(object.labels);
    }

    let mut manifest = json!({
        "apiVersion": api_version,
        "kind": kind,
        "metadata": metadata,
    });
    if let (Some(body), Some(target)) = (object.spec.as_object(), manifest.as_object_mut()) {
        for (key, value) in body {
            if key != "metadata" {
                target.insert(key.clone(), value.clone());
            }
        }
    }
    manifest
}

fn condition_true(object: &Value, kind: &str) -> bool {
    object
        .pointer("/status/conditions")
        .and_then(Value::as_array)
        .is_some_and(|conditions| {
            conditions.iter().any(|c| {
                c.get("type").and_then(Value::as_str) == Some(kind)
                    && c.get("status").and_then(Value::as_str) == Some("True")
            })
        })
}

/// Observed state from `kubectl get -o json`.
pub(crate) fn parse_status(id: &ResourceRef, object: &Value) -> ObjectStatus {
    let phase = object
        .pointer("/status/phase")
        .and_then(Value::as_str)
        .map(str::to_string);
    let ready = match id.kind {
        ResourceKind::Namespace => phase.as_deref() == Some("Active"),
        ResourceKind::Deployment | ResourceKind::StatefulSet => {
            let wanted = object
                .pointer("/spec/replicas")
                .and_then(Value::as_u64)
                .unwrap_or(1);
            let ready = object
                .pointer("/status/readyReplicas")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            ready >= wanted
        }
        ResourceKind::Job => condition_true(object, "Complete"),
        ResourceKind::Pod => condition_true(object, "Ready"),
        ResourceKind::PersistentVolumeClaim => phase.as_deref() == Some("Bound"),
        _ => true,
    };
    let finalizers = object
        .pointer("/metadata/finalizers")
        .and_then(Value::as_array)
        .map(|f| f.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default();
    let terminating = object.pointer("/metadata/deletionTimestamp").is_some()
        || phase.as_deref() == Some("Terminating");

    ObjectStatus {
        id: id.clone(),
        phase,
        ready,
        finalizers,
        terminating,
    }
}

/// CPU quantity in millicores (`"4"`, `"3500m"`, `"0.5"`).
pub(crate) fn parse_cpu_millis(quantity: &str) -> Option<u64> {
    let quantity = quantity.trim();
    if let Some(millis) = quantity.strip_suffix('m') {
        return millis.parse().ok();
    }
    let cores: f64 = quantity.parse().ok()?;
    if cores.is_sign_negative() || !cores.is_finite() {
        return None;
    }
    // Whole millicores, kubectl's own resolution.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let millis = (cores * 1000.0).round() as u64;
    Some(millis)
}

/// Memory quantity in bytes (`"16Gi"`, `"512Mi"`, `"1G"`, `"1048576"`).
pub(crate) fn parse_memory_bytes(quantity: &str) -> Option<u64> {
    const SUFFIXES: &[(&str, u64)] = &[
        ("Ki", 1 << 10),
        ("Mi", 1 << 20),
        ("Gi", 1 << 30),
        ("Ti", 1 << 40),
        ("k", 1_000),
        ("M", 1_000_000),
        ("G", 1_000_000_000),
        ("T", 1_000_000_000_000),
    ];
    let quantity = quantity.trim();
    for (suffix, factor) in SUFFIXES {
        if let Some(number) = quantity.strip_suffix(suffix) {
            return number.parse::<u64>().ok()?.checked_mul(*factor);
        }
    }
    quantity.parse().ok()
}

/// Sum allocatable capacity over ready nodes of `kubectl get nodes -o json`.
pub(crate) fn parse_node_summary(nodes: &Value) -> NodeSummary {
    let mut summary = NodeSummary::default();
    let Some(items) = nodes.get("items").and_then(Value::as_array) else {
        return summary;
    };
    for node in items.iter().filter(|n| condition_true(n, "Ready")) {
        summary.ready_nodes += 1;
        let allocatable = |key: &str| {
            node.pointer(&format!("/status/allocatable/{key}"))
                .and_then(Value::as_str)
        };
        summary.allocatable_cpu_millis += allocatable("cpu").and_then(parse_cpu_millis).unwrap_or(0);
        summary.allocatable_memory_bytes += allocatable("memory")
            .and_then(parse_memory_bytes)
            .unwrap_or(0);
    }
    summary
}

#[async_trait::async_trait]
impl ClusterClient for KubectlClient {
    #[instrument(skip_all, fields(id = %object.id))]
    async fn create(&self, object: &ObjectSpec) -> Result<(), ClusterError> {
        let body = serde_json::to_vec(&manifest(object))
            .map_err(|e| ClusterError::BadRequest(format!("unserializable manifest: {e}")))?;
        self.run(owned(&["create", "-f", "-"]), Some(body)).await?;
        Ok(())
    }

    async fn get(&self, id: &ResourceRef) -> Result<ObjectStatus, ClusterError> {
        let mut args = vec!["get".to_string()];
        args.extend(target_args(id));
        args.extend(owned(&["-o", "json"]));
        let object = self.get_json(args).await?;
        Ok(parse_status(id, &object))
    }

    async fn list(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
    ) -> Result<Vec<ResourceRef>, ClusterError> {
        let mut args = owned(&["get", kind.as_str(), "-o", "json"]);
        match (kind.is_namespaced(), namespace) {
            (true, Some(ns)) => args.extend(["-n".to_string(), ns.to_string()]),
            (true, None) => args.push("--all-namespaces".to_string()),
            (false, _) => {}
        }
        let list = self.get_json(args).await?;
        let items = list
            .get("items")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        Ok(items
            .iter()
            .filter_map(|item| {
                let name = item.pointer("/metadata/name")?.as_str()?.to_string();
                let namespace = item
                    .pointer("/metadata/namespace")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                Some(ResourceRef {
                    kind,
                    namespace,
                    name,
                })
            })
            .collect())
    }

    #[instrument(skip_all, fields(id = %id))]
    async fn delete(&self, id: &ResourceRef) -> Result<(), ClusterError> {
        let mut args = vec!["delete".to_string()];
        args.extend(target_args(id));
        args.push("--wait=false".to_string());
        self.run(args, None).await?;
        Ok(())
    }

    #[instrument(skip_all, fields(id = %id))]
    async fn remove_finalizers(&self, id: &ResourceRef) -> Result<(), ClusterError> {
        let mut args = vec!["patch".to_string()];
        args.extend(target_args(id));
        args.extend(owned(&[
            "--type=merge",
            "-p",
            r#"{"metadata":{"finalizers":null}}"#,
        ]));
        self.run(args, None).await?;
        Ok(())
    }

    async fn wait_for_condition(
        &self,
        id: &ResourceRef,
        condition: &str,
        timeout: Duration,
    ) -> Result<(), ClusterError> {
        let condition = if condition == "delete" || condition.contains('=') {
            condition.to_string()
        } else {
            format!("condition={condition}")
        };
        let mut args = vec!["wait".to_string(), format!("{}/{}", id.kind, id.name)];
        if let Some(ns) = &id.namespace {
            args.extend(["-n".to_string(), ns.clone()]);
        }
        args.push(format!("--for={condition}"));
        args.push(format!("--timeout={}s", timeout.as_secs().max(1)));
        self.run_with_timeout(args, None, timeout + WAIT_GRACE).await?;
        Ok(())
    }

    async fn crd_exists(&self, name: &str) -> Result<bool, ClusterError> {
        match self
            .run(owned(&["get", "customresourcedefinition", name, "-o", "name"]), None)
            .await
        {
            Ok(_) => Ok(true),
            Err(ClusterError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn node_summary(&self) -> Result<NodeSummary, ClusterError> {
        let nodes = self.get_json(owned(&["get", "nodes", "-o", "json"])).await?;
        Ok(parse_node_summary(&nodes))
    }

    async fn exec_in_pod(
        &self,
        namespace: &str,
        pod: &str,
        container: Option<&str>,
        command: &[String],
    ) -> Result<ExecOutput, ClusterError> {
        let mut args = owned(&["exec", "-n", namespace, pod]);
        if let Some(container) = container {
            args.extend(["-c".to_string(), container.to_string()]);
        }
        args.push("--".to_string());
        args.extend(command.iter().cloned());

        let output = self.output(&args, None, self.timeout).await?;
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        // kubectl's own failures are reported as errors; the command's
        // non-zero exit is a result.
        if !output.status.success()
            && (stderr.starts_with("Error from server") || stderr.starts_with("error:"))
        {
            return Err(classify_stderr(&stderr));
        }
        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr,
        })
    }
}
