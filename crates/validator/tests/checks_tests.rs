//! Built-in checks run through the full pipeline against the mock cluster.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::indexing_slicing)]

use common::error::ErrorKind;
use common::types::{CheckStatus, Phase, Severity};
use serde_json::json;
use std::time::Duration;
use validator::checks::CheckRegistry;
use validator::cluster::{ClusterError, ResourceKind, ResourceRef};
use validator::config::CheckSpec;
use validator::reporter::{CheckResult, EXIT_PASS};
use validator::runner::{RunOutcome, RunRequest, Runner};
use validator_test_utils::{fast_config, pipeline, small_quota, MockCluster, TestCheck};

const PHASE: Phase = Phase::PreDeployment;

async fn run_builtin(cluster: &MockCluster, specs: Vec<CheckSpec>) -> RunOutcome {
    let runner = Runner::new(
        fast_config(PHASE),
        pipeline(PHASE, specs),
        CheckRegistry::with_builtin_checks(),
        cluster.client(),
    );
    runner.run(RunRequest::new(PHASE)).await
}

fn only(outcome: &RunOutcome) -> &CheckResult {
    assert_eq!(outcome.report.checks.len(), 1);
    &outcome.report.checks[0]
}

#[tokio::test(start_paused = true)]
async fn test_api_reachable() {
    let cluster = MockCluster::new().with_namespace("default");
    let outcome = run_builtin(
        &cluster,
        vec![TestCheck::new("cluster.api-reachable").severity(Severity::Critical).build()],
    )
    .await;

    let result = only(&outcome);
    assert_eq!(result.status, CheckStatus::Pass);
    assert_eq!(result.details.get("namespaces"), Some(&json!(1)));
    assert_eq!(outcome.exit_code, EXIT_PASS);
}

#[tokio::test(start_paused = true)]
async fn test_api_unreachable_is_an_error() {
    let cluster = MockCluster::new().fail_always(
        validator_test_utils::ClusterOp::List,
        ClusterError::Unauthorized("token expired".to_string()),
    );
    let outcome = run_builtin(
        &cluster,
        vec![TestCheck::new("cluster.api-reachable").severity(Severity::Critical).build()],
    )
    .await;

    let result = only(&outcome);
    assert_eq!(result.status, CheckStatus::Error);
    assert_eq!(result.error_kind, Some(ErrorKind::Permanent));
    // Permanent errors are not retried.
    assert_eq!(cluster.call_count(validator_test_utils::ClusterOp::List), 1);
    assert_ne!(outcome.exit_code, EXIT_PASS);
}

#[tokio::test(start_paused = true)]
async fn test_node_capacity_within_limits() {
    let cluster = MockCluster::new().with_nodes(3, 6000, 16 * 1024);
    let outcome = run_builtin(
        &cluster,
        vec![TestCheck::new("cluster.node-capacity")
            .param("min_nodes", 3)
            .param("min_cpu_millis", 4000)
            .param("min_memory_mib", 8192)
            .build()],
    )
    .await;

    let result = only(&outcome);
    assert_eq!(result.status, CheckStatus::Pass, "{}", result.message);
    assert_eq!(
        result.details.get("capacity"),
        Some(&json!({
            "ready_nodes": 3,
            "allocatable_cpu_millis": 6000,
            "allocatable_memory_mib": 16384,
        }))
    );
}

#[tokio::test(start_paused = true)]
async fn test_node_capacity_shortfall_lists_each_limit() {
    let cluster = MockCluster::new().with_nodes(2, 3000, 4096);
    let outcome = run_builtin(
        &cluster,
        vec![TestCheck::new("cluster.node-capacity")
            .severity(Severity::High)
            .param("min_nodes", 3)
            .param("min_cpu_millis", 2000)
            .param("min_memory_mib", 8192)
            .build()],
    )
    .await;

    let result = only(&outcome);
    assert_eq!(result.status, CheckStatus::Fail);
    assert_eq!(
        result.details.get("shortfalls"),
        Some(&json!([
            "2 ready nodes < 3",
            "4096Mi allocatable memory < 8192Mi"
        ]))
    );
    assert_eq!(
        outcome.report.recommendations,
        vec!["review failing cluster checks: cluster.node-capacity".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn test_deployments_ready_lists_namespace_when_unnamed() {
    let cluster = MockCluster::new()
        .with_deployment("shop", "web", true)
        .with_deployment("shop", "worker", true);
    let outcome = run_builtin(
        &cluster,
        vec![TestCheck::new("services.deployments-ready")
            .param("namespace", "shop")
            .build()],
    )
    .await;

    assert_eq!(only(&outcome).status, CheckStatus::Pass);
}

#[tokio::test(start_paused = true)]
async fn test_deployments_ready_fails_on_empty_namespace() {
    let cluster = MockCluster::new().with_namespace("empty");
    let outcome = run_builtin(
        &cluster,
        vec![TestCheck::new("services.deployments-ready")
            .param("namespace", "empty")
            .build()],
    )
    .await;

    let result = only(&outcome);
    assert_eq!(result.status, CheckStatus::Fail);
    assert!(result.message.contains("no deployments found"));
}

#[tokio::test(start_paused = true)]
async fn test_deployments_ready_waits_for_rollout() {
    let cluster = MockCluster::new()
        .with_deployment("shop", "web", true)
        .with_deployment("shop", "api", false);

    let rollout = cluster.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(3)).await;
        rollout.set_ready(
            &ResourceRef::namespaced(ResourceKind::Deployment, "shop", "api"),
            true,
        );
    });

    let outcome = run_builtin(
        &cluster,
        vec![TestCheck::new("services.deployments-ready")
            .param("namespace", "shop")
            .param("deployments", json!(["web", "api"]))
            .param("wait_seconds", 30)
            .build()],
    )
    .await;

    assert_eq!(only(&outcome).status, CheckStatus::Pass);
}

#[tokio::test(start_paused = true)]
async fn test_deployments_ready_reports_missing_deployment() {
    let cluster = MockCluster::new().with_deployment("shop", "web", true);
    let outcome = run_builtin(
        &cluster,
        vec![TestCheck::new("services.deployments-ready")
            .param("namespace", "shop")
            .param("deployments", json!(["web", "cart"]))
            .build()],
    )
    .await;

    let result = only(&outcome);
    assert_eq!(result.status, CheckStatus::Fail);
    assert_eq!(result.details.get("unready"), Some(&json!(["cart (missing)"])));
}

#[tokio::test(start_paused = true)]
async fn test_provisioning_round_trips_and_cleans_up() {
    let cluster = MockCluster::new();
    let outcome = run_builtin(
        &cluster,
        vec![TestCheck::new("environment.provisioning")
            .severity(Severity::Critical)
            .dedicated()
            .quota(small_quota())
            .build()],
    )
    .await;

    let result = only(&outcome);
    assert_eq!(result.status, CheckStatus::Pass, "{}", result.message);
    let namespace = result.details.get("namespace").and_then(|v| v.as_str()).unwrap();
    assert!(namespace.starts_with("validation-"));
    assert!(cluster
        .created_log()
        .iter()
        .any(|id| id.kind == ResourceKind::ConfigMap && id.name == "validation-probe"));
    assert!(cluster.objects().is_empty());
    assert!(cluster.namespaces().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_provisioning_rejected_create_is_an_error() {
    let cluster = MockCluster::new().fail_creates_of(
        ResourceKind::ConfigMap,
        ClusterError::Forbidden("configmaps is forbidden".to_string()),
    );
    let outcome = run_builtin(
        &cluster,
        vec![TestCheck::new("environment.provisioning").dedicated().build()],
    )
    .await;

    let result = only(&outcome);
    assert_eq!(result.status, CheckStatus::Error);
    assert_eq!(result.error_kind, Some(ErrorKind::Permanent));
    assert!(cluster.namespaces().is_empty());
}

#[tokio::test]
async fn test_manifests_parse_reports_invalid_files() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("good.yaml"),
        "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n---\napiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: b\n",
    )
    .unwrap();
    std::fs::write(dir.path().join("nameless.yaml"), "apiVersion: v1\nkind: Service\n").unwrap();
    std::fs::write(dir.path().join("broken.json"), "{ \"kind\": ").unwrap();
    std::fs::write(dir.path().join("README.md"), "not a manifest").unwrap();

    let cluster = MockCluster::new();
    let outcome = run_builtin(
        &cluster,
        vec![TestCheck::new("config.manifests-parse")
            .param("paths", dir.path().display().to_string())
            .build()],
    )
    .await;

    let result = only(&outcome);
    assert_eq!(result.status, CheckStatus::Fail);
    assert_eq!(result.details.get("files"), Some(&json!(3)));
    assert_eq!(result.details.get("documents"), Some(&json!(2)));
    let invalid = result.details.get("invalid_files").and_then(|v| v.as_array()).unwrap();
    assert_eq!(invalid.len(), 2);
    assert_eq!(
        outcome.report.recommendations,
        vec!["2 invalid configuration files".to_string()]
    );
}

#[tokio::test]
async fn test_manifests_parse_without_paths_is_a_configuration_error() {
    let cluster = MockCluster::new();
    let outcome = run_builtin(&cluster, vec![TestCheck::new("config.manifests-parse").build()]).await;

    let result = only(&outcome);
    assert_eq!(result.status, CheckStatus::Error);
    assert_eq!(result.error_kind, Some(ErrorKind::Configuration));
}
