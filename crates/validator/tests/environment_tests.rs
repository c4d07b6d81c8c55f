//! Test environment lifecycle against the mock cluster.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::indexing_slicing)]

use common::error::{ErrorKind, ValidationError};
use validator::cluster::{ClusterClient, ClusterError, ObjectSpec, ResourceKind, ResourceRef};
use validator::environment::{EnvironmentState, QuotaSpec, MANAGED_BY_LABEL, QUOTA_NAME};
use validator_test_utils::{small_quota, test_environment, ClusterOp, MockCluster};

#[tokio::test(start_paused = true)]
async fn test_setup_provisions_namespace_and_quota() {
    let cluster = MockCluster::new();
    let (env, _tracker) = test_environment(cluster.client(), small_quota());

    env.setup().await.unwrap();

    assert_eq!(env.state(), EnvironmentState::Ready);
    assert!(env.namespace().starts_with("validation-"));
    let ns = env.namespace_ref();
    let quota = ResourceRef::namespaced(ResourceKind::ResourceQuota, env.namespace(), QUOTA_NAME);
    assert!(cluster.exists(&ns));
    assert!(cluster.exists(&quota));
    assert_eq!(
        cluster
            .labels(&ns)
            .unwrap()
            .get(MANAGED_BY_LABEL)
            .map(String::as_str),
        Some("deploy-validator")
    );

    // Setup on a ready environment does nothing.
    let creates = cluster.call_count(ClusterOp::Create);
    env.setup().await.unwrap();
    assert_eq!(cluster.call_count(ClusterOp::Create), creates);
}

#[tokio::test(start_paused = true)]
async fn test_empty_quota_creates_no_quota_object() {
    let cluster = MockCluster::new();
    let (env, _tracker) = test_environment(cluster.client(), QuotaSpec::default());

    env.setup().await.unwrap();
    assert_eq!(cluster.created_log(), vec![env.namespace_ref()]);
}

#[tokio::test(start_paused = true)]
async fn test_setup_waits_for_namespace_to_become_active() {
    let cluster = MockCluster::new().with_namespace_ready_after(5);
    let (env, _tracker) = test_environment(cluster.client(), small_quota());

    env.setup().await.unwrap();
    assert_eq!(env.state(), EnvironmentState::Ready);
    assert!(cluster.call_count(ClusterOp::Get) >= 5);
}

#[tokio::test(start_paused = true)]
async fn test_transient_create_failures_are_retried() {
    let cluster = MockCluster::new()
        .fail_next(ClusterOp::Create, ClusterError::Unavailable("503".to_string()))
        .fail_next(ClusterOp::Create, ClusterError::Conflict("etcd".to_string()));
    let (env, _tracker) = test_environment(cluster.client(), small_quota());

    env.setup().await.unwrap();
    // Two failed attempts, then the namespace and the quota.
    assert_eq!(cluster.call_count(ClusterOp::Create), 4);
}

#[tokio::test(start_paused = true)]
async fn test_setup_timeout_still_tears_down() {
    let cluster = MockCluster::new().with_namespaces_never_ready();
    let (env, tracker) = test_environment(cluster.client(), small_quota());

    let err = env.setup().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(env.state(), EnvironmentState::Closed);
    assert!(cluster.namespaces().is_empty(), "{:?}", cluster.objects());
    assert!(tracker.status().await.is_empty());

    let summary = env.summary();
    assert!(summary.setup_error.is_some());
    assert!(summary.cleanup.is_some_and(|c| c.failed.is_empty()));

    // A second setup reports the original failure without touching the cluster.
    let creates = cluster.call_count(ClusterOp::Create);
    let again = env.setup().await.unwrap_err();
    assert_eq!(again.kind(), ErrorKind::Timeout);
    assert_eq!(cluster.call_count(ClusterOp::Create), creates);
}

#[tokio::test(start_paused = true)]
async fn test_quota_failure_removes_namespace() {
    let cluster = MockCluster::new()
        .fail_creates_of(ResourceKind::ResourceQuota, ClusterError::BadRequest("bad limits".to_string()));
    let (env, _tracker) = test_environment(cluster.client(), small_quota());

    let err = env.setup().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Permanent);
    assert!(!cluster.exists(&env.namespace_ref()));
}

#[tokio::test(start_paused = true)]
async fn test_teardown_deletes_created_resources_before_namespace() {
    let cluster = MockCluster::new();
    let (env, _tracker) = test_environment(cluster.client(), small_quota());
    env.setup().await.unwrap();

    let db = ResourceRef::namespaced(ResourceKind::StatefulSet, env.namespace(), "db");
    let data = ResourceRef::namespaced(ResourceKind::PersistentVolumeClaim, env.namespace(), "data");
    env.create_resource(ObjectSpec::new(data.clone()), None)
        .await
        .unwrap();
    env.create_resource(ObjectSpec::new(db.clone()), None)
        .await
        .unwrap();

    let report = env.teardown().await;
    assert!(report.is_clean(), "{:?}", report.messages);
    assert_eq!(env.state(), EnvironmentState::Closed);

    let log = cluster.deletion_log();
    assert_eq!(log.first(), Some(&db));
    assert_eq!(log.last(), Some(&env.namespace_ref()));
    assert!(cluster.objects().is_empty());

    // Teardown is idempotent and returns the same report.
    let deletes = cluster.call_count(ClusterOp::Delete);
    let again = env.teardown().await;
    assert_eq!(again.deleted, report.deleted);
    assert_eq!(cluster.call_count(ClusterOp::Delete), deletes);
}

#[tokio::test(start_paused = true)]
async fn test_existing_object_is_not_adopted() {
    let cluster = MockCluster::new();
    let (env, tracker) = test_environment(cluster.client(), small_quota());
    env.setup().await.unwrap();

    let theirs = ResourceRef::namespaced(ResourceKind::ConfigMap, env.namespace(), "theirs");
    cluster.create(&ObjectSpec::new(theirs.clone())).await.unwrap();
    let creates = cluster.call_count(ClusterOp::Create);

    let err = env
        .create_resource(ObjectSpec::new(theirs.clone()), None)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Permanent);
    assert!(err.to_string().contains("not created by this environment"));
    // Not retried, not tracked.
    assert_eq!(cluster.call_count(ClusterOp::Create), creates + 1);
    assert_eq!(tracker.state_of(&theirs).await, None);

    let report = env.teardown().await;
    assert!(report.is_clean(), "{:?}", report.messages);
    assert!(!report.deleted.contains(&theirs));
    // Only the quota and the namespace were deleted directly.
    assert_eq!(cluster.call_count(ClusterOp::Delete), 2);
}

#[tokio::test(start_paused = true)]
async fn test_create_that_landed_before_a_timeout_is_adopted() {
    let cluster = MockCluster::new();
    let (env, _tracker) = test_environment(cluster.client(), small_quota());
    env.setup().await.unwrap();

    // The first response is lost, but the object made it.
    let cm = ResourceRef::namespaced(ResourceKind::ConfigMap, env.namespace(), "cm");
    cluster.create(&ObjectSpec::new(cm.clone())).await.unwrap();
    let _ = cluster
        .clone()
        .fail_next(ClusterOp::Create, ClusterError::Timeout("i/o timeout".to_string()));

    let created = env
        .create_resource(ObjectSpec::new(cm.clone()), None)
        .await
        .unwrap();
    assert_eq!(created, cm);

    let report = env.teardown().await;
    assert!(report.deleted.contains(&cm), "{:?}", report.messages);
    assert!(cluster.objects().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_create_resource_requires_ready_environment() {
    let cluster = MockCluster::new();
    let (env, _tracker) = test_environment(cluster.client(), small_quota());
    let cm = ObjectSpec::new(ResourceRef::namespaced(
        ResourceKind::ConfigMap,
        env.namespace(),
        "early",
    ));

    let err = env.create_resource(cm, None).await.unwrap_err();
    assert!(matches!(err, ValidationError::Configuration(_)));
    assert!(cluster.created_log().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_create_resource_rejects_foreign_namespace() {
    let cluster = MockCluster::new();
    let (env, _tracker) = test_environment(cluster.client(), small_quota());
    env.setup().await.unwrap();

    let foreign = ObjectSpec::new(ResourceRef::namespaced(ResourceKind::ConfigMap, "kube-system", "x"));
    let err = env.create_resource(foreign, None).await.unwrap_err();
    assert!(matches!(err, ValidationError::Configuration(_)));

    env.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn test_validate_dependencies() {
    let cluster = MockCluster::new().with_crd("certificates.cert-manager.io");
    let (env, _tracker) = test_environment(cluster.client(), QuotaSpec::default());

    assert!(env
        .validate_dependencies(&["crd:certificates.cert-manager.io".parse().unwrap()])
        .await
        .unwrap());
    assert!(!env
        .validate_dependencies(&["crd:issuers.cert-manager.io".parse().unwrap(), "min-nodes:10".parse().unwrap()])
        .await
        .unwrap());
}
