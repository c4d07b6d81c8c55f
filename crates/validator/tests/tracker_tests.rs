//! Resource tracker integration tests against the mock cluster.
//!
//! Covers dependency-ordered deletion, cleanup idempotence, forced
//! finalizer removal, dependency cycles, failed predecessors, and
//! reconciliation of unconfirmed creates.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::indexing_slicing)]

use common::types::EnvironmentId;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use validator::cluster::{ClusterClient, ClusterError, ObjectSpec, ResourceKind, ResourceRef};
use validator::tracker::{ResourceState, ResourceTracker, TrackError, TrackedResource};
use validator_test_utils::{fast_cleanup_config, fast_resilience, ClusterOp, MockCluster};

const NS: &str = "validation-test";

fn tracker(cluster: &MockCluster) -> ResourceTracker {
    ResourceTracker::new(cluster.client(), fast_resilience(), fast_cleanup_config())
}

fn namespaced(kind: ResourceKind, name: &str) -> ResourceRef {
    ResourceRef::namespaced(kind, NS, name)
}

/// Create the resource on the cluster and track it.
async fn provision(cluster: &MockCluster, tracker: &ResourceTracker, resource: TrackedResource) {
    cluster
        .create(&ObjectSpec::new(resource.id.clone()))
        .await
        .unwrap();
    tracker.track(resource).await.unwrap();
}

fn position(log: &[ResourceRef], id: &ResourceRef) -> usize {
    log.iter()
        .position(|r| r == id)
        .unwrap_or_else(|| panic!("{id} was never deleted"))
}

#[tokio::test(start_paused = true)]
async fn test_cleanup_respects_dependency_order() {
    let cluster = MockCluster::new();
    let tracker = tracker(&cluster);
    let owner = EnvironmentId::new();

    let ns = ResourceRef::namespace(NS);
    let quota = namespaced(ResourceKind::ResourceQuota, "validation-quota");
    let web = namespaced(ResourceKind::Deployment, "web");
    let config = namespaced(ResourceKind::ConfigMap, "web-config");
    let secret = namespaced(ResourceKind::Secret, "web-tls");
    let service = namespaced(ResourceKind::Service, "web");
    let data = namespaced(ResourceKind::PersistentVolumeClaim, "data");

    provision(&cluster, &tracker, TrackedResource::new(ns.clone(), owner)).await;
    provision(&cluster, &tracker, TrackedResource::new(quota.clone(), owner)).await;
    // The service goes before the secret it references.
    provision(
        &cluster,
        &tracker,
        TrackedResource::new(secret.clone(), owner).after(service.clone()),
    )
    .await;
    provision(&cluster, &tracker, TrackedResource::new(config.clone(), owner)).await;
    provision(&cluster, &tracker, TrackedResource::new(service.clone(), owner)).await;
    provision(&cluster, &tracker, TrackedResource::new(data.clone(), owner)).await;
    provision(&cluster, &tracker, TrackedResource::new(web.clone(), owner)).await;

    let report = tracker.cleanup().await;
    assert!(report.is_clean(), "{:?}", report.messages);

    let log = cluster.deletion_log();
    assert_eq!(log.len(), 7);
    assert_eq!(log.last(), Some(&ns));
    assert!(position(&log, &web) < position(&log, &config));
    assert!(position(&log, &web) < position(&log, &data));
    assert!(position(&log, &service) < position(&log, &secret));
    assert!(position(&log, &data) < position(&log, &quota));
    assert!(position(&log, &quota) < position(&log, &ns));

    for id in [&ns, &quota, &web, &config, &secret, &service, &data] {
        assert_eq!(tracker.state_of(id).await, Some(ResourceState::Deleted));
    }
    assert!(tracker.status().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cleanup_twice_is_a_no_op() {
    let cluster = MockCluster::new();
    let tracker = tracker(&cluster);
    let owner = EnvironmentId::new();
    provision(&cluster, &tracker, TrackedResource::new(ResourceRef::namespace(NS), owner)).await;
    provision(
        &cluster,
        &tracker,
        TrackedResource::new(namespaced(ResourceKind::ConfigMap, "cm"), owner),
    )
    .await;

    let first = tracker.cleanup().await;
    assert_eq!(first.deleted.len(), 2);
    let deletes = cluster.call_count(ClusterOp::Delete);

    let second = tracker.cleanup().await;
    assert!(second.is_clean());
    assert!(second.deleted.is_empty());
    assert_eq!(second.messages, vec!["nothing to clean up".to_string()]);
    assert_eq!(cluster.call_count(ClusterOp::Delete), deletes);
}

#[tokio::test(start_paused = true)]
async fn test_already_deleted_resources_count_as_deleted() {
    let cluster = MockCluster::new();
    let tracker = tracker(&cluster);
    let owner = EnvironmentId::new();
    let ns = ResourceRef::namespace(NS);
    provision(&cluster, &tracker, TrackedResource::new(ns.clone(), owner)).await;

    // Someone else removed it first.
    cluster.delete(&ns).await.unwrap();

    let report = tracker.cleanup().await;
    assert!(report.is_clean());
    assert_eq!(report.deleted, vec![ns.clone()]);
    assert_eq!(tracker.state_of(&ns).await, Some(ResourceState::Deleted));
}

#[tokio::test(start_paused = true)]
async fn test_stuck_finalizer_is_forced_and_reported_degraded() {
    let cluster = MockCluster::new().with_stuck_finalizers(ResourceKind::ConfigMap);
    let tracker = tracker(&cluster);
    let owner = EnvironmentId::new();
    let ns = ResourceRef::namespace(NS);
    let cm = namespaced(ResourceKind::ConfigMap, "held");
    provision(&cluster, &tracker, TrackedResource::new(ns.clone(), owner)).await;
    provision(&cluster, &tracker, TrackedResource::new(cm.clone(), owner)).await;

    let report = tracker.cleanup().await;

    assert!(report.failed.is_empty(), "{:?}", report.failed);
    assert_eq!(report.degraded, vec![cm.clone()]);
    assert!(report.is_degraded());
    assert!(report.degraded_error().is_some());
    assert_eq!(cluster.call_count(ClusterOp::RemoveFinalizers), 1);
    assert!(!cluster.exists(&cm));
    assert!(!cluster.exists(&ns));
    assert_eq!(cluster.deletion_log(), vec![cm, ns]);
}

#[tokio::test(start_paused = true)]
async fn test_transient_delete_failures_are_retried() {
    let cluster = MockCluster::new()
        .fail_next(ClusterOp::Delete, ClusterError::Unavailable("503".to_string()))
        .fail_next(ClusterOp::Delete, ClusterError::Timeout("i/o timeout".to_string()));
    let tracker = tracker(&cluster);
    let ns = ResourceRef::namespace(NS);
    provision(&cluster, &tracker, TrackedResource::new(ns.clone(), EnvironmentId::new())).await;

    let report = tracker.cleanup().await;
    assert!(report.is_clean());
    assert_eq!(cluster.call_count(ClusterOp::Delete), 3);
    assert!(!cluster.exists(&ns));
}

#[tokio::test(start_paused = true)]
async fn test_permanent_delete_failure_is_reported_not_raised() {
    let cluster = MockCluster::new()
        .fail_always(ClusterOp::Delete, ClusterError::Forbidden("rbac".to_string()));
    let tracker = tracker(&cluster);
    let owner = EnvironmentId::new();
    let cm = namespaced(ResourceKind::ConfigMap, "cm");
    provision(&cluster, &tracker, TrackedResource::new(ResourceRef::namespace(NS), owner)).await;
    provision(&cluster, &tracker, TrackedResource::new(cm.clone(), owner)).await;

    let report = tracker.cleanup().await;
    assert!(report.failed.iter().any(|(id, _)| *id == cm));
    assert!(cluster.exists(&cm));
    assert_eq!(tracker.state_of(&cm).await, Some(ResourceState::Failed));
    // Forbidden deletes are not forced.
    assert_eq!(cluster.call_count(ClusterOp::RemoveFinalizers), 0);

    // Once the cluster recovers, a second pass finishes the job.
    cluster.heal(ClusterOp::Delete);
    let retry = tracker.cleanup().await;
    assert!(retry.failed.is_empty(), "{:?}", retry.failed);
    assert!(cluster.objects().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unconfirmed_creates_are_reconciled() {
    let cluster = MockCluster::new();
    let tracker = tracker(&cluster);
    let owner = EnvironmentId::new();
    let never = ResourceRef::namespace("validation-never");
    let landed = ResourceRef::namespace("validation-landed");

    tracker
        .track_pending(TrackedResource::new(never.clone(), owner))
        .await
        .unwrap();
    tracker
        .track_pending(TrackedResource::new(landed.clone(), owner))
        .await
        .unwrap();
    // The create landed even though its response was lost.
    cluster.create(&ObjectSpec::new(landed.clone())).await.unwrap();
    tracker.mark_failed(&landed).await.unwrap();

    let report = tracker.cleanup().await;
    assert!(report.is_clean());
    assert_eq!(report.deleted, vec![landed.clone()]);
    assert!(report
        .messages
        .iter()
        .any(|m| m.contains("was never created")));
    assert!(!cluster.exists(&landed));
    assert_eq!(tracker.state_of(&never).await, Some(ResourceState::Deleted));
}

#[tokio::test(start_paused = true)]
async fn test_cleanup_scoped_to_owner() {
    let cluster = MockCluster::new();
    let tracker = tracker(&cluster);
    let mine = EnvironmentId::new();
    let theirs = EnvironmentId::new();
    let a = ResourceRef::namespace("validation-a");
    let b = ResourceRef::namespace("validation-b");
    provision(&cluster, &tracker, TrackedResource::new(a.clone(), mine)).await;
    provision(&cluster, &tracker, TrackedResource::new(b.clone(), theirs)).await;

    let report = tracker.cleanup_owned_by(mine).await;
    assert_eq!(report.deleted, vec![a.clone()]);
    assert!(!cluster.exists(&a));
    assert!(cluster.exists(&b));
}

#[tokio::test]
async fn test_live_resource_cannot_change_owner() {
    let cluster = MockCluster::new();
    let tracker = tracker(&cluster);
    let ns = ResourceRef::namespace(NS);
    tracker
        .track(TrackedResource::new(ns.clone(), EnvironmentId::new()))
        .await
        .unwrap();

    let err = tracker
        .track(TrackedResource::new(ns, EnvironmentId::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, TrackError::OwnedElsewhere { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_failed_delete_leaves_dependents_in_place() {
    let cluster = MockCluster::new()
        .fail_next(ClusterOp::Delete, ClusterError::Forbidden("rbac".to_string()));
    let tracker = tracker(&cluster);
    let owner = EnvironmentId::new();
    let ns = ResourceRef::namespace(NS);
    let cm = namespaced(ResourceKind::ConfigMap, "cm");
    provision(&cluster, &tracker, TrackedResource::new(ns.clone(), owner)).await;
    provision(&cluster, &tracker, TrackedResource::new(cm.clone(), owner)).await;

    let report = tracker.cleanup().await;

    assert!(report.degraded.is_empty());
    assert!(report.deleted.is_empty());
    let failed: Vec<&ResourceRef> = report.failed.iter().map(|(id, _)| id).collect();
    assert_eq!(failed, vec![&cm, &ns]);
    assert!(report
        .messages
        .iter()
        .any(|m| m == &format!("{ns} not deleted: blocked by {cm}")));
    // The namespace delete would have cascaded to the config map.
    assert!(cluster.exists(&ns));
    assert!(cluster.exists(&cm));
    assert!(cluster.deletion_log().is_empty());
    assert_eq!(cluster.call_count(ClusterOp::RemoveFinalizers), 0);
    assert_eq!(tracker.state_of(&ns).await, Some(ResourceState::Failed));

    let retry = tracker.cleanup().await;
    assert!(retry.is_clean(), "{:?}", retry.failed);
    assert_eq!(cluster.deletion_log(), vec![cm.clone(), ns.clone()]);
    assert_eq!(tracker.state_of(&ns).await, Some(ResourceState::Deleted));
}

#[tokio::test(start_paused = true)]
async fn test_dependency_cycle_is_forced_and_reported_degraded() {
    let cluster = MockCluster::new();
    let tracker = tracker(&cluster);
    let owner = EnvironmentId::new();
    let ns = ResourceRef::namespace(NS);
    let left = namespaced(ResourceKind::ConfigMap, "left");
    let right = namespaced(ResourceKind::ConfigMap, "right");
    provision(&cluster, &tracker, TrackedResource::new(ns.clone(), owner)).await;
    provision(
        &cluster,
        &tracker,
        TrackedResource::new(left.clone(), owner).after(right.clone()),
    )
    .await;
    provision(
        &cluster,
        &tracker,
        TrackedResource::new(right.clone(), owner).after(left.clone()),
    )
    .await;

    let report = tracker.cleanup().await;

    assert!(report.failed.is_empty(), "{:?}", report.failed);
    assert_eq!(report.degraded, vec![left.clone(), right.clone()]);
    // The namespace only waited on the cycle; it goes the normal way.
    assert!(!report.degraded.contains(&ns));
    assert_eq!(cluster.deletion_log(), vec![left.clone(), right.clone(), ns.clone()]);
    for id in [&ns, &left, &right] {
        assert_eq!(tracker.state_of(id).await, Some(ResourceState::Deleted));
    }
}

#[tokio::test(start_paused = true)]
async fn test_deletion_order_does_not_depend_on_tracking_order() {
    let owner = EnvironmentId::new();
    let ns = ResourceRef::namespace(NS);
    let quota = namespaced(ResourceKind::ResourceQuota, "validation-quota");
    let web = namespaced(ResourceKind::Deployment, "web");
    let worker = namespaced(ResourceKind::Job, "worker");
    let config = namespaced(ResourceKind::ConfigMap, "web-config");
    let secret = namespaced(ResourceKind::Secret, "web-tls");
    let service = namespaced(ResourceKind::Service, "web");
    let data = namespaced(ResourceKind::PersistentVolumeClaim, "data");

    let resources = vec![
        TrackedResource::new(ns.clone(), owner),
        TrackedResource::new(quota.clone(), owner),
        TrackedResource::new(web.clone(), owner),
        // The worker must outlive the web deployment.
        TrackedResource::new(worker.clone(), owner).after(web.clone()),
        TrackedResource::new(config.clone(), owner),
        TrackedResource::new(secret.clone(), owner).after(service.clone()),
        TrackedResource::new(service.clone(), owner),
        TrackedResource::new(data.clone(), owner),
    ];
    let edges = [
        (&web, &worker),
        (&service, &secret),
        (&web, &config),
        (&worker, &data),
        (&data, &quota),
        (&config, &ns),
        (&secret, &ns),
        (&quota, &ns),
    ];

    for seed in 0..16 {
        let cluster = MockCluster::new();
        let tracker = tracker(&cluster);
        for resource in &resources {
            cluster
                .create(&ObjectSpec::new(resource.id.clone()))
                .await
                .unwrap();
        }
        let mut shuffled = resources.clone();
        shuffled.shuffle(&mut StdRng::seed_from_u64(seed));
        for resource in shuffled {
            tracker.track(resource).await.unwrap();
        }

        let report = tracker.cleanup().await;
        assert!(report.is_clean(), "seed {seed}: {:?}", report.messages);

        let log = cluster.deletion_log();
        assert_eq!(log.len(), resources.len(), "seed {seed}");
        for (first, then) in edges {
            assert!(
                position(&log, first) < position(&log, then),
                "seed {seed}: {first} must go before {then} in {log:?}"
            );
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_slow_teardown_does_not_stall_other_environments() {
    let cluster = MockCluster::new().with_stuck_finalizers(ResourceKind::ConfigMap);
    let tracker = Arc::new(tracker(&cluster));
    let first = EnvironmentId::new();
    let second = EnvironmentId::new();
    let held = namespaced(ResourceKind::ConfigMap, "held");
    let other = ResourceRef::namespace("validation-other");
    provision(&cluster, &tracker, TrackedResource::new(ResourceRef::namespace(NS), first)).await;
    provision(&cluster, &tracker, TrackedResource::new(held.clone(), first)).await;

    let teardown = tokio::spawn({
        let tracker = Arc::clone(&tracker);
        async move { tracker.cleanup_owned_by(first).await }
    });
    // The delete is accepted and the pass now waits on the finalizer.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(tracker.state_of(&held).await, Some(ResourceState::Deleting));

    let started = Instant::now();
    tracker
        .track(TrackedResource::new(other.clone(), second))
        .await
        .unwrap();
    let status = tracker.status().await;
    assert!(started.elapsed() < Duration::from_millis(100));
    assert!(!teardown.is_finished());
    assert!(status
        .get(&ResourceKind::Namespace)
        .is_some_and(|names| names.contains(&other.name)));

    let report = teardown.await.unwrap();
    assert_eq!(report.degraded, vec![held]);
    assert_eq!(tracker.state_of(&other).await, Some(ResourceState::Created));
}

#[tokio::test(start_paused = true)]
async fn test_forgotten_resource_is_left_alone() {
    let cluster = MockCluster::new().with_namespace(NS);
    let tracker = tracker(&cluster);
    let ns = ResourceRef::namespace(NS);
    tracker
        .track_pending(TrackedResource::new(ns.clone(), EnvironmentId::new()))
        .await
        .unwrap();
    tracker.forget(&ns).await.unwrap();

    let report = tracker.cleanup().await;
    assert_eq!(report.messages, vec!["nothing to clean up".to_string()]);
    assert!(cluster.exists(&ns));
    assert_eq!(tracker.state_of(&ns).await, None);
    assert!(matches!(
        tracker.forget(&ns).await,
        Err(TrackError::Unknown(_))
    ));
}
