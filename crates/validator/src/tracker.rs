//! Resource tracker: inventory of everything a run provisions, and ordered teardown.
//!
//! The tracker is the single owner of [`TrackedResource`] state. It is shared
//! by all environments of a run. The inventory lock is held only to read or
//! update state, never across a cluster call, so one environment's slow
//! teardown does not stall another's `track` or `status`. Concurrent cleanup
//! passes claim disjoint resources.
//!
//! # Deletion order
//!
//! A resource is deleted only after all of its predecessors are gone:
//!
//! - explicit edges declared with [`TrackedResource::after`]
//! - implicit edges within one scope: lower [`ResourceKind::teardown_rank`]
//!   first, so workloads go before volume claims and everything goes before
//!   its namespace
//!
//! Cleanup repeatedly deletes every resource whose predecessors are gone.
//! A resource behind a predecessor that failed to delete is left in place
//! and reported failed. Only members of a dependency cycle are
//! force-deleted: finalizers stripped, delete reissued. The same forced path
//! handles a deletion that was accepted but never completed. Forced
//! deletions are reported as degraded, not failed.

use crate::cluster::{ClusterClient, ClusterError, ResourceKind, ResourceRef};
use crate::observability::metrics;
use crate::resilience::{poll_until, PollConfig, Resilience};
use chrono::{DateTime, Utc};
use common::error::{ErrorKind, ValidationError};
use common::types::EnvironmentId;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

/// Default bound on waiting for an accepted deletion to complete.
pub const DEFAULT_DELETE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default first delay between "is it gone yet" probes.
pub const DEFAULT_DELETE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Lifecycle of a tracked resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    /// Create requested, not yet confirmed.
    Pending,
    Created,
    Deleting,
    Deleted,
    /// Create or delete failed; reconciled on the next cleanup.
    Failed,
}

/// One externally-provisioned object.
#[derive(Debug, Clone, Serialize)]
pub struct TrackedResource {
    pub id: ResourceRef,
    pub owner: EnvironmentId,
    /// Resources that must be deleted before this one.
    pub deleted_after: BTreeSet<ResourceRef>,
    pub created_at: DateTime<Utc>,
    pub state: ResourceState,
}

impl TrackedResource {
    #[must_use]
    pub fn new(id: ResourceRef, owner: EnvironmentId) -> Self {
        Self {
            id,
            owner,
            deleted_after: BTreeSet::new(),
            created_at: Utc::now(),
            state: ResourceState::Created,
        }
    }

    /// Declare that `other` must be deleted before this resource.
    #[must_use]
    pub fn after(mut self, other: ResourceRef) -> Self {
        self.deleted_after.insert(other);
        self
    }
}

/// Tracker misuse.
#[derive(Debug, Error)]
pub enum TrackError {
    #[error("{resource} is already owned by environment {owner}")]
    OwnedElsewhere {
        resource: ResourceRef,
        owner: EnvironmentId,
    },

    #[error("{0} is not tracked")]
    Unknown(ResourceRef),
}

impl From<TrackError> for ValidationError {
    fn from(err: TrackError) -> Self {
        ValidationError::Configuration(err.to_string())
    }
}

/// Tracker tuning.
#[derive(Debug, Clone, Copy)]
pub struct CleanupConfig {
    /// Wait for an accepted deletion to complete.
    pub delete_poll: PollConfig,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            delete_poll: PollConfig::new(DEFAULT_DELETE_TIMEOUT, DEFAULT_DELETE_POLL_INTERVAL),
        }
    }
}

/// Result of one cleanup pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    /// Human-readable status lines, in deletion order.
    pub messages: Vec<String>,
    pub deleted: Vec<ResourceRef>,
    /// Deleted only after stripping finalizers.
    pub degraded: Vec<ResourceRef>,
    pub failed: Vec<(ResourceRef, String)>,
}

impl CleanupReport {
    /// Every in-scope resource ended deleted without forcing.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.degraded.is_empty() && self.failed.is_empty()
    }

    #[must_use]
    pub fn is_degraded(&self) -> bool {
        !self.degraded.is_empty()
    }

    /// Fold another report into this one.
    pub fn merge(&mut self, other: CleanupReport) {
        self.messages.extend(other.messages);
        self.deleted.extend(other.deleted);
        self.degraded.extend(other.degraded);
        self.failed.extend(other.failed);
    }

    /// The warning-level error to attach to a report, if forcing was needed.
    #[must_use]
    pub fn degraded_error(&self) -> Option<ValidationError> {
        if self.degraded.is_empty() {
            return None;
        }
        let names: Vec<String> = self.degraded.iter().map(ToString::to_string).collect();
        Some(ValidationError::CleanupDegraded(format!(
            "finalizers removed from {}",
            names.join(", ")
        )))
    }
}

enum Deletion {
    Deleted,
    Forced,
}

/// Shared inventory of provisioned resources.
pub struct ResourceTracker {
    client: Arc<dyn ClusterClient>,
    resilience: Arc<Resilience>,
    config: CleanupConfig,
    resources: Mutex<BTreeMap<ResourceRef, TrackedResource>>,
    /// Resources claimed by a running cleanup pass.
    in_flight: StdMutex<BTreeSet<ResourceRef>>,
}

impl std::fmt::Debug for ResourceTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceTracker")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ResourceTracker {
    #[must_use]
    pub fn new(
        client: Arc<dyn ClusterClient>,
        resilience: Arc<Resilience>,
        config: CleanupConfig,
    ) -> Self {
        Self {
            client,
            resilience,
            config,
            resources: Mutex::new(BTreeMap::new()),
            in_flight: StdMutex::new(BTreeSet::new()),
        }
    }

    /// Record a resource whose creation has been confirmed.
    ///
    /// # Errors
    ///
    /// `TrackError::OwnedElsewhere` if a live resource with the same identity
    /// belongs to another environment.
    pub async fn track(&self, resource: TrackedResource) -> Result<(), TrackError> {
        self.insert(resource, ResourceState::Created).await
    }

    /// Record a resource before its create call is issued.
    ///
    /// If the create call's outcome is never confirmed, cleanup probes the
    /// cluster and deletes the object if it exists.
    ///
    /// # Errors
    ///
    /// See [`ResourceTracker::track`].
    pub async fn track_pending(&self, resource: TrackedResource) -> Result<(), TrackError> {
        self.insert(resource, ResourceState::Pending).await
    }

    async fn insert(
        &self,
        mut resource: TrackedResource,
        state: ResourceState,
    ) -> Result<(), TrackError> {
        let mut resources = self.resources.lock().await;
        if let Some(existing) = resources.get(&resource.id) {
            if existing.owner != resource.owner && existing.state != ResourceState::Deleted {
                return Err(TrackError::OwnedElsewhere {
                    resource: resource.id,
                    owner: existing.owner,
                });
            }
        }
        resource.state = state;
        debug!(
            target: "validator.tracker",
            resource = %resource.id,
            owner = %resource.owner,
            state = ?state,
            "Tracking resource"
        );
        resources.insert(resource.id.clone(), resource);
        Ok(())
    }

    /// Confirm that a pending create succeeded.
    ///
    /// # Errors
    ///
    /// `TrackError::Unknown` if the resource was never tracked.
    pub async fn confirm(&self, id: &ResourceRef) -> Result<(), TrackError> {
        self.set_state(id, ResourceState::Created).await
    }

    /// Record that a create call failed. The object may still exist.
    ///
    /// # Errors
    ///
    /// `TrackError::Unknown` if the resource was never tracked.
    pub async fn mark_failed(&self, id: &ResourceRef) -> Result<(), TrackError> {
        self.set_state(id, ResourceState::Failed).await
    }

    /// Stop tracking a pending resource that turned out to belong to someone
    /// else. Cleanup never touches it.
    ///
    /// # Errors
    ///
    /// `TrackError::Unknown` if the resource was never tracked.
    pub async fn forget(&self, id: &ResourceRef) -> Result<(), TrackError> {
        let mut resources = self.resources.lock().await;
        resources
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| TrackError::Unknown(id.clone()))
    }

    async fn set_state(&self, id: &ResourceRef, state: ResourceState) -> Result<(), TrackError> {
        let mut resources = self.resources.lock().await;
        let resource = resources
            .get_mut(id)
            .ok_or_else(|| TrackError::Unknown(id.clone()))?;
        resource.state = state;
        Ok(())
    }

    /// Live (not deleted) resource names grouped by kind.
    pub async fn status(&self) -> BTreeMap<ResourceKind, Vec<String>> {
        let resources = self.resources.lock().await;
        let mut by_kind: BTreeMap<ResourceKind, Vec<String>> = BTreeMap::new();
        for resource in resources.values() {
            if resource.state == ResourceState::Deleted {
                continue;
            }
            let name = match &resource.id.namespace {
                Some(ns) => format!("{ns}/{}", resource.id.name),
                None => resource.id.name.clone(),
            };
            by_kind.entry(resource.id.kind).or_default().push(name);
        }
        by_kind
    }

    /// Copy of every tracked resource.
    pub async fn snapshot(&self) -> Vec<TrackedResource> {
        self.resources.lock().await.values().cloned().collect()
    }

    /// Current state of one resource.
    pub async fn state_of(&self, id: &ResourceRef) -> Option<ResourceState> {
        self.resources.lock().await.get(id).map(|r| r.state)
    }

    /// Tear down every tracked resource.
    pub async fn cleanup(&self) -> CleanupReport {
        self.cleanup_scope(None).await
    }

    /// Tear down the resources owned by one environment.
    pub async fn cleanup_owned_by(&self, owner: EnvironmentId) -> CleanupReport {
        self.cleanup_scope(Some(owner)).await
    }

    #[instrument(skip(self))]
    async fn cleanup_scope(&self, owner: Option<EnvironmentId>) -> CleanupReport {
        let mut report = CleanupReport::default();
        let claim = self.claim(owner).await;

        self.reconcile_orphans(&claim.ids, &mut report).await;

        let mut failed: BTreeSet<ResourceRef> = BTreeSet::new();
        loop {
            let step = {
                let resources = self.resources.lock().await;
                plan(&resources, &claim.ids, &failed)
            };
            match step {
                Step::Done => break,
                Step::Delete(ready) => {
                    for id in ready {
                        self.mark_deleting(&id).await;
                        let outcome = self.delete(&id).await;
                        if outcome.is_err() {
                            failed.insert(id.clone());
                        }
                        self.apply_outcome(&id, outcome, &mut report).await;
                    }
                }
                Step::Force(cycle) => {
                    warn!(
                        target: "validator.tracker",
                        resources = cycle.len(),
                        "Dependency cycle, forcing deletion of its members"
                    );
                    for id in cycle {
                        self.mark_deleting(&id).await;
                        let outcome = self.force_delete(&id).await;
                        if outcome.is_err() {
                            failed.insert(id.clone());
                        }
                        self.apply_outcome(&id, outcome, &mut report).await;
                    }
                }
                Step::Blocked(blocked) => {
                    let mut resources = self.resources.lock().await;
                    for (id, by) in blocked {
                        warn!(
                            target: "validator.tracker",
                            resource = %id,
                            blocked_by = %by,
                            "Leaving resource in place, a predecessor was not deleted"
                        );
                        report.messages.push(format!("{id} not deleted: blocked by {by}"));
                        report.failed.push((id.clone(), format!("blocked by {by}")));
                        if let Some(resource) = resources.get_mut(&id) {
                            resource.state = ResourceState::Failed;
                        }
                    }
                    break;
                }
            }
        }

        if report.messages.is_empty() {
            report.messages.push("nothing to clean up".to_string());
        }
        info!(
            target: "validator.tracker",
            deleted = report.deleted.len(),
            degraded = report.degraded.len(),
            failed = report.failed.len(),
            "Cleanup pass finished"
        );
        report
    }

    /// Claim the in-scope live resources no other pass is working on.
    async fn claim(&self, owner: Option<EnvironmentId>) -> Claim<'_> {
        let resources = self.resources.lock().await;
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        let ids: BTreeSet<ResourceRef> = resources
            .values()
            .filter(|r| owner.map_or(true, |o| r.owner == o))
            .filter(|r| r.state != ResourceState::Deleted && !in_flight.contains(&r.id))
            .map(|r| r.id.clone())
            .collect();
        in_flight.extend(ids.iter().cloned());
        Claim {
            in_flight: &self.in_flight,
            ids,
        }
    }

    /// Resolve resources whose create outcome is unknown.
    ///
    /// `Deleting` here means an earlier pass was interrupted mid-delete.
    async fn reconcile_orphans(
        &self,
        claimed: &BTreeSet<ResourceRef>,
        report: &mut CleanupReport,
    ) {
        let unconfirmed: Vec<ResourceRef> = {
            let resources = self.resources.lock().await;
            claimed
                .iter()
                .filter(|id| resources.get(*id).is_some_and(|r| is_unconfirmed(r.state)))
                .cloned()
                .collect()
        };

        for id in unconfirmed {
            let exists = self
                .resilience
                .call("get", || async {
                    match self.client.get(&id).await {
                        Ok(_) => Ok(true),
                        Err(ClusterError::NotFound(_)) => Ok(false),
                        Err(e) => Err(e),
                    }
                })
                .await
                // Unknown existence: attempt deletion, which tolerates NotFound.
                .unwrap_or(true);

            let mut resources = self.resources.lock().await;
            let Some(resource) = resources.get_mut(&id) else {
                continue;
            };
            // Confirmed or forgotten during the lookup.
            if !is_unconfirmed(resource.state) {
                continue;
            }
            if exists {
                resource.state = ResourceState::Created;
                report.messages.push(format!("reconciled orphan {id}"));
            } else {
                resource.state = ResourceState::Deleted;
                report.messages.push(format!("{id} was never created"));
            }
        }
    }

    async fn mark_deleting(&self, id: &ResourceRef) {
        if let Some(resource) = self.resources.lock().await.get_mut(id) {
            resource.state = ResourceState::Deleting;
        }
    }

    async fn apply_outcome(
        &self,
        id: &ResourceRef,
        outcome: Result<Deletion, ValidationError>,
        report: &mut CleanupReport,
    ) {
        let state = match outcome {
            Ok(Deletion::Deleted) => {
                report.messages.push(format!("deleted {id}"));
                report.deleted.push(id.clone());
                ResourceState::Deleted
            }
            Ok(Deletion::Forced) => {
                metrics::record_cleanup_degraded(id.kind.as_str());
                warn!(
                    target: "validator.tracker",
                    resource = %id,
                    kind = %ErrorKind::CleanupDegraded,
                    "Deleted after removing finalizers"
                );
                report
                    .messages
                    .push(format!("deleted {id} after removing finalizers (degraded)"));
                report.deleted.push(id.clone());
                report.degraded.push(id.clone());
                ResourceState::Deleted
            }
            Err(e) => {
                warn!(
                    target: "validator.tracker",
                    resource = %id,
                    error = %e,
                    "Failed to delete resource"
                );
                report.messages.push(format!("failed to delete {id}: {e}"));
                report.failed.push((id.clone(), e.to_string()));
                ResourceState::Failed
            }
        };
        if let Some(resource) = self.resources.lock().await.get_mut(id) {
            resource.state = state;
        }
    }

    /// Delete and wait for the object to disappear, forcing if it sticks.
    async fn delete(&self, id: &ResourceRef) -> Result<Deletion, ValidationError> {
        self.request_delete(id).await?;
        match self.wait_gone(id).await {
            Ok(()) => Ok(Deletion::Deleted),
            Err(e) if e.kind() == ErrorKind::Timeout => {
                debug!(
                    target: "validator.tracker",
                    resource = %id,
                    "Deletion accepted but object remains, likely a stuck finalizer"
                );
                self.force_delete(id).await
            }
            Err(e) => Err(e),
        }
    }

    async fn force_delete(&self, id: &ResourceRef) -> Result<Deletion, ValidationError> {
        self.resilience
            .call("remove_finalizers", || async {
                match self.client.remove_finalizers(id).await {
                    Err(ClusterError::NotFound(_)) => Ok(()),
                    other => other,
                }
            })
            .await?;
        self.request_delete(id).await?;
        self.wait_gone(id).await?;
        Ok(Deletion::Forced)
    }

    async fn request_delete(&self, id: &ResourceRef) -> Result<(), ValidationError> {
        self.resilience
            .call("delete", || async {
                // Already gone counts as deleted.
                match self.client.delete(id).await {
                    Err(ClusterError::NotFound(_)) => Ok(()),
                    other => other,
                }
            })
            .await
    }

    async fn wait_gone(&self, id: &ResourceRef) -> Result<(), ValidationError> {
        let operation = format!("deletion of {id}");
        poll_until(&operation, self.config.delete_poll, || async {
            match self.client.get(id).await {
                Err(ClusterError::NotFound(_)) => Ok(true),
                Ok(_) => Ok(false),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }
}

/// Resources that must be deleted before `id`, restricted to tracked ones.
fn predecessors(
    resources: &BTreeMap<ResourceRef, TrackedResource>,
    id: &ResourceRef,
) -> BTreeSet<ResourceRef> {
    let Some(resource) = resources.get(id) else {
        return BTreeSet::new();
    };
    let rank = id.kind.teardown_rank();
    let mut preceding: BTreeSet<ResourceRef> = resource
        .deleted_after
        .iter()
        .filter(|p| resources.contains_key(*p))
        .cloned()
        .collect();
    preceding.extend(
        resources
            .keys()
            .filter(|other| *other != id)
            .filter(|other| other.scope() == id.scope() && other.kind.teardown_rank() < rank)
            .cloned(),
    );
    preceding
}

fn is_unconfirmed(state: ResourceState) -> bool {
    matches!(
        state,
        ResourceState::Pending | ResourceState::Failed | ResourceState::Deleting
    )
}

/// Resources held by one cleanup pass; released on drop.
struct Claim<'a> {
    in_flight: &'a StdMutex<BTreeSet<ResourceRef>>,
    ids: BTreeSet<ResourceRef>,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        for id in &self.ids {
            in_flight.remove(id);
        }
    }
}

/// Next move of a cleanup pass.
#[derive(Debug, PartialEq, Eq)]
enum Step {
    Done,
    /// Every predecessor is gone.
    Delete(Vec<ResourceRef>),
    /// Members of a dependency cycle; nothing else can make progress.
    Force(Vec<ResourceRef>),
    /// Resources stuck behind a predecessor that is still present, with
    /// the predecessor holding each one back.
    Blocked(Vec<(ResourceRef, ResourceRef)>),
}

/// Decide what the pass does next over the claimed resources.
///
/// `failed` holds resources whose deletion already failed this pass; they
/// and everything behind them are never retried or forced.
fn plan(
    resources: &BTreeMap<ResourceRef, TrackedResource>,
    claimed: &BTreeSet<ResourceRef>,
    failed: &BTreeSet<ResourceRef>,
) -> Step {
    let gone = |id: &ResourceRef| {
        resources
            .get(id)
            .map_or(true, |r| r.state == ResourceState::Deleted)
    };
    let live: BTreeSet<ResourceRef> = claimed
        .iter()
        .filter(|id| !failed.contains(*id) && !gone(*id))
        .cloned()
        .collect();
    if live.is_empty() {
        return Step::Done;
    }

    let edges: BTreeMap<ResourceRef, Vec<ResourceRef>> = live
        .iter()
        .map(|id| {
            let pending: Vec<ResourceRef> = predecessors(resources, id)
                .into_iter()
                .filter(|p| !gone(p))
                .collect();
            (id.clone(), pending)
        })
        .collect();

    let mut ready: Vec<ResourceRef> = edges
        .iter()
        .filter(|(_, pending)| pending.is_empty())
        .map(|(id, _)| id.clone())
        .collect();
    if !ready.is_empty() {
        ready.sort_by_key(|id| (id.kind.teardown_rank(), id.clone()));
        return Step::Delete(ready);
    }

    // Held back by something this pass cannot delete, directly or transitively.
    let mut blocked: BTreeMap<ResourceRef, ResourceRef> = edges
        .iter()
        .filter_map(|(id, pending)| {
            pending
                .iter()
                .find(|p| !live.contains(*p))
                .map(|p| (id.clone(), p.clone()))
        })
        .collect();
    loop {
        let spread: Vec<(ResourceRef, ResourceRef)> = edges
            .iter()
            .filter(|(id, _)| !blocked.contains_key(*id))
            .filter_map(|(id, pending)| {
                pending
                    .iter()
                    .find(|p| blocked.contains_key(*p))
                    .map(|p| (id.clone(), p.clone()))
            })
            .collect();
        if spread.is_empty() {
            break;
        }
        blocked.extend(spread);
    }

    let free: BTreeSet<&ResourceRef> = live
        .iter()
        .filter(|id| !blocked.contains_key(*id))
        .collect();
    if free.is_empty() {
        return Step::Blocked(blocked.into_iter().collect());
    }

    let mut cycle: Vec<ResourceRef> = free
        .iter()
        .filter(|id| reaches_itself(&edges, &free, id))
        .map(|id| (*id).clone())
        .collect();
    if cycle.is_empty() {
        cycle = free.into_iter().cloned().collect();
    }
    cycle.sort_by_key(|id| (id.kind.teardown_rank(), id.clone()));
    Step::Force(cycle)
}

/// Whether following pending predecessors inside `free` leads back to `start`.
fn reaches_itself(
    edges: &BTreeMap<ResourceRef, Vec<ResourceRef>>,
    free: &BTreeSet<&ResourceRef>,
    start: &ResourceRef,
) -> bool {
    let mut seen: BTreeSet<&ResourceRef> = BTreeSet::new();
    let mut stack: Vec<&ResourceRef> = vec![start];
    while let Some(id) = stack.pop() {
        for next in edges.get(id).into_iter().flatten() {
            if next == start {
                return true;
            }
            if free.contains(&next) && seen.insert(next) {
                stack.push(next);
            }
        }
    }
    false
}
