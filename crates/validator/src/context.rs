//! Per-run state.
//!
//! A [`RunContext`] is created for each run and handed to every component
//! that needs shared state. There are no process-wide singletons: two runs
//! in one process have independent trackers, breakers, and progress tables.

use crate::cluster::ClusterClient;
use crate::environment::{EnvironmentConfig, EnvironmentSummary, QuotaSpec, TestEnvironment};
use crate::progress::{ProgressHandle, ProgressMonitor};
use crate::reporter::CheckResult;
use crate::resilience::Resilience;
use crate::tracker::{CleanupConfig, ResourceTracker};
use common::types::{Phase, RunId};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Default)]
struct RegistryInner {
    /// Every environment ever opened in this run, in creation order.
    all: Vec<Arc<TestEnvironment>>,
    shared: HashMap<String, Arc<TestEnvironment>>,
}

/// Every environment opened during a run.
///
/// Environments are registered before their setup starts, so a sweep at
/// the end of the run reaches environments whose setup was interrupted.
pub struct EnvironmentRegistry {
    config: EnvironmentConfig,
    client: Arc<dyn ClusterClient>,
    resilience: Arc<Resilience>,
    tracker: Arc<ResourceTracker>,
    progress: Arc<ProgressMonitor>,
    inner: Mutex<RegistryInner>,
}

impl std::fmt::Debug for EnvironmentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvironmentRegistry")
            .field("config", &self.config)
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

impl EnvironmentRegistry {
    #[must_use]
    pub fn new(
        config: EnvironmentConfig,
        client: Arc<dyn ClusterClient>,
        resilience: Arc<Resilience>,
        tracker: Arc<ResourceTracker>,
        progress: Arc<ProgressMonitor>,
    ) -> Self {
        Self {
            config,
            client,
            resilience,
            tracker,
            progress,
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn build(&self, quota: Option<&QuotaSpec>) -> TestEnvironment {
        let quota = match quota {
            Some(overrides) => self.config.default_quota.merged(overrides),
            None => self.config.default_quota.clone(),
        };
        TestEnvironment::new(
            &self.config,
            quota,
            Arc::clone(&self.client),
            Arc::clone(&self.resilience),
            Arc::clone(&self.tracker),
        )
    }

    /// A new environment for one check. Setup/teardown progress is reported
    /// under the check's name.
    pub fn open_dedicated(&self, check: &str, quota: Option<&QuotaSpec>) -> Arc<TestEnvironment> {
        let env = Arc::new(
            self.build(quota)
                .with_progress(ProgressHandle::new(Arc::clone(&self.progress), check)),
        );
        self.lock().all.push(Arc::clone(&env));
        env
    }

    /// The environment for a shared group, created on first use with the
    /// first caller's quota.
    pub fn shared(&self, group: &str, quota: Option<&QuotaSpec>) -> Arc<TestEnvironment> {
        let mut inner = self.lock();
        if let Some(env) = inner.shared.get(group) {
            return Arc::clone(env);
        }
        let env = Arc::new(self.build(quota));
        inner.shared.insert(group.to_string(), Arc::clone(&env));
        inner.all.push(Arc::clone(&env));
        env
    }

    /// Every registered environment, in creation order.
    #[must_use]
    pub fn environments(&self) -> Vec<Arc<TestEnvironment>> {
        self.lock().all.clone()
    }

    /// Tear down every shared-group environment.
    pub async fn teardown_shared(&self) {
        let shared: Vec<Arc<TestEnvironment>> = self.lock().shared.values().cloned().collect();
        for env in shared {
            env.teardown().await;
        }
    }

    /// Tear down the dedicated environments opened for `check`.
    pub async fn teardown_dedicated(&self, check: &str) {
        let owned: Vec<Arc<TestEnvironment>> = {
            let inner = self.lock();
            inner
                .all
                .iter()
                .filter(|env| !inner.shared.values().any(|s| Arc::ptr_eq(s, *env)))
                .filter(|env| env.summary().used_by.iter().any(|c| c == check))
                .cloned()
                .collect()
        };
        for env in owned {
            env.teardown().await;
        }
    }

    /// Tear down every registered environment. Already-closed environments
    /// are skipped by their own idempotent teardown.
    pub async fn teardown_all(&self) -> Vec<EnvironmentSummary> {
        let all = self.environments();
        info!(
            target: "validator.runner",
            environments = all.len(),
            "Sweeping environments"
        );
        for env in &all {
            env.teardown().await;
        }
        all.iter().map(|env| env.summary()).collect()
    }
}

/// Results keyed by the check's position in the phase.
#[derive(Debug, Default)]
pub struct ResultSink {
    results: Mutex<BTreeMap<usize, CheckResult>>,
}

impl ResultSink {
    fn lock(&self) -> MutexGuard<'_, BTreeMap<usize, CheckResult>> {
        self.results.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record(&self, index: usize, result: CheckResult) {
        self.lock().insert(index, result);
    }

    #[must_use]
    pub fn contains(&self, index: usize) -> bool {
        self.lock().contains_key(&index)
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<CheckResult> {
        self.lock().get(&index).cloned()
    }

    /// Recorded results in position order.
    #[must_use]
    pub fn ordered(&self) -> Vec<CheckResult> {
        self.lock().values().cloned().collect()
    }
}

/// Everything shared by the components of one run.
pub struct RunContext {
    pub run_id: RunId,
    pub phase: Phase,
    pub client: Arc<dyn ClusterClient>,
    pub resilience: Arc<Resilience>,
    pub tracker: Arc<ResourceTracker>,
    pub progress: Arc<ProgressMonitor>,
    pub environments: EnvironmentRegistry,
    pub results: ResultSink,
    /// Run-level parameters passed to every check.
    pub parameters: BTreeMap<String, String>,
    /// Cancelled when the run times out.
    pub cancel: CancellationToken,
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("run_id", &self.run_id)
            .field("phase", &self.phase)
            .field("parameters", &self.parameters)
            .finish_non_exhaustive()
    }
}

impl RunContext {
    #[must_use]
    pub fn new(
        phase: Phase,
        client: Arc<dyn ClusterClient>,
        resilience: Arc<Resilience>,
        environment_config: EnvironmentConfig,
        cleanup_config: CleanupConfig,
        parameters: BTreeMap<String, String>,
    ) -> Self {
        let tracker = Arc::new(ResourceTracker::new(
            Arc::clone(&client),
            Arc::clone(&resilience),
            cleanup_config,
        ));
        let progress = Arc::new(ProgressMonitor::new());
        let environments = EnvironmentRegistry::new(
            environment_config,
            Arc::clone(&client),
            Arc::clone(&resilience),
            Arc::clone(&tracker),
            Arc::clone(&progress),
        );
        Self {
            run_id: RunId::new(),
            phase,
            client,
            resilience,
            tracker,
            progress,
            environments,
            results: ResultSink::default(),
            parameters,
            cancel: CancellationToken::new(),
        }
    }
}
