//! Validation hook pipeline.
//!
//! Runs the checks of one phase and records exactly one [`CheckResult`] per
//! configured check.
//!
//! # Scheduling
//!
//! The check list is cut into segments at blocking checks. Each blocking
//! check is a barrier: it starts after everything before it finishes, and
//! nothing after it starts until it finishes. Between barriers, checks run
//! concurrently on a bounded pool, except that checks sharing an environment
//! group run one at a time in configuration order.
//!
//! A blocking check that does not pass short-circuits the rest of the phase;
//! those checks are recorded as `skipped`.
//!
//! # Cancellation
//!
//! Each check runs on its own task under its own timeout. A panicking check
//! is recorded as an error and its dedicated environment torn down. When
//! the run's cancellation token fires, in-flight checks stop and are
//! recorded as timed out, and checks that have not started are recorded the
//! same way. Dedicated environments are torn down on every path.

use crate::capability::missing_capabilities;
use crate::checks::{Check, CheckContext, CheckRegistry, CheckVerdict};
use crate::config::{CheckSpec, ConfigError, EnvironmentMode, PipelineConfig};
use crate::context::RunContext;
use crate::environment::TestEnvironment;
use crate::observability::metrics;
use crate::progress::ProgressStatus;
use crate::reporter::CheckResult;
use chrono::Utc;
use common::error::{ErrorKind, ValidationError};
use common::types::{CheckStatus, Phase};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{error, info, instrument, warn};

/// One check resolved against the registry.
#[derive(Clone)]
pub struct PlannedCheck {
    /// Position in the phase's configured list.
    pub index: usize,
    pub spec: CheckSpec,
    pub check: Arc<dyn Check>,
    pub timeout: Duration,
}

impl std::fmt::Debug for PlannedCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlannedCheck")
            .field("index", &self.index)
            .field("spec", &self.spec)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// The ordered check list of one phase.
#[derive(Debug, Clone)]
pub struct PhasePlan {
    pub phase: Phase,
    pub checks: Vec<PlannedCheck>,
}

impl PhasePlan {
    /// Resolve the configured checks of `phase`.
    ///
    /// # Errors
    ///
    /// Any wiring error reported by [`PipelineConfig::checks_for`].
    pub fn resolve(
        pipeline: &PipelineConfig,
        registry: &CheckRegistry,
        phase: Phase,
        default_timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let specs = pipeline.checks_for(phase, registry)?;
        let mut checks = Vec::with_capacity(specs.len());
        for (index, spec) in specs.iter().enumerate() {
            let check = registry
                .get(spec.implementation())
                .ok_or_else(|| ConfigError::UnknownCheck {
                    phase,
                    name: spec.name.clone(),
                    check: spec.implementation().to_string(),
                })?;
            checks.push(PlannedCheck {
                index,
                spec: spec.clone(),
                check,
                timeout: spec
                    .timeout_seconds
                    .map_or(default_timeout, Duration::from_secs),
            });
        }
        Ok(Self { phase, checks })
    }
}

enum Segment {
    Concurrent(Vec<PlannedCheck>),
    Barrier(PlannedCheck),
}

impl Segment {
    fn checks(&self) -> Vec<&PlannedCheck> {
        match self {
            Segment::Concurrent(checks) => checks.iter().collect(),
            Segment::Barrier(check) => vec![check],
        }
    }
}

fn segments(checks: &[PlannedCheck]) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut current = Vec::new();
    for check in checks {
        if check.spec.blocking {
            if !current.is_empty() {
                segments.push(Segment::Concurrent(std::mem::take(&mut current)));
            }
            segments.push(Segment::Barrier(check.clone()));
        } else {
            current.push(check.clone());
        }
    }
    if !current.is_empty() {
        segments.push(Segment::Concurrent(current));
    }
    segments
}

/// Split concurrent checks into lanes. A lane runs its checks in order;
/// lanes run in parallel. Each shared group gets one lane.
fn lanes(checks: Vec<PlannedCheck>) -> Vec<Vec<PlannedCheck>> {
    let mut lanes: Vec<Vec<PlannedCheck>> = Vec::new();
    let mut group_lane: BTreeMap<String, usize> = BTreeMap::new();
    for check in checks {
        if let EnvironmentMode::Shared(group) = &check.spec.environment {
            if let Some(lane) = group_lane.get(group).and_then(|i| lanes.get_mut(*i)) {
                lane.push(check);
                continue;
            }
            group_lane.insert(group.clone(), lanes.len());
        }
        lanes.push(vec![check]);
    }
    lanes
}

/// Executes phases against one run context.
#[derive(Debug)]
pub struct HookPipeline {
    ctx: Arc<RunContext>,
    slots: Arc<Semaphore>,
}

impl HookPipeline {
    #[must_use]
    pub fn new(ctx: Arc<RunContext>, max_parallelism: usize) -> Self {
        Self {
            ctx,
            slots: Arc::new(Semaphore::new(max_parallelism.max(1))),
        }
    }

    /// Run every check of `plan`, recording results in the context's sink.
    #[instrument(skip_all, fields(phase = %plan.phase, checks = plan.checks.len()))]
    pub async fn run_phase(&self, plan: &PhasePlan) {
        info!(target: "validator.pipeline", "Running phase");
        for check in &plan.checks {
            self.ctx
                .progress
                .update_progress(&check.spec.name, ProgressStatus::Pending);
        }

        let mut blocked_by: Option<String> = None;
        for segment in segments(&plan.checks) {
            if let Some(blocker) = &blocked_by {
                for check in segment.checks() {
                    record(
                        &self.ctx,
                        check,
                        Utc::now(),
                        Duration::ZERO,
                        Ok(CheckVerdict::skipped(format!(
                            "skipped: blocking check {blocker} did not pass"
                        ))
                        .with_detail("blocked_by", blocker.clone())),
                    );
                }
                continue;
            }

            match segment {
                Segment::Concurrent(checks) => self.run_concurrent(checks).await,
                Segment::Barrier(check) => {
                    run_isolated(&self.ctx, &self.slots, &check).await;
                    let passed = self
                        .ctx
                        .results
                        .get(check.index)
                        .is_some_and(|r| r.status == CheckStatus::Pass);
                    if !passed {
                        warn!(
                            target: "validator.pipeline",
                            check = %check.spec.name,
                            "Blocking check did not pass, skipping the rest of the phase"
                        );
                        blocked_by = Some(check.spec.name.clone());
                    }
                }
            }
        }

        self.ctx.environments.teardown_shared().await;
        info!(target: "validator.pipeline", "Phase finished");
    }

    async fn run_concurrent(&self, checks: Vec<PlannedCheck>) {
        let mut tasks = JoinSet::new();
        for lane in lanes(checks) {
            let ctx = Arc::clone(&self.ctx);
            let slots = Arc::clone(&self.slots);
            tasks.spawn(async move {
                for check in &lane {
                    run_isolated(&ctx, &slots, check).await;
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(target: "validator.pipeline", error = %e, "Lane task failed");
            }
        }
    }
}

/// Run one check on its own task. A panic inside the check becomes an
/// `error` result for that check alone; its lane and phase carry on.
async fn run_isolated(ctx: &Arc<RunContext>, slots: &Arc<Semaphore>, planned: &PlannedCheck) {
    let task = tokio::spawn({
        let ctx = Arc::clone(ctx);
        let slots = Arc::clone(slots);
        let planned = planned.clone();
        async move { run_check(&ctx, &slots, &planned).await }
    });
    let Err(e) = task.await else {
        return;
    };

    let name = &planned.spec.name;
    error!(target: "validator.pipeline", check = %name, error = %e, "Check task failed");
    if planned.spec.environment == EnvironmentMode::Dedicated {
        ctx.environments.teardown_dedicated(name).await;
    }
    if !ctx.results.contains(planned.index) {
        let reason = if e.is_panic() { "panicked" } else { "was cancelled" };
        record(
            ctx,
            planned,
            Utc::now(),
            Duration::ZERO,
            Err(ValidationError::Permanent(format!("check {name} {reason}"))),
        );
    }
}

/// Run one check end to end and record its result.
async fn run_check(ctx: &RunContext, slots: &Semaphore, planned: &PlannedCheck) {
    let name = planned.spec.name.as_str();
    let timestamp = Utc::now();
    let started = Instant::now();

    let permit = tokio::select! {
        biased;
        () = ctx.cancel.cancelled() => None,
        permit = slots.acquire() => permit.ok(),
    };
    let Some(_permit) = permit else {
        record(
            ctx,
            planned,
            timestamp,
            started.elapsed(),
            Err(ValidationError::timeout(
                format!("run, before check {name} started"),
                started.elapsed(),
            )),
        );
        return;
    };

    let acquired: OnceLock<Arc<TestEnvironment>> = OnceLock::new();
    let cancel = ctx.cancel.child_token();
    let body = execute(ctx, planned, &acquired, cancel.clone());

    let outcome = tokio::select! {
        biased;
        () = ctx.cancel.cancelled() => {
            warn!(target: "validator.pipeline", check = name, "Run cancelled while check in flight");
            Err(ValidationError::timeout(format!("run, during check {name}"), started.elapsed()))
        }
        result = tokio::time::timeout(planned.timeout, body) => match result {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(target: "validator.pipeline", check = name, "Check timed out");
                Err(ValidationError::timeout(format!("check {name}"), planned.timeout))
            }
        },
    };
    cancel.cancel();

    let mut outcome = outcome;
    if planned.spec.environment == EnvironmentMode::Dedicated {
        if let Some(env) = acquired.get() {
            let cleanup = env.teardown().await;
            if let Ok(verdict) = &mut outcome {
                if let Some(degraded) = cleanup.degraded_error() {
                    verdict
                        .details
                        .insert("cleanup_degraded".to_string(), Value::String(degraded.to_string()));
                }
                if !cleanup.failed.is_empty() {
                    verdict.details.insert(
                        "cleanup_failed".to_string(),
                        Value::from(
                            cleanup
                                .failed
                                .iter()
                                .map(|(id, _)| id.to_string())
                                .collect::<Vec<_>>(),
                        ),
                    );
                }
            }
        }
    }

    record(ctx, planned, timestamp, started.elapsed(), outcome);
}

/// Prerequisites, environment, then the check itself.
async fn execute(
    ctx: &RunContext,
    planned: &PlannedCheck,
    acquired: &OnceLock<Arc<TestEnvironment>>,
    cancel: tokio_util::sync::CancellationToken,
) -> Result<CheckVerdict, ValidationError> {
    let spec = &planned.spec;

    if !spec.requires.is_empty() {
        let missing = missing_capabilities(ctx.client.as_ref(), &ctx.resilience, &spec.requires).await?;
        if !missing.is_empty() {
            let missing: Vec<String> = missing.iter().map(ToString::to_string).collect();
            info!(
                target: "validator.pipeline",
                check = %spec.name,
                missing = %missing.join(", "),
                "Prerequisites missing, skipping check"
            );
            return Ok(
                CheckVerdict::skipped(format!("missing prerequisites: {}", missing.join(", ")))
                    .with_detail("missing", missing),
            );
        }
    }

    let environment = match &spec.environment {
        EnvironmentMode::None => None,
        EnvironmentMode::Dedicated => Some(Arc::clone(acquired.get_or_init(|| {
            ctx.environments
                .open_dedicated(&spec.name, spec.quota.as_ref())
        }))),
        EnvironmentMode::Shared(group) => Some(Arc::clone(acquired.get_or_init(|| {
            ctx.environments.shared(group, spec.quota.as_ref())
        }))),
    };
    if let Some(env) = &environment {
        env.add_user(&spec.name);
        env.setup().await?;
    }

    ctx.progress
        .update_progress(&spec.name, ProgressStatus::Running);
    let check_ctx = CheckContext {
        run_id: ctx.run_id,
        phase: ctx.phase,
        check_name: spec.name.clone(),
        environment,
        params: spec.params.clone(),
        run_params: ctx.parameters.clone(),
        client: Arc::clone(&ctx.client),
        resilience: Arc::clone(&ctx.resilience),
        cancel,
    };
    planned.check.execute(&check_ctx).await
}

fn record(
    ctx: &RunContext,
    planned: &PlannedCheck,
    timestamp: chrono::DateTime<Utc>,
    elapsed: Duration,
    outcome: Result<CheckVerdict, ValidationError>,
) {
    let spec = &planned.spec;
    let (status, message, details, error_kind) = match outcome {
        Ok(verdict) => (verdict.status, verdict.message, verdict.details, None),
        Err(e) => {
            let mut details = Map::new();
            details.insert("error".to_string(), Value::String(e.to_string()));
            (CheckStatus::Error, e.to_string(), details, Some(e.kind()))
        }
    };

    let result = CheckResult {
        name: spec.name.clone(),
        phase: ctx.phase,
        status,
        severity: spec.severity,
        message,
        details,
        timestamp,
        duration_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        error_kind,
        blocking: spec.blocking,
    };

    ctx.progress.update_progress(&spec.name, status.into());
    metrics::record_check_result(ctx.phase.as_str(), status.as_str(), elapsed);
    match (status, error_kind) {
        (CheckStatus::Pass | CheckStatus::Skipped, _) => info!(
            target: "validator.pipeline",
            check = %spec.name,
            status = %status,
            duration_ms = result.duration_ms,
            "Check finished"
        ),
        (_, Some(ErrorKind::Timeout)) | (CheckStatus::Fail, _) => warn!(
            target: "validator.pipeline",
            check = %spec.name,
            status = %status,
            message = %result.message,
            "Check did not pass"
        ),
        _ => error!(
            target: "validator.pipeline",
            check = %spec.name,
            status = %status,
            kind = ?error_kind,
            message = %result.message,
            "Check errored"
        ),
    }

    ctx.results.record(planned.index, result);
}
