//! Run invocation surface.
//!
//! [`Runner::run`] takes a phase and context parameters and produces a
//! [`RunReport`] plus the process exit code. The two always agree.

use crate::checks::CheckRegistry;
use crate::cluster::ClusterClient;
use crate::config::{PipelineConfig, ValidatorConfig};
use crate::context::RunContext;
use crate::pipeline::{HookPipeline, PhasePlan};
use crate::progress::run_stall_watchdog;
use crate::reporter::{build_report, CheckResult, ReportInput, RunReport};
use crate::resilience::Resilience;
use chrono::Utc;
use common::error::ValidationError;
use common::types::{CheckStatus, Phase, RunId};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// What to validate.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub phase: Phase,
    pub context_parameters: BTreeMap<String, String>,
}

impl RunRequest {
    #[must_use]
    pub fn new(phase: Phase) -> Self {
        Self {
            phase,
            context_parameters: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context_parameters.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub report: RunReport,
    pub exit_code: i32,
}

impl From<RunReport> for RunOutcome {
    fn from(report: RunReport) -> Self {
        let exit_code = report.exit_code();
        Self { report, exit_code }
    }
}

/// Wires configuration, the check registry, and a cluster client into runs.
pub struct Runner {
    config: ValidatorConfig,
    pipeline: PipelineConfig,
    registry: CheckRegistry,
    client: Arc<dyn ClusterClient>,
    /// Cancelling this ends the run early, the same way the run timeout does.
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("config", &self.config)
            .field("registry", &self.registry.names())
            .finish_non_exhaustive()
    }
}

impl Runner {
    #[must_use]
    pub fn new(
        config: ValidatorConfig,
        pipeline: PipelineConfig,
        registry: CheckRegistry,
        client: Arc<dyn ClusterClient>,
    ) -> Self {
        Self {
            config,
            pipeline,
            registry,
            client,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that interrupts an in-progress run (e.g. on SIGINT).
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Validate one phase.
    ///
    /// A phase whose check list cannot be built produces a report holding
    /// only the configuration error; no check runs.
    #[instrument(skip_all, fields(phase = %request.phase))]
    pub async fn run(&self, request: RunRequest) -> RunOutcome {
        let started_at = Utc::now();

        let plan = match PhasePlan::resolve(
            &self.pipeline,
            &self.registry,
            request.phase,
            self.config.check_timeout,
        ) {
            Ok(plan) => plan,
            Err(e) => {
                error!(target: "validator.runner", error = %e, "Invalid pipeline configuration");
                return RunReport::configuration_failure(
                    RunId::new(),
                    Some(request.phase),
                    started_at,
                    e.to_string(),
                )
                .into();
            }
        };

        let resilience = Arc::new(Resilience::new(
            self.config.retry_policy(),
            self.config.breaker_config(),
        ));
        let ctx = Arc::new(RunContext::new(
            request.phase,
            Arc::clone(&self.client),
            resilience,
            self.config.environment_config(),
            self.config.cleanup_config(),
            request.context_parameters,
        ));
        info!(
            target: "validator.runner",
            run_id = %ctx.run_id,
            checks = plan.checks.len(),
            max_parallelism = self.config.max_parallelism,
            "Starting validation run"
        );

        let watchdog_token = CancellationToken::new();
        let watchdog = tokio::spawn(run_stall_watchdog(
            Arc::clone(&ctx.progress),
            self.config.stall_timeout,
            self.config.watchdog_interval,
            watchdog_token.clone(),
        ));

        let pipeline = HookPipeline::new(Arc::clone(&ctx), self.config.max_parallelism);
        let incomplete = {
            let phase = pipeline.run_phase(&plan);
            tokio::pin!(phase);
            let cut_short = tokio::select! {
                () = &mut phase => None,
                () = tokio::time::sleep(self.config.run_timeout) => Some("run timed out"),
                () = self.shutdown.cancelled() => Some("run interrupted"),
            };
            if let Some(reason) = cut_short {
                warn!(
                    target: "validator.runner",
                    reason,
                    timeout_secs = self.config.run_timeout.as_secs(),
                    "Cancelling in-flight checks"
                );
                ctx.cancel.cancel();
                // In-flight checks stop at their next suspension point and
                // still tear down their environments.
                phase.await;
            }
            cut_short.is_some()
        };

        let environments = ctx.environments.teardown_all().await;
        watchdog_token.cancel();
        if let Err(e) = watchdog.await {
            warn!(target: "validator.runner", error = %e, "Stall watchdog task failed");
        }

        let checks = collect_results(&ctx, &plan);
        let report = build_report(ReportInput {
            run_id: ctx.run_id,
            phase: request.phase,
            started_at,
            finished_at: Utc::now(),
            checks,
            environments,
            progress: ctx.progress.get_summary(),
            incomplete,
        });
        info!(
            target: "validator.runner",
            run_id = %ctx.run_id,
            overall_status = ?report.overall_status,
            incomplete = report.incomplete,
            "Validation run finished"
        );
        report.into()
    }
}

/// One result per planned check, in configuration order. A check that never
/// recorded a result was cut off by the run timeout.
fn collect_results(ctx: &RunContext, plan: &PhasePlan) -> Vec<CheckResult> {
    plan.checks
        .iter()
        .map(|planned| {
            ctx.results.get(planned.index).unwrap_or_else(|| {
                let error = ValidationError::timeout(
                    format!("run, before check {} finished", planned.spec.name),
                    std::time::Duration::ZERO,
                );
                let mut details = Map::new();
                details.insert("error".to_string(), Value::String(error.to_string()));
                CheckResult {
                    name: planned.spec.name.clone(),
                    phase: ctx.phase,
                    status: CheckStatus::Error,
                    severity: planned.spec.severity,
                    message: error.to_string(),
                    details,
                    timestamp: Utc::now(),
                    duration_ms: 0,
                    error_kind: Some(error.kind()),
                    blocking: planned.spec.blocking,
                }
            })
        })
        .collect()
}
