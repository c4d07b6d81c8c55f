//! Run report assembly.
//!
//! The reporter is a pure function over check results, environment
//! summaries, and the progress summary. It always produces a complete
//! report, including for runs that timed out or never started.

use crate::environment::EnvironmentSummary;
use crate::progress::ProgressSummary;
use chrono::{DateTime, Utc};
use common::error::ErrorKind;
use common::types::{CheckStatus, OverallStatus, Phase, RunId, Severity};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Exit code for an overall pass.
pub const EXIT_PASS: i32 = 0;
/// Exit code for an overall fail.
pub const EXIT_FAIL: i32 = 1;
/// Exit code when the run timed out before every check finished.
pub const EXIT_INCOMPLETE: i32 = 2;
/// Exit code when the run could not be configured.
pub const EXIT_CONFIG_ERROR: i32 = 3;

/// Outcome of one check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub phase: Phase,
    pub status: CheckStatus,
    pub severity: Severity,
    pub message: String,
    pub details: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub blocking: bool,
}

impl CheckResult {
    /// Component prefix used to group recommendations: the part of the name
    /// before the first `.`.
    #[must_use]
    pub fn component(&self) -> &str {
        self.name.split('.').next().unwrap_or(&self.name)
    }

    fn detail_strings(&self, key: &str) -> Vec<String> {
        self.details
            .get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Counts over all results.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReportSummary {
    pub total: usize,
    pub by_status: BTreeMap<CheckStatus, usize>,
    pub by_severity: BTreeMap<Severity, usize>,
    /// Failed or errored checks, by severity.
    pub failures_by_severity: BTreeMap<Severity, usize>,
}

/// Structured result of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    /// Absent only when configuration failed before the phase was known.
    pub phase: Option<Phase>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub checks: Vec<CheckResult>,
    pub summary: ReportSummary,
    pub recommendations: Vec<String>,
    pub environments: Vec<EnvironmentSummary>,
    pub progress: ProgressSummary,
    /// The run timed out before every check finished.
    pub incomplete: bool,
    /// Fatal errors that prevented checks from running.
    pub errors: Vec<String>,
    pub overall_status: OverallStatus,
}

impl RunReport {
    /// Minimal report for a run that could not build its check list.
    #[must_use]
    pub fn configuration_failure(
        run_id: RunId,
        phase: Option<Phase>,
        started_at: DateTime<Utc>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            run_id: run_id.to_string(),
            phase,
            started_at,
            finished_at: Utc::now(),
            checks: Vec::new(),
            summary: ReportSummary::default(),
            recommendations: Vec::new(),
            environments: Vec::new(),
            progress: ProgressSummary::default(),
            incomplete: false,
            errors: vec![error.into()],
            overall_status: OverallStatus::Fail,
        }
    }

    /// Process exit code. Non-zero exactly when `overall_status` is `fail`.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        if !self.errors.is_empty() {
            EXIT_CONFIG_ERROR
        } else if self.incomplete {
            EXIT_INCOMPLETE
        } else {
            match self.overall_status {
                OverallStatus::Pass => EXIT_PASS,
                OverallStatus::Fail => EXIT_FAIL,
            }
        }
    }

    #[must_use]
    pub fn check(&self, name: &str) -> Option<&CheckResult> {
        self.checks.iter().find(|c| c.name == name)
    }
}

/// Everything the reporter consumes.
#[derive(Debug, Clone)]
pub struct ReportInput {
    pub run_id: RunId,
    pub phase: Phase,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// In configuration order.
    pub checks: Vec<CheckResult>,
    pub environments: Vec<EnvironmentSummary>,
    pub progress: ProgressSummary,
    pub incomplete: bool,
}

/// Build the report for a run.
#[must_use]
pub fn build_report(input: ReportInput) -> RunReport {
    let summary = summarize(&input.checks);
    let recommendations = recommendations(&input.checks, &input.environments, input.incomplete);
    let overall_status = overall_status(&input.checks, input.incomplete);
    RunReport {
        run_id: input.run_id.to_string(),
        phase: Some(input.phase),
        started_at: input.started_at,
        finished_at: input.finished_at,
        checks: input.checks,
        summary,
        recommendations,
        environments: input.environments,
        progress: input.progress,
        incomplete: input.incomplete,
        errors: Vec::new(),
        overall_status,
    }
}

fn summarize(checks: &[CheckResult]) -> ReportSummary {
    let mut summary = ReportSummary {
        total: checks.len(),
        ..ReportSummary::default()
    };
    for check in checks {
        *summary.by_status.entry(check.status).or_default() += 1;
        *summary.by_severity.entry(check.severity).or_default() += 1;
        if check.status.is_failure() {
            *summary.failures_by_severity.entry(check.severity).or_default() += 1;
        }
    }
    summary
}

/// `fail` if a critical/high check failed or errored, a blocking check did
/// not pass, or the run is incomplete.
fn overall_status(checks: &[CheckResult], incomplete: bool) -> OverallStatus {
    let gated = checks
        .iter()
        .any(|c| c.severity.gates_run() && c.status.is_failure());
    let blocked = checks
        .iter()
        .any(|c| c.blocking && c.status != CheckStatus::Pass);
    if incomplete || gated || blocked {
        OverallStatus::Fail
    } else {
        OverallStatus::Pass
    }
}

fn join(names: &[String]) -> String {
    names.join(", ")
}

/// Deterministic advice derived from failed, errored, and skipped checks.
fn recommendations(
    checks: &[CheckResult],
    environments: &[EnvironmentSummary],
    incomplete: bool,
) -> Vec<String> {
    let mut out = Vec::new();

    let mut by_component: BTreeMap<&str, Vec<&CheckResult>> = BTreeMap::new();
    for check in checks.iter().filter(|c| c.status.is_failure()) {
        by_component.entry(check.component()).or_default().push(check);
    }

    for (component, failed) in &by_component {
        let names: Vec<String> = failed.iter().map(|c| c.name.clone()).collect();
        match *component {
            "config" => {
                let invalid: usize = failed
                    .iter()
                    .map(|c| c.detail_strings("invalid_files").len())
                    .sum();
                if invalid > 0 {
                    out.push(format!("{invalid} invalid configuration files"));
                } else {
                    out.push(format!("review failing config checks: {}", join(&names)));
                }
            }
            "services" | "workloads" | "deployments" => {
                let mut unready: Vec<String> = failed
                    .iter()
                    .flat_map(|c| c.detail_strings("unready"))
                    .collect();
                unready.sort();
                unready.dedup();
                if unready.is_empty() {
                    out.push(format!("investigate unready services: {}", join(&names)));
                } else {
                    out.push(format!("investigate unready services: {}", join(&unready)));
                }
            }
            other => out.push(format!("review failing {other} checks: {}", join(&names))),
        }
    }

    let with_kind = |kinds: &[ErrorKind]| -> Vec<String> {
        checks
            .iter()
            .filter(|c| c.error_kind.is_some_and(|k| kinds.contains(&k)))
            .map(|c| c.name.clone())
            .collect()
    };

    let timed_out = with_kind(&[ErrorKind::Timeout]);
    if !timed_out.is_empty() {
        out.push(format!(
            "{} checks timed out, raise their timeout or investigate slow operations: {}",
            timed_out.len(),
            join(&timed_out)
        ));
    }

    let degraded_api = with_kind(&[ErrorKind::CircuitOpen, ErrorKind::RetryExhausted]);
    if !degraded_api.is_empty() {
        out.push(format!(
            "cluster API degraded during the run, rerun once it recovers: {}",
            join(&degraded_api)
        ));
    }

    let missing: Vec<String> = checks
        .iter()
        .filter(|c| c.status == CheckStatus::Skipped)
        .filter_map(|c| {
            let caps = c.detail_strings("missing");
            (!caps.is_empty()).then(|| format!("{} ({})", c.name, join(&caps)))
        })
        .collect();
    if !missing.is_empty() {
        out.push(format!(
            "{} checks skipped for missing prerequisites: {}",
            missing.len(),
            join(&missing)
        ));
    }

    let degraded: Vec<String> = environments
        .iter()
        .filter(|e| e.cleanup.as_ref().is_some_and(|c| c.is_degraded()))
        .map(|e| e.namespace.clone())
        .collect();
    if !degraded.is_empty() {
        out.push(format!(
            "warning: cleanup needed forced finalizer removal in {}",
            join(&degraded)
        ));
    }

    let leaked: Vec<String> = environments
        .iter()
        .filter(|e| e.cleanup.as_ref().is_some_and(|c| !c.failed.is_empty()))
        .map(|e| e.namespace.clone())
        .collect();
    if !leaked.is_empty() {
        out.push(format!(
            "warning: resources may have leaked in {}, delete them manually",
            join(&leaked)
        ));
    }

    if incomplete {
        out.push("run timed out before all checks finished, raise the run timeout or split the phase".to_string());
    }

    out
}
