//! Deploy Validator
//!
//! Runs one validation phase against the cluster kubectl points at, prints
//! the JSON report to stdout, and exits with the report's exit code.

use chrono::Utc;
use common::types::RunId;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use validator::checks::CheckRegistry;
use validator::config::{PipelineConfig, ValidatorConfig};
use validator::kubectl::KubectlClient;
use validator::observability::{logging, metrics};
use validator::reporter::RunReport;
use validator::runner::{RunRequest, Runner};

#[tokio::main]
async fn main() -> ExitCode {
    let started_at = Utc::now();

    // Configuration errors still produce a report on stdout.
    let config = match ValidatorConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            let report = RunReport::configuration_failure(RunId::new(), None, started_at, e.to_string());
            return finish(&report, None).await;
        }
    };

    if let Err(e) = logging::init_tracing(&config.observability) {
        eprintln!("{e}");
    }
    let prometheus = match metrics::init_metrics_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(target: "validator.runner", error = %e, "Metrics disabled");
            None
        }
    };

    info!(
        target: "validator.runner",
        phase = %config.phase,
        pipeline = %config.pipeline_path.display(),
        max_parallelism = config.max_parallelism,
        run_timeout_secs = config.run_timeout.as_secs(),
        "Configuration loaded"
    );

    let pipeline = match PipelineConfig::load(&config.pipeline_path).await {
        Ok(pipeline) => pipeline,
        Err(e) => {
            error!(target: "validator.runner", error = %e, "Failed to load pipeline configuration");
            let report = RunReport::configuration_failure(
                RunId::new(),
                Some(config.phase),
                started_at,
                e.to_string(),
            );
            return finish(&report, config.report_path.as_deref()).await;
        }
    };

    let client = Arc::new(KubectlClient::new(config.kubectl.clone(), config.kubectl_timeout));
    let request = RunRequest {
        phase: config.phase,
        context_parameters: config.context_parameters.clone(),
    };
    let report_path = config.report_path.clone();
    let metrics_path = config.observability.metrics_path.clone();
    let runner = Runner::new(config, pipeline, CheckRegistry::with_builtin_checks(), client);

    let shutdown = runner.shutdown_token();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!(target: "validator.runner", "Received SIGINT, ending run");
            shutdown.cancel();
        }
    });

    let outcome = runner.run(request).await;

    let exposition = prometheus.map(|handle| handle.render());
    if let (Some(path), Some(text)) = (metrics_path, exposition) {
        if let Err(e) = tokio::fs::write(&path, text).await {
            warn!(target: "validator.runner", path = %path, error = %e, "Failed to write metrics");
        }
    }

    finish(&outcome.report, report_path.as_deref()).await
}

/// Print the report, optionally write it to `path`, and map the exit code.
async fn finish(report: &RunReport, path: Option<&Path>) -> ExitCode {
    match serde_json::to_string_pretty(report) {
        Ok(json) => {
            println!("{json}");
            if let Some(path) = path {
                if let Err(e) = tokio::fs::write(path, &json).await {
                    error!(
                        target: "validator.runner",
                        path = %path.display(),
                        error = %e,
                        "Failed to write report"
                    );
                }
            }
        }
        Err(e) => eprintln!("Failed to serialize report: {e}"),
    }

    ExitCode::from(u8::try_from(report.exit_code()).unwrap_or(1))
}
