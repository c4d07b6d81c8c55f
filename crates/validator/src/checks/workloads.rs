//! Workload readiness after a deployment.

use super::{Check, CheckContext, CheckVerdict};
use crate::cluster::{ClusterError, ResourceKind, ResourceRef};
use crate::resilience::{poll_until, PollConfig};
use common::error::{ErrorKind, ValidationError};
use std::sync::Mutex;
use std::time::Duration;

pub const DEPLOYMENTS_READY: &str = "services.deployments-ready";

/// Verifies that deployments report themselves available.
///
/// Parameters:
/// - `namespace`: where to look (defaults to the check's environment)
/// - `deployments`: names to check (defaults to every deployment found)
/// - `wait_seconds`: keep polling this long before judging (default 0)
#[derive(Debug, Clone, Copy, Default)]
pub struct DeploymentsReady;

impl DeploymentsReady {
    async fn unready(
        ctx: &CheckContext,
        deployments: &[ResourceRef],
    ) -> Result<Vec<String>, ValidationError> {
        let mut unready = Vec::new();
        for id in deployments {
            let status = ctx
                .resilience
                .call("get", || async {
                    match ctx.client.get(id).await {
                        Ok(status) => Ok(Some(status)),
                        Err(ClusterError::NotFound(_)) => Ok(None),
                        Err(e) => Err(e),
                    }
                })
                .await?;
            match status {
                Some(status) if status.ready => {}
                Some(_) => unready.push(id.name.clone()),
                None => unready.push(format!("{} (missing)", id.name)),
            }
        }
        Ok(unready)
    }
}

#[async_trait::async_trait]
impl Check for DeploymentsReady {
    fn description(&self) -> &str {
        "deployments report available replicas"
    }

    async fn execute(&self, ctx: &CheckContext) -> Result<CheckVerdict, ValidationError> {
        let namespace = match ctx.param_str("namespace") {
            Some(ns) => ns,
            None => ctx.environment()?.namespace().to_string(),
        };

        let named = ctx.param_strings("deployments");
        let deployments: Vec<ResourceRef> = if named.is_empty() {
            ctx.resilience
                .call("list", || {
                    ctx.client.list(ResourceKind::Deployment, Some(&namespace))
                })
                .await?
        } else {
            named
                .iter()
                .map(|name| ResourceRef::namespaced(ResourceKind::Deployment, namespace.clone(), name))
                .collect()
        };

        if deployments.is_empty() {
            return Ok(CheckVerdict::fail(format!("no deployments found in {namespace}"))
                .with_detail("namespace", namespace.clone())
                .with_detail("unready", Vec::<String>::new()));
        }

        let wait = Duration::from_secs(ctx.param_u64("wait_seconds").unwrap_or(0));
        let last = Mutex::new(Vec::new());
        let unready = if wait.is_zero() {
            Self::unready(ctx, &deployments).await?
        } else {
            let poll = PollConfig::new(wait, Duration::from_secs(2));
            let outcome = poll_until("deployments to become available", poll, || async {
                let unready = Self::unready(ctx, &deployments).await?;
                let done = unready.is_empty();
                *last.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = unready;
                Ok(done)
            })
            .await;
            match outcome {
                Ok(()) => Vec::new(),
                // Running out of wait time is the failure being checked for.
                Err(e) if e.kind() == ErrorKind::Timeout => {
                    last.into_inner().unwrap_or_else(std::sync::PoisonError::into_inner)
                }
                Err(e) => return Err(e),
            }
        };

        let total = deployments.len();
        let verdict = if unready.is_empty() {
            CheckVerdict::pass(format!("{total} deployments available in {namespace}"))
        } else {
            CheckVerdict::fail(format!(
                "{} of {total} deployments unready in {namespace}: {}",
                unready.len(),
                unready.join(", ")
            ))
        };
        Ok(verdict
            .with_detail("namespace", namespace)
            .with_detail("total", total)
            .with_detail("unready", unready))
    }
}
