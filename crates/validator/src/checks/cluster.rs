//! Cluster-level checks: control plane reachability and node capacity.

use super::{Check, CheckContext, CheckVerdict};
use crate::cluster::ResourceKind;
use common::error::ValidationError;
use serde_json::json;

pub const API_REACHABLE: &str = "cluster.api-reachable";
pub const NODE_CAPACITY: &str = "cluster.node-capacity";

/// Lists namespaces to prove the control plane answers.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApiReachable;

#[async_trait::async_trait]
impl Check for ApiReachable {
    fn description(&self) -> &str {
        "control plane answers list requests"
    }

    async fn execute(&self, ctx: &CheckContext) -> Result<CheckVerdict, ValidationError> {
        let namespaces = ctx
            .resilience
            .call("list", || ctx.client.list(ResourceKind::Namespace, None))
            .await?;
        Ok(
            CheckVerdict::pass(format!("control plane reachable, {} namespaces visible", namespaces.len()))
                .with_detail("namespaces", namespaces.len()),
        )
    }
}

/// Compares ready nodes and allocatable capacity against minimums.
///
/// Parameters: `min_nodes`, `min_cpu_millis`, `min_memory_mib`. Unset
/// minimums are not checked.
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeCapacity;

#[async_trait::async_trait]
impl Check for NodeCapacity {
    fn description(&self) -> &str {
        "cluster has enough ready nodes and allocatable capacity"
    }

    async fn execute(&self, ctx: &CheckContext) -> Result<CheckVerdict, ValidationError> {
        let summary = ctx
            .resilience
            .call("node_summary", || ctx.client.node_summary())
            .await?;
        let memory_mib = summary.allocatable_memory_bytes / (1024 * 1024);

        let mut shortfalls = Vec::new();
        if let Some(min) = ctx.param_u64("min_nodes") {
            if u64::from(summary.ready_nodes) < min {
                shortfalls.push(format!("{} ready nodes < {min}", summary.ready_nodes));
            }
        }
        if let Some(min) = ctx.param_u64("min_cpu_millis") {
            if summary.allocatable_cpu_millis < min {
                shortfalls.push(format!(
                    "{}m allocatable cpu < {min}m",
                    summary.allocatable_cpu_millis
                ));
            }
        }
        if let Some(min) = ctx.param_u64("min_memory_mib") {
            if memory_mib < min {
                shortfalls.push(format!("{memory_mib}Mi allocatable memory < {min}Mi"));
            }
        }

        let capacity = json!({
            "ready_nodes": summary.ready_nodes,
            "allocatable_cpu_millis": summary.allocatable_cpu_millis,
            "allocatable_memory_mib": memory_mib,
        });
        let verdict = if shortfalls.is_empty() {
            CheckVerdict::pass(format!(
                "{} ready nodes, {}m cpu, {memory_mib}Mi memory allocatable",
                summary.ready_nodes, summary.allocatable_cpu_millis
            ))
        } else {
            CheckVerdict::fail(format!("insufficient capacity: {}", shortfalls.join("; ")))
                .with_detail("shortfalls", shortfalls)
        };
        Ok(verdict.with_detail("capacity", capacity))
    }
}
