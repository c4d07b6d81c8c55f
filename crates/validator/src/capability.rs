//! Cluster prerequisites a check may declare.
//!
//! Capabilities are written as `kind:value` strings in pipeline configuration:
//!
//! - `crd:<name>` - a CustomResourceDefinition is installed
//! - `namespace:<name>` - a namespace exists
//! - `min-nodes:<n>` - at least `n` ready nodes
//! - `min-cpu-millis:<n>` - at least `n` millicores allocatable in total
//! - `min-memory-mib:<n>` - at least `n` MiB allocatable in total
//!
//! Cluster-wide objects are only read, never created or destroyed.

use crate::cluster::{ClusterClient, ClusterError, NodeSummary, ResourceRef};
use crate::resilience::Resilience;
use common::error::ValidationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One declared prerequisite.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Capability {
    Crd(String),
    Namespace(String),
    MinNodes(u32),
    MinCpuMillis(u64),
    MinMemoryMib(u64),
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Crd(name) => write!(f, "crd:{name}"),
            Capability::Namespace(name) => write!(f, "namespace:{name}"),
            Capability::MinNodes(n) => write!(f, "min-nodes:{n}"),
            Capability::MinCpuMillis(n) => write!(f, "min-cpu-millis:{n}"),
            Capability::MinMemoryMib(n) => write!(f, "min-memory-mib:{n}"),
        }
    }
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, value) = s
            .split_once(':')
            .ok_or_else(|| format!("capability '{s}' must look like kind:value"))?;
        let value = value.trim();
        if value.is_empty() {
            return Err(format!("capability '{s}' has an empty value"));
        }
        let number = |v: &str| {
            v.parse::<u64>()
                .map_err(|_| format!("capability '{s}' needs a non-negative integer"))
        };
        match kind.trim() {
            "crd" => Ok(Capability::Crd(value.to_string())),
            "namespace" => Ok(Capability::Namespace(value.to_string())),
            "min-nodes" => {
                let n = number(value)?;
                u32::try_from(n)
                    .map(Capability::MinNodes)
                    .map_err(|_| format!("capability '{s}' is out of range"))
            }
            "min-cpu-millis" => number(value).map(Capability::MinCpuMillis),
            "min-memory-mib" => number(value).map(Capability::MinMemoryMib),
            other => Err(format!("unknown capability kind '{other}'")),
        }
    }
}

impl TryFrom<String> for Capability {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Capability> for String {
    fn from(value: Capability) -> Self {
        value.to_string()
    }
}

/// Return the subset of `required` the cluster does not currently satisfy.
///
/// # Errors
///
/// Propagates cluster errors that survive the retry policy. A missing
/// object is not an error; it makes the capability missing.
pub async fn missing_capabilities(
    client: &dyn ClusterClient,
    resilience: &Resilience,
    required: &[Capability],
) -> Result<Vec<Capability>, ValidationError> {
    let mut missing = Vec::new();
    let mut nodes: Option<NodeSummary> = None;

    for capability in required {
        let satisfied = match capability {
            Capability::Crd(name) => {
                resilience
                    .call("crd_exists", || client.crd_exists(name))
                    .await?
            }
            Capability::Namespace(name) => {
                let id = ResourceRef::namespace(name.clone());
                resilience
                    .call("get", || async {
                        match client.get(&id).await {
                            Ok(_) => Ok(true),
                            Err(ClusterError::NotFound(_)) => Ok(false),
                            Err(e) => Err(e),
                        }
                    })
                    .await?
            }
            Capability::MinNodes(_)
            | Capability::MinCpuMillis(_)
            | Capability::MinMemoryMib(_) => {
                let summary = match nodes {
                    Some(summary) => summary,
                    None => {
                        let summary = resilience
                            .call("node_summary", || client.node_summary())
                            .await?;
                        nodes = Some(summary);
                        summary
                    }
                };
                node_capacity_satisfies(&summary, capability)
            }
        };
        if !satisfied {
            missing.push(capability.clone());
        }
    }

    Ok(missing)
}

fn node_capacity_satisfies(summary: &NodeSummary, capability: &Capability) -> bool {
    match capability {
        Capability::MinNodes(n) => summary.ready_nodes >= *n,
        Capability::MinCpuMillis(n) => summary.allocatable_cpu_millis >= *n,
        Capability::MinMemoryMib(n) => {
            summary.allocatable_memory_bytes >= n.saturating_mul(1024 * 1024)
        }
        Capability::Crd(_) | Capability::Namespace(_) => true,
    }
}
