//! Round-trip an object through a fresh environment.

use super::{Check, CheckContext, CheckVerdict};
use crate::cluster::{ClusterError, ObjectSpec, ResourceKind, ResourceRef};
use crate::environment::QUOTA_NAME;
use common::error::ValidationError;
use serde_json::json;

pub const PROVISIONING: &str = "environment.provisioning";

const PROBE_NAME: &str = "validation-probe";

/// Creates a probe config map in the check's environment and reads it back.
/// When the environment carries a quota, the quota object must exist too.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvironmentProvisioning;

#[async_trait::async_trait]
impl Check for EnvironmentProvisioning {
    fn description(&self) -> &str {
        "namespaced objects can be created and read back"
    }

    async fn execute(&self, ctx: &CheckContext) -> Result<CheckVerdict, ValidationError> {
        let env = ctx.environment()?;
        let namespace = env.namespace().to_string();

        let probe = ObjectSpec::new(ResourceRef::namespaced(
            ResourceKind::ConfigMap,
            namespace.clone(),
            PROBE_NAME,
        ))
        .with_spec(json!({ "data": { "run-id": ctx.run_id.to_string() } }));
        let probe_ref = env.create_resource(probe, None).await?;

        let found = |id: ResourceRef| async move {
            ctx.resilience
                .call("get", || async {
                    match ctx.client.get(&id).await {
                        Ok(_) => Ok(true),
                        Err(ClusterError::NotFound(_)) => Ok(false),
                        Err(e) => Err(e),
                    }
                })
                .await
        };

        if !found(probe_ref.clone()).await? {
            return Ok(CheckVerdict::fail(format!(
                "{probe_ref} was accepted but cannot be read back"
            ))
            .with_detail("namespace", namespace));
        }

        if !env.quota().is_empty() {
            let quota = ResourceRef::namespaced(ResourceKind::ResourceQuota, namespace.clone(), QUOTA_NAME);
            if !found(quota.clone()).await? {
                return Ok(CheckVerdict::fail(format!("{quota} is missing"))
                    .with_detail("namespace", namespace));
            }
        }

        Ok(CheckVerdict::pass(format!("environment {namespace} provisioned"))
            .with_detail("namespace", namespace)
            .with_detail("probe", probe_ref.to_string()))
    }
}
