//! Checks with a predetermined outcome.
//!
//! A [`ScriptedCheck`] optionally waits, optionally provisions objects in
//! its environment, then returns its scripted outcome. Clones share their
//! invocation counter, so keep one to assert on after registering another.

use common::error::ValidationError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use validator::checks::{Check, CheckContext, CheckVerdict};
use validator::cluster::{ObjectSpec, ResourceKind, ResourceRef};

/// What a scripted check returns.
#[derive(Debug, Clone)]
pub enum Script {
    Pass,
    Fail(String),
    Skip(String),
    Error(ValidationError),
    /// Wait until cancelled.
    Hang,
}

#[derive(Debug, Clone)]
pub struct ScriptedCheck {
    script: Script,
    delay: Option<Duration>,
    creates: Vec<(ResourceKind, String)>,
    calls: Arc<AtomicUsize>,
    seen_params: Arc<Mutex<Vec<serde_json::Map<String, serde_json::Value>>>>,
}

impl ScriptedCheck {
    #[must_use]
    pub fn new(script: Script) -> Self {
        Self {
            script,
            delay: None,
            creates: Vec::new(),
            calls: Arc::new(AtomicUsize::new(0)),
            seen_params: Arc::new(Mutex::new(Vec::new())),
        }
    }

    #[must_use]
    pub fn pass() -> Self {
        Self::new(Script::Pass)
    }

    #[must_use]
    pub fn fail(message: &str) -> Self {
        Self::new(Script::Fail(message.to_string()))
    }

    #[must_use]
    pub fn error(error: ValidationError) -> Self {
        Self::new(Script::Error(error))
    }

    #[must_use]
    pub fn hang() -> Self {
        Self::new(Script::Hang)
    }

    /// Sleep before producing the outcome.
    #[must_use]
    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Create an object of `kind` named `name` in the check's environment
    /// before producing the outcome.
    #[must_use]
    pub fn creating(mut self, kind: ResourceKind, name: &str) -> Self {
        self.creates.push((kind, name.to_string()));
        self
    }

    /// Number of times `execute` was entered.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Per-check parameters seen by each invocation.
    #[must_use]
    pub fn seen_params(&self) -> Vec<serde_json::Map<String, serde_json::Value>> {
        self.seen_params.lock().unwrap().clone()
    }

    /// Shared handle for registering in a `CheckRegistry`.
    #[must_use]
    pub fn into_check(self) -> Arc<dyn Check> {
        Arc::new(self)
    }
}

#[async_trait::async_trait]
impl Check for ScriptedCheck {
    fn description(&self) -> &str {
        "scripted test check"
    }

    async fn execute(&self, ctx: &CheckContext) -> Result<CheckVerdict, ValidationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen_params.lock().unwrap().push(ctx.params.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        for (kind, name) in &self.creates {
            let env = ctx.environment()?;
            let id = ResourceRef::namespaced(*kind, env.namespace(), name.as_str());
            env.create_resource(ObjectSpec::new(id), None).await?;
        }

        match &self.script {
            Script::Pass => Ok(CheckVerdict::pass("scripted pass")),
            Script::Fail(message) => Ok(CheckVerdict::fail(message.clone())),
            Script::Skip(message) => Ok(CheckVerdict::skipped(message.clone())),
            Script::Error(error) => Err(error.clone()),
            Script::Hang => {
                ctx.cancel.cancelled().await;
                Err(ValidationError::Permanent("cancelled".to_string()))
            }
        }
    }
}
