//! Publishes a model artifact to a named destination.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::core::{Artifact, ArtifactKind, StepId};
use crate::errors::ExecutionError;
use crate::step::{Component, ProducedOutput, StepContext, StepResult, StepSpec};

/// Input consumed by the pusher.
pub const PUSHER_MODEL_INPUT: &str = "model";
/// Blessing input a pusher may be gated on.
pub const PUSHER_BLESSING_INPUT: &str = "blessing";
/// Output produced by the pusher.
pub const PUSHER_OUTPUT: &str = "pushed_model";

/// Where a model is published.
///
/// `base_template` may contain `{pipeline_name}` and `{pipeline_root}`
/// placeholders; `name` is the logical model or index name appended to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushDestination {
    /// Base location, possibly templated.
    pub base_template: String,
    /// Logical model name.
    pub name: String,
}

impl PushDestination {
    /// Creates a destination.
    #[must_use]
    pub fn new(base_template: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            base_template: base_template.into(),
            name: name.into(),
        }
    }

    /// Resolves placeholders and joins the logical name.
    #[must_use]
    pub fn resolve(&self, pipeline_name: &str, pipeline_root: &str) -> String {
        let base = self
            .base_template
            .replace("{pipeline_name}", pipeline_name)
            .replace("{pipeline_root}", pipeline_root);
        format!("{}/{}", base.trim_end_matches('/'), self.name)
    }
}

impl fmt::Display for PushDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base_template.trim_end_matches('/'), self.name)
    }
}

/// Receives published models. The engine performs no filesystem work itself.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PublishSink: Send + Sync {
    /// Publishes `model` at `destination`.
    async fn publish(&self, model: &Artifact, destination: &str) -> Result<(), String>;
}

/// Forwards a model artifact to a [`PublishSink`].
pub struct Pusher {
    destination: PushDestination,
    sink: Arc<dyn PublishSink>,
}

impl Pusher {
    /// Creates a pusher.
    #[must_use]
    pub fn new(destination: PushDestination, sink: Arc<dyn PublishSink>) -> Self {
        Self { destination, sink }
    }

    /// Returns the destination.
    #[must_use]
    pub fn destination(&self) -> &PushDestination {
        &self.destination
    }

    /// Wraps the pusher in a step consuming `upstream.output` as its model.
    #[must_use]
    pub fn into_step(
        self,
        id: impl Into<StepId>,
        upstream: impl Into<StepId>,
        output: impl Into<String>,
    ) -> StepSpec {
        let destination = serde_json::to_value(&self.destination).unwrap_or(serde_json::Value::Null);
        StepSpec::new(id, Arc::new(self))
            .input(PUSHER_MODEL_INPUT, ArtifactKind::Model, upstream, output)
            .param("destination", destination)
            .output(PUSHER_OUTPUT, ArtifactKind::PushedModel)
    }
}

impl fmt::Debug for Pusher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pusher")
            .field("destination", &self.destination)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Component for Pusher {
    fn name(&self) -> &str {
        "pusher"
    }

    async fn run(&self, ctx: &StepContext) -> Result<StepResult, ExecutionError> {
        let model = ctx.require_input(PUSHER_MODEL_INPUT)?;
        let destination = self.destination.resolve(&ctx.pipeline_name, &ctx.pipeline_root);

        tracing::info!(step = %ctx.step, model = %model.location, destination = %destination, "Pushing model");
        self.sink
            .publish(model, &destination)
            .await
            .map_err(|e| ctx.fail(format!("push to '{destination}' failed: {e}")))?;

        let output = ProducedOutput::new()
            .with_property("pushed", serde_json::Value::Bool(true))
            .with_property("destination", serde_json::Value::String(destination))
            .with_property("source_model", serde_json::Value::String(model.location.clone()));
        Ok(StepResult::new().with_output(PUSHER_OUTPUT, output))
    }
}
