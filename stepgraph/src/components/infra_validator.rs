//! Checks that a model can be served before it is published.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::core::{Artifact, ArtifactKind, StepId};
use crate::errors::ExecutionError;
use crate::gate::PASSED_PROPERTY;
use crate::step::{Component, ProducedOutput, StepContext, StepResult, StepSpec};

/// Input consumed by the validator.
pub const VALIDATOR_MODEL_INPUT: &str = "model";
/// Output produced by the validator.
pub const VALIDATOR_OUTPUT: &str = "blessing";

fn default_max_wait_seconds() -> u64 {
    60
}

fn default_retry_count() -> u32 {
    3
}

/// How long and how often to probe a candidate model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationSpec {
    /// Upper bound on a single probe.
    #[serde(default = "default_max_wait_seconds")]
    pub max_wait_seconds: u64,
    /// Number of probes before giving up.
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
}

impl Default for ValidationSpec {
    fn default() -> Self {
        Self {
            max_wait_seconds: default_max_wait_seconds(),
            retry_count: default_retry_count(),
        }
    }
}

impl ValidationSpec {
    /// Creates a validation spec.
    #[must_use]
    pub fn new(max_wait_seconds: u64, retry_count: u32) -> Self {
        Self {
            max_wait_seconds,
            retry_count,
        }
    }

    /// Returns the per-probe time limit.
    #[must_use]
    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_seconds)
    }
}

/// Loads a model into a serving environment and reports whether it answered.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ServingProbe: Send + Sync {
    /// Probes `model` once.
    async fn probe(&self, model: &Artifact) -> Result<(), String>;
}

/// Emits an infra blessing whose `passed` property records the probe verdict.
///
/// A model that never answers is not an execution failure: the blessing is
/// still produced, with `passed = false`, so that gated steps skip.
pub struct InfraValidator {
    spec: ValidationSpec,
    probe: Arc<dyn ServingProbe>,
}

impl InfraValidator {
    /// Creates a validator.
    #[must_use]
    pub fn new(spec: ValidationSpec, probe: Arc<dyn ServingProbe>) -> Self {
        Self { spec, probe }
    }

    /// Returns the validation spec.
    #[must_use]
    pub fn spec(&self) -> ValidationSpec {
        self.spec
    }

    /// Wraps the validator in a step consuming `upstream.output` as its model.
    #[must_use]
    pub fn into_step(
        self,
        id: impl Into<StepId>,
        upstream: impl Into<StepId>,
        output: impl Into<String>,
    ) -> StepSpec {
        let spec = serde_json::to_value(self.spec).unwrap_or(serde_json::Value::Null);
        StepSpec::new(id, Arc::new(self))
            .input(VALIDATOR_MODEL_INPUT, ArtifactKind::Model, upstream, output)
            .param("validation_spec", spec)
            .output(VALIDATOR_OUTPUT, ArtifactKind::InfraBlessing)
    }
}

impl fmt::Debug for InfraValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InfraValidator")
            .field("spec", &self.spec)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Component for InfraValidator {
    fn name(&self) -> &str {
        "infra_validator"
    }

    async fn run(&self, ctx: &StepContext) -> Result<StepResult, ExecutionError> {
        let model = ctx.require_input(VALIDATOR_MODEL_INPUT)?;
        let tries = self.spec.retry_count.max(1);
        let mut passed = false;
        let mut last_error = None;
        let mut used = 0;

        for attempt in 1..=tries {
            if ctx.is_cancelled() {
                return Err(ExecutionError::cancelled(&ctx.step));
            }
            used = attempt;
            match tokio::time::timeout(self.spec.max_wait(), self.probe.probe(model)).await {
                Ok(Ok(())) => {
                    passed = true;
                    break;
                }
                Ok(Err(e)) => {
                    tracing::debug!(step = %ctx.step, attempt, error = %e, "Serving probe failed");
                    last_error = Some(e);
                }
                Err(_) => {
                    tracing::debug!(step = %ctx.step, attempt, max_wait_seconds = self.spec.max_wait_seconds, "Serving probe timed out");
                    last_error = Some(format!("no response within {}s", self.spec.max_wait_seconds));
                }
            }
        }

        if passed {
            tracing::info!(step = %ctx.step, tries = used, "Model blessed for serving");
        } else {
            tracing::warn!(step = %ctx.step, tries = used, error = last_error.as_deref().unwrap_or(""), "Model not blessed");
        }

        let mut output = ProducedOutput::new()
            .with_property(PASSED_PROPERTY, serde_json::Value::Bool(passed))
            .with_property("tries", serde_json::json!(used));
        if let Some(error) = last_error.filter(|_| !passed) {
            output = output.with_property("last_error", serde_json::Value::String(error));
        }
        Ok(StepResult::new().with_output(VALIDATOR_OUTPUT, output))
    }
}
