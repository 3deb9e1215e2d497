//! Component trait and the context handed to it.
//!
//! A component is the opaque unit of work behind a step. The engine never
//! looks inside it: it supplies resolved input artifacts, parameters and
//! output locations, and records whatever the component reports back.

use crate::core::{Artifact, StepId};
use crate::errors::ExecutionError;
use crate::scheduler::CancellationToken;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;
use uuid::Uuid;

/// Trait for step implementations.
#[async_trait]
pub trait Component: Send + Sync + Debug {
    /// Returns the component name used in logs.
    fn name(&self) -> &str;

    /// Runs one attempt of the step.
    ///
    /// # Errors
    ///
    /// Returns an error when the attempt fails; the scheduler decides
    /// whether to retry.
    async fn run(&self, ctx: &StepContext) -> Result<StepResult, ExecutionError>;
}

/// Everything a component can see about the step it runs as.
#[derive(Debug, Clone)]
pub struct StepContext {
    /// The run this attempt belongs to.
    pub run_id: Uuid,
    /// Logical pipeline name.
    pub pipeline_name: String,
    /// Root location under which outputs are written.
    pub pipeline_root: String,
    /// The step being run.
    pub step: StepId,
    /// Resolved input artifacts by binding name. Absent optional inputs are missing.
    pub inputs: BTreeMap<String, Artifact>,
    /// Scalar parameters.
    pub params: BTreeMap<String, serde_json::Value>,
    /// Location assigned to each declared output.
    pub output_locations: BTreeMap<String, String>,
    /// One-based attempt counter.
    pub attempt: u32,
    /// Run-level cancellation signal.
    pub cancellation: Arc<CancellationToken>,
}

impl StepContext {
    /// Creates a context with no inputs, parameters or outputs.
    #[must_use]
    pub fn new(run_id: Uuid, step: impl Into<StepId>) -> Self {
        Self {
            run_id,
            pipeline_name: String::new(),
            pipeline_root: String::new(),
            step: step.into(),
            inputs: BTreeMap::new(),
            params: BTreeMap::new(),
            output_locations: BTreeMap::new(),
            attempt: 1,
            cancellation: Arc::new(CancellationToken::new()),
        }
    }

    /// Returns a resolved input artifact.
    #[must_use]
    pub fn input(&self, name: &str) -> Option<&Artifact> {
        self.inputs.get(name)
    }

    /// Returns a required input artifact.
    ///
    /// # Errors
    ///
    /// Returns an execution error naming the input when it is absent.
    pub fn require_input(&self, name: &str) -> Result<&Artifact, ExecutionError> {
        self.inputs
            .get(name)
            .ok_or_else(|| self.fail(format!("missing input '{name}'")))
    }

    /// Returns a parameter value.
    #[must_use]
    pub fn param(&self, name: &str) -> Option<&serde_json::Value> {
        self.params.get(name)
    }

    /// Returns the location assigned to a declared output.
    #[must_use]
    pub fn output_location(&self, name: &str) -> Option<&str> {
        self.output_locations.get(name).map(String::as_str)
    }

    /// Returns true once the run has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Builds a step execution error for this step.
    #[must_use]
    pub fn fail(&self, message: impl Into<String>) -> ExecutionError {
        ExecutionError::step_failed(&self.step, message)
    }
}

/// What a component reports for one output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProducedOutput {
    /// Scalar properties merged into the artifact.
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
    /// Content fingerprint, when the component can compute one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

impl ProducedOutput {
    /// Creates an output with no properties.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a property.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    /// Sets the content fingerprint.
    #[must_use]
    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }
}

/// Result of a successful attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    /// Reported outputs by declared name.
    #[serde(default)]
    pub outputs: BTreeMap<String, ProducedOutput>,
}

impl StepResult {
    /// Creates an empty result.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an output.
    #[must_use]
    pub fn with_output(mut self, name: impl Into<String>, output: ProducedOutput) -> Self {
        self.outputs.insert(name.into(), output);
        self
    }

    /// Adds an output with no properties.
    #[must_use]
    pub fn emit(self, name: impl Into<String>) -> Self {
        self.with_output(name, ProducedOutput::new())
    }

    /// Returns a reported output.
    #[must_use]
    pub fn output(&self, name: &str) -> Option<&ProducedOutput> {
        self.outputs.get(name)
    }
}
