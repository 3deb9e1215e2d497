//! Step specifications.

use super::{Component, ExecutorPolicy};
use crate::core::{ArtifactKind, ArtifactRef, StepId};
use crate::errors::{ConstructionError, GateTypeError, InvalidStepError, UnresolvedReferenceError};
use crate::scheduler::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// Where an input binding takes its artifact from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum InputSource {
    /// A named output of another step in the same graph.
    Upstream {
        /// The producing step.
        step: StepId,
        /// The output name on the producing step.
        output: String,
    },
    /// An artifact that already exists outside the graph.
    Import {
        /// Opaque location of the external artifact.
        location: String,
    },
}

/// A named, typed input of a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputBinding {
    /// Binding name, unique within the step.
    pub name: String,
    /// Where the artifact comes from.
    pub source: InputSource,
    /// The kind the step requires.
    pub kind: ArtifactKind,
    /// Whether the step can run without this input.
    #[serde(default)]
    pub optional: bool,
}

impl InputBinding {
    /// Returns the upstream step, if the binding is a data edge.
    #[must_use]
    pub fn upstream(&self) -> Option<&StepId> {
        match &self.source {
            InputSource::Upstream { step, .. } => Some(step),
            InputSource::Import { .. } => None,
        }
    }
}

/// A named, typed output of a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputDecl {
    /// Output name, unique within the step.
    pub name: String,
    /// The kind the step produces.
    pub kind: ArtifactKind,
}

/// Immutable declaration of one unit of work.
#[derive(Debug, Clone)]
pub struct StepSpec {
    /// Unique identity within a graph.
    pub id: StepId,
    /// The implementation.
    pub component: Arc<dyn Component>,
    /// Ordered input bindings.
    pub inputs: Vec<InputBinding>,
    /// Ordered output declarations.
    pub outputs: Vec<OutputDecl>,
    /// Scalar parameters.
    pub params: BTreeMap<String, serde_json::Value>,
    /// Explicit predecessors with no data flow.
    pub after: Vec<StepId>,
    /// Executor policy.
    pub executor: ExecutorPolicy,
    /// Name of the input whose "passed" property gates execution.
    pub gate: Option<String>,
    /// Whether a failure of this step leaves the run status untouched.
    pub optional: bool,
}

impl StepSpec {
    /// Creates a step with no inputs or outputs.
    #[must_use]
    pub fn new(id: impl Into<StepId>, component: Arc<dyn Component>) -> Self {
        Self {
            id: id.into(),
            component,
            inputs: Vec::new(),
            outputs: Vec::new(),
            params: BTreeMap::new(),
            after: Vec::new(),
            executor: ExecutorPolicy::default(),
            gate: None,
            optional: false,
        }
    }

    fn bind(mut self, name: impl Into<String>, source: InputSource, kind: ArtifactKind, optional: bool) -> Self {
        self.inputs.push(InputBinding {
            name: name.into(),
            source,
            kind,
            optional,
        });
        self
    }

    /// Binds an input to a named output of another step.
    #[must_use]
    pub fn input(
        self,
        name: impl Into<String>,
        kind: ArtifactKind,
        upstream: impl Into<StepId>,
        output: impl Into<String>,
    ) -> Self {
        let source = InputSource::Upstream {
            step: upstream.into(),
            output: output.into(),
        };
        self.bind(name, source, kind, false)
    }

    /// Binds an input the step can run without.
    #[must_use]
    pub fn optional_input(
        self,
        name: impl Into<String>,
        kind: ArtifactKind,
        upstream: impl Into<StepId>,
        output: impl Into<String>,
    ) -> Self {
        let source = InputSource::Upstream {
            step: upstream.into(),
            output: output.into(),
        };
        self.bind(name, source, kind, true)
    }

    /// Binds an input to a typed output reference, requiring the same kind.
    #[must_use]
    pub fn consume(self, name: impl Into<String>, artifact: &ArtifactRef) -> Self {
        let source = InputSource::Upstream {
            step: artifact.step.clone(),
            output: artifact.output.clone(),
        };
        self.bind(name, source, artifact.kind, false)
    }

    /// Binds an input to an artifact that exists outside the graph.
    #[must_use]
    pub fn import(self, name: impl Into<String>, kind: ArtifactKind, location: impl Into<String>) -> Self {
        let source = InputSource::Import {
            location: location.into(),
        };
        self.bind(name, source, kind, false)
    }

    /// Declares an output.
    #[must_use]
    pub fn output(mut self, name: impl Into<String>, kind: ArtifactKind) -> Self {
        self.outputs.push(OutputDecl {
            name: name.into(),
            kind,
        });
        self
    }

    /// Sets a parameter.
    #[must_use]
    pub fn param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    /// Adds an explicit predecessor.
    #[must_use]
    pub fn after(mut self, step: impl Into<StepId>) -> Self {
        self.after.push(step.into());
        self
    }

    /// Sets the executor policy.
    #[must_use]
    pub fn executor(mut self, policy: ExecutorPolicy) -> Self {
        self.executor = policy;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.executor.retry = Some(retry);
        self
    }

    /// Sets the per-attempt timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.executor = self.executor.with_timeout(timeout);
        self
    }

    /// Gates execution on the "passed" property of input `input`.
    #[must_use]
    pub fn gated_on(mut self, input: impl Into<String>) -> Self {
        self.gate = Some(input.into());
        self
    }

    /// Marks the step as optional.
    #[must_use]
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Returns an input binding by name.
    #[must_use]
    pub fn binding(&self, name: &str) -> Option<&InputBinding> {
        self.inputs.iter().find(|b| b.name == name)
    }

    /// Returns the declared kind of an output.
    #[must_use]
    pub fn output_kind(&self, name: &str) -> Option<ArtifactKind> {
        self.outputs.iter().find(|o| o.name == name).map(|o| o.kind)
    }

    /// Returns a typed reference to one of this step's outputs.
    ///
    /// # Errors
    ///
    /// Returns an error if no output with that name is declared.
    pub fn output_ref(&self, name: &str) -> Result<ArtifactRef, UnresolvedReferenceError> {
        self.output_kind(name)
            .map(|kind| ArtifactRef {
                step: self.id.clone(),
                output: name.to_string(),
                kind,
            })
            .ok_or_else(|| UnresolvedReferenceError {
                step: self.id.clone(),
                input: name.to_string(),
                upstream: self.id.clone(),
                output: Some(name.to_string()),
            })
    }

    /// Returns every output as a typed reference, keyed by name.
    #[must_use]
    pub fn output_refs(&self) -> BTreeMap<String, ArtifactRef> {
        self.outputs
            .iter()
            .map(|o| {
                let r = ArtifactRef {
                    step: self.id.clone(),
                    output: o.name.clone(),
                    kind: o.kind,
                };
                (o.name.clone(), r)
            })
            .collect()
    }

    /// Validates the declaration in isolation.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed identities, repeated input or output
    /// names, self dependencies and gates naming an unbound input.
    pub fn validate(&self) -> Result<(), ConstructionError> {
        if !self.id.is_valid() {
            return Err(InvalidStepError::new(
                self.id.clone(),
                "identity must start with a letter or '_' and contain only letters, digits, '_', '.' or '-'",
            )
            .into());
        }

        let mut seen = HashSet::new();
        for binding in &self.inputs {
            if !seen.insert(binding.name.as_str()) {
                return Err(InvalidStepError::new(
                    self.id.clone(),
                    format!("input '{}' is bound twice", binding.name),
                )
                .into());
            }
            if binding.upstream() == Some(&self.id) {
                return Err(InvalidStepError::new(
                    self.id.clone(),
                    format!("input '{}' consumes the step's own output", binding.name),
                )
                .into());
            }
        }

        let mut seen = HashSet::new();
        for output in &self.outputs {
            if !seen.insert(output.name.as_str()) {
                return Err(InvalidStepError::new(
                    self.id.clone(),
                    format!("output '{}' is declared twice", output.name),
                )
                .into());
            }
        }

        if self.after.contains(&self.id) {
            return Err(InvalidStepError::new(self.id.clone(), "step cannot run after itself").into());
        }

        if let Some(ref gate) = self.gate {
            if self.binding(gate).is_none() {
                return Err(GateTypeError {
                    step: self.id.clone(),
                    gate_input: gate.clone(),
                    actual: None,
                }
                .into());
            }
        }

        Ok(())
    }
}
