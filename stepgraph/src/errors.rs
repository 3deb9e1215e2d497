//! Error types for the stepgraph engine.
//!
//! Errors fall into two families. Construction errors are raised while a
//! graph is assembled and validated; they abort before any step runs.
//! Execution errors are scoped to a single step and end up recorded in the
//! run result instead of being returned to the caller.

use crate::core::{ArtifactId, ArtifactKind, ArtifactState, StepId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// The main error type for stepgraph operations.
#[derive(Debug, Error)]
pub enum StepgraphError {
    /// The graph or a step declaration is malformed.
    #[error("{0}")]
    Construction(#[from] ConstructionError),

    /// A step failed while executing.
    #[error("{0}")]
    Execution(#[from] ExecutionError),

    /// The artifact store rejected an operation.
    #[error("{0}")]
    Store(#[from] StoreError),

    /// Engine or run configuration is invalid.
    #[error("{0}")]
    Config(#[from] ConfigError),
}

/// Metadata about a construction error for better diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ContractErrorInfo {
    /// Error code (e.g., "GRAPH-004-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ContractErrorInfo {
    /// Creates a new contract error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Two steps share the same identity.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Duplicate step identity '{step}'")]
pub struct DuplicateStepError {
    /// The colliding identity.
    pub step: StepId,
}

impl DuplicateStepError {
    /// Returns diagnostic info.
    #[must_use]
    pub fn error_info(&self) -> ContractErrorInfo {
        ContractErrorInfo::new("GRAPH-001-DUPLICATE", self.to_string())
            .with_fix_hint("Give every step a unique identity.")
            .with_context_entry("step", self.step.as_str())
    }
}

/// An input binding names a step or output that does not exist.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Step '{step}' input '{input}' references unknown {}", describe_reference(.upstream, .output.as_deref()))]
pub struct UnresolvedReferenceError {
    /// The consuming step.
    pub step: StepId,
    /// The input binding (or explicit predecessor marker) that failed to resolve.
    pub input: String,
    /// The referenced upstream step.
    pub upstream: StepId,
    /// The referenced output name, when the step itself exists.
    pub output: Option<String>,
}

fn describe_reference(upstream: &StepId, output: Option<&str>) -> String {
    match output {
        Some(output) => format!("output '{upstream}.{output}'"),
        None => format!("step '{upstream}'"),
    }
}

impl UnresolvedReferenceError {
    /// Returns diagnostic info.
    #[must_use]
    pub fn error_info(&self) -> ContractErrorInfo {
        ContractErrorInfo::new("GRAPH-002-UNRESOLVED", self.to_string())
            .with_fix_hint("Check the upstream step identity and output name for typos.")
            .with_context_entry("step", self.step.as_str())
            .with_context_entry("upstream", self.upstream.as_str())
    }
}

/// A data edge connects incompatible artifact kinds.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error(
    "Type mismatch on edge {from}.{output} -> {to}.{input}: expected {expected}, found {actual}"
)]
pub struct TypeMismatchError {
    /// Producing step.
    pub from: StepId,
    /// Producing output name.
    pub output: String,
    /// Consuming step.
    pub to: StepId,
    /// Consuming input name.
    pub input: String,
    /// Kind the consumer declared.
    pub expected: ArtifactKind,
    /// Kind the producer declared.
    pub actual: ArtifactKind,
}

impl TypeMismatchError {
    /// Returns diagnostic info.
    #[must_use]
    pub fn error_info(&self) -> ContractErrorInfo {
        ContractErrorInfo::new("GRAPH-003-TYPE", self.to_string())
            .with_fix_hint("Bind the input to an output whose kind satisfies the requirement.")
            .with_context_entry("expected", self.expected.to_string())
            .with_context_entry("actual", self.actual.to_string())
    }
}

/// Error raised when a cycle is detected in the step graph.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Cycle detected in graph: {}", render_path(.cycle_path))]
pub struct CycleError {
    /// The steps forming the cycle, first step repeated at the end.
    pub cycle_path: Vec<StepId>,
}

fn render_path(path: &[StepId]) -> String {
    path.iter().map(StepId::as_str).collect::<Vec<_>>().join(" -> ")
}

impl CycleError {
    /// Creates a new cycle error.
    #[must_use]
    pub fn new(cycle_path: Vec<StepId>) -> Self {
        Self { cycle_path }
    }

    /// Returns the distinct steps on the cycle.
    #[must_use]
    pub fn steps(&self) -> &[StepId] {
        match self.cycle_path.split_last() {
            Some((_, rest)) if !rest.is_empty() => rest,
            _ => &self.cycle_path,
        }
    }

    /// Returns diagnostic info.
    #[must_use]
    pub fn error_info(&self) -> ContractErrorInfo {
        ContractErrorInfo::new(
            "GRAPH-004-CYCLE",
            format!("Graph contains a dependency cycle: {}", render_path(&self.cycle_path)),
        )
        .with_fix_hint("Remove one of the data bindings or explicit predecessors in the cycle.")
    }
}

/// An executor policy cannot be satisfied.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Invalid executor configuration for step '{step}': {reason}")]
pub struct BackendConfigError {
    /// The misconfigured step.
    pub step: StepId,
    /// What is wrong.
    pub reason: String,
}

impl BackendConfigError {
    /// Creates a new backend configuration error.
    #[must_use]
    pub fn new(step: StepId, reason: impl Into<String>) -> Self {
        Self {
            step,
            reason: reason.into(),
        }
    }

    /// Returns diagnostic info.
    #[must_use]
    pub fn error_info(&self) -> ContractErrorInfo {
        ContractErrorInfo::new("GRAPH-005-BACKEND", self.to_string())
            .with_fix_hint("Supply remote arguments for managed-remote steps, or register a remote backend.")
            .with_context_entry("step", self.step.as_str())
    }
}

/// A gate binding does not point at a validation-result artifact.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Gate '{gate_input}' on step '{step}' must be a validation result, found {}", describe_kind(.actual.as_ref()))]
pub struct GateTypeError {
    /// The gated step.
    pub step: StepId,
    /// The input named by the gate binding.
    pub gate_input: String,
    /// The kind found, or `None` when the input is not bound at all.
    pub actual: Option<ArtifactKind>,
}

fn describe_kind(kind: Option<&ArtifactKind>) -> String {
    kind.map_or_else(|| "no such input".to_string(), ToString::to_string)
}

impl GateTypeError {
    /// Returns diagnostic info.
    #[must_use]
    pub fn error_info(&self) -> ContractErrorInfo {
        ContractErrorInfo::new("GRAPH-006-GATE", self.to_string())
            .with_fix_hint("Gate on an input bound to a validation_result, model_blessing or infra_blessing output.")
            .with_context_entry("step", self.step.as_str())
    }
}

/// A single step declaration is malformed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Invalid step '{step}': {reason}")]
pub struct InvalidStepError {
    /// The offending step.
    pub step: StepId,
    /// What is wrong.
    pub reason: String,
}

impl InvalidStepError {
    /// Creates a new invalid step error.
    #[must_use]
    pub fn new(step: StepId, reason: impl Into<String>) -> Self {
        Self {
            step,
            reason: reason.into(),
        }
    }
}

/// Errors detected while assembling and validating a graph.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConstructionError {
    /// Two steps share an identity.
    #[error("{0}")]
    DuplicateStep(#[from] DuplicateStepError),

    /// An input binding could not be resolved.
    #[error("{0}")]
    UnresolvedReference(#[from] UnresolvedReferenceError),

    /// A data edge connects incompatible kinds.
    #[error("{0}")]
    TypeMismatch(#[from] TypeMismatchError),

    /// The edge set contains a cycle.
    #[error("{0}")]
    Cycle(#[from] CycleError),

    /// An executor policy is invalid.
    #[error("{0}")]
    BackendConfig(#[from] BackendConfigError),

    /// A gate binding is not a validation result.
    #[error("{0}")]
    GateType(#[from] GateTypeError),

    /// A step declaration is malformed.
    #[error("{0}")]
    InvalidStep(#[from] InvalidStepError),

    /// The graph has no steps.
    #[error("Graph '{0}' has no steps")]
    EmptyGraph(String),
}

impl ConstructionError {
    /// Returns diagnostic info with a stable error code.
    #[must_use]
    pub fn error_info(&self) -> ContractErrorInfo {
        match self {
            Self::DuplicateStep(e) => e.error_info(),
            Self::UnresolvedReference(e) => e.error_info(),
            Self::TypeMismatch(e) => e.error_info(),
            Self::Cycle(e) => e.error_info(),
            Self::BackendConfig(e) => e.error_info(),
            Self::GateType(e) => e.error_info(),
            Self::InvalidStep(e) => ContractErrorInfo::new("GRAPH-007-INVALID", e.to_string())
                .with_context_entry("step", e.step.as_str()),
            Self::EmptyGraph(name) => {
                ContractErrorInfo::new("GRAPH-008-EMPTY", self.to_string())
                    .with_fix_hint("Add at least one step before building.")
                    .with_context_entry("graph", name.clone())
            }
        }
    }

    /// Returns the stable error code.
    #[must_use]
    pub fn code(&self) -> String {
        self.error_info().code
    }
}

/// Errors scoped to the execution of a single step.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecutionError {
    /// The component or its backend reported a failure.
    #[error("Step '{step}' failed: {message}")]
    StepExecution {
        /// The failing step.
        step: StepId,
        /// Failure description.
        message: String,
    },

    /// An attempt exceeded the executor policy timeout.
    #[error("Step '{step}' timed out after {timeout_ms}ms")]
    StepTimeout {
        /// The step that timed out.
        step: StepId,
        /// The configured timeout.
        timeout_ms: u64,
    },

    /// The step was cancelled cooperatively.
    #[error("Step '{step}' cancelled")]
    Cancelled {
        /// The cancelled step.
        step: StepId,
    },

    /// The component finished without producing a declared output.
    #[error("Step '{step}' did not produce declared output '{output}'")]
    MissingOutput {
        /// The step.
        step: StepId,
        /// The missing output name.
        output: String,
    },

    /// A required input artifact was missing or no longer valid at dispatch.
    #[error("Step '{step}' input '{input}' is unavailable: {detail}")]
    InputUnavailable {
        /// The step.
        step: StepId,
        /// The input binding name.
        input: String,
        /// What was wrong with the artifact.
        detail: String,
    },

    /// The gate artifact had the wrong kind at run time.
    #[error("{0}")]
    Gate(#[from] GateTypeError),

    /// The artifact store rejected a state change.
    #[error("{0}")]
    Store(#[from] StoreError),
}

impl ExecutionError {
    /// Creates a step execution error.
    #[must_use]
    pub fn step_failed(step: &StepId, message: impl Into<String>) -> Self {
        Self::StepExecution {
            step: step.clone(),
            message: message.into(),
        }
    }

    /// Creates a timeout error.
    #[must_use]
    pub fn timeout(step: &StepId, timeout: Duration) -> Self {
        Self::StepTimeout {
            step: step.clone(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Creates a cancellation error.
    #[must_use]
    pub fn cancelled(step: &StepId) -> Self {
        Self::Cancelled { step: step.clone() }
    }

    /// Returns true if another attempt may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StepExecution { .. } | Self::StepTimeout { .. })
    }
}

/// Errors raised by artifact stores.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// No artifact has the given id.
    #[error("Artifact {0} not found")]
    NotFound(ArtifactId),

    /// The requested lifecycle transition is not allowed.
    #[error("Artifact {id} cannot move from {from} to {to}")]
    InvalidTransition {
        /// The artifact.
        id: ArtifactId,
        /// Current state.
        from: ArtifactState,
        /// Requested state.
        to: ArtifactState,
    },
}

/// Errors raised while loading or checking configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The concurrency limit must admit at least one step.
    #[error("Concurrency limit must be at least 1")]
    ZeroConcurrency,

    /// A configuration value could not be parsed.
    #[error("Invalid configuration: {0}")]
    Parse(String),

    /// The configuration file could not be read.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
