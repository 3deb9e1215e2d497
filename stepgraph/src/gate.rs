//! Gate evaluation.
//!
//! A gated step names one of its inputs; that input must carry a
//! validation-result artifact, and its "passed" property decides whether the
//! step runs. Anything other than a boolean `true` keeps the gate closed.

use crate::core::Artifact;
use crate::errors::GateTypeError;
use crate::registry::TypeRegistry;
use crate::step::StepSpec;
use std::collections::BTreeMap;

/// Property read from validation-result artifacts.
pub const PASSED_PROPERTY: &str = "passed";

/// Outcome of evaluating a step's gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// The step has no gate.
    Ungated,
    /// The gate artifact reported `passed = true`.
    Open,
    /// The gate artifact is missing, did not pass, or has no verdict.
    Closed,
}

impl GateDecision {
    /// Returns true if the step may run.
    #[must_use]
    pub fn allows_run(self) -> bool {
        !matches!(self, Self::Closed)
    }
}

/// Reads the verdict of a validation-result artifact.
///
/// # Errors
///
/// Returns an error if the artifact kind is not a validation result.
pub fn read_verdict(
    step: &StepSpec,
    gate_input: &str,
    artifact: &Artifact,
    registry: &TypeRegistry,
) -> Result<bool, GateTypeError> {
    if !registry.is_validation_result(artifact.kind) {
        return Err(GateTypeError {
            step: step.id.clone(),
            gate_input: gate_input.to_string(),
            actual: Some(artifact.kind),
        });
    }
    Ok(matches!(
        artifact.property(PASSED_PROPERTY),
        Some(serde_json::Value::Bool(true))
    ))
}

/// Evaluates the gate of `step` against its resolved inputs.
///
/// An absent gate artifact closes the gate rather than failing, which is
/// the case when the gate input is optional and its producer was skipped.
///
/// # Errors
///
/// Returns an error if the gate artifact is not a validation result.
pub fn evaluate(
    step: &StepSpec,
    inputs: &BTreeMap<String, Artifact>,
    registry: &TypeRegistry,
) -> Result<GateDecision, GateTypeError> {
    let Some(ref gate) = step.gate else {
        return Ok(GateDecision::Ungated);
    };

    let Some(artifact) = inputs.get(gate) else {
        return Ok(GateDecision::Closed);
    };

    let passed = read_verdict(step, gate, artifact, registry)?;
    Ok(if passed {
        GateDecision::Open
    } else {
        GateDecision::Closed
    })
}
