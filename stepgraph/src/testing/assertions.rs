//! Assertions over run results.

use crate::core::{RunStatus, SkipReason, StepStatus};
use crate::scheduler::RunResult;

/// Asserts the overall run status.
pub fn assert_run_status(result: &RunResult, expected: RunStatus) {
    assert_eq!(
        result.status, expected,
        "Expected run status {expected}, got {}. Steps: {:?}",
        result.status, result.step_status
    );
}

/// Asserts the final status of one step.
pub fn assert_step_status(result: &RunResult, step: &str, expected: StepStatus) {
    let actual = result.status_of(step);
    assert_eq!(
        actual,
        Some(expected),
        "Expected step '{step}' to be {expected}, got {actual:?} (error: {:?})",
        result.error_of(step)
    );
}

/// Asserts that a step was skipped for the given reason.
pub fn assert_skipped_with(result: &RunResult, step: &str, reason: &SkipReason) {
    assert_step_status(result, step, StepStatus::Skipped);
    assert_eq!(
        result.skip_reason_of(step),
        Some(reason),
        "Unexpected skip reason for step '{step}'"
    );
}

/// Asserts that every listed step succeeded.
pub fn assert_all_succeeded(result: &RunResult, steps: &[&str]) {
    for step in steps {
        assert_step_status(result, step, StepStatus::Succeeded);
    }
}
