//! Step, run and artifact status enums.

use crate::core::StepId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The execution status of a step within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    /// Waiting for predecessors to reach a terminal state.
    #[default]
    Waiting,
    /// All predecessors are satisfied; eligible for dispatch.
    Ready,
    /// Handed to an execution backend.
    Running,
    /// Completed and produced its outputs.
    Succeeded,
    /// Failed after exhausting retries.
    Failed,
    /// Not executed (gate closed, upstream failure or cancellation).
    Skipped,
    /// Outputs reused from a prior run.
    Cached,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Waiting => write!(f, "WAITING"),
            Self::Ready => write!(f, "READY"),
            Self::Running => write!(f, "RUNNING"),
            Self::Succeeded => write!(f, "SUCCEEDED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Skipped => write!(f, "SKIPPED"),
            Self::Cached => write!(f, "CACHED"),
        }
    }
}

impl StepStatus {
    /// Returns true if the status represents a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Skipped | Self::Cached
        )
    }

    /// Returns true if the step produced (or reused) its outputs.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Cached)
    }

    /// Returns true if moving from `self` to `next` is a legal transition.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        match self {
            Self::Waiting => matches!(next, Self::Ready | Self::Skipped),
            Self::Ready => matches!(
                next,
                Self::Running | Self::Skipped | Self::Cached | Self::Failed
            ),
            Self::Running => matches!(next, Self::Succeeded | Self::Failed),
            Self::Succeeded | Self::Failed | Self::Skipped | Self::Cached => false,
        }
    }
}

/// Overall outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// Still making progress.
    #[default]
    Running,
    /// No required step failed.
    Succeeded,
    /// At least one non-optional step failed.
    Failed,
    /// A cancellation signal stopped the run.
    Cancelled,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "RUNNING"),
            Self::Succeeded => write!(f, "SUCCEEDED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// Lifecycle of an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArtifactState {
    /// The producing step has started.
    Pending,
    /// The producing step succeeded.
    Available,
    /// A downstream step consumed the artifact.
    Consumed,
    /// The producer failed or the artifact was invalidated externally.
    Invalid,
}

impl fmt::Display for ArtifactState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Available => write!(f, "AVAILABLE"),
            Self::Consumed => write!(f, "CONSUMED"),
            Self::Invalid => write!(f, "INVALID"),
        }
    }
}

impl ArtifactState {
    /// Returns true if `self -> next` follows `PENDING -> AVAILABLE -> {CONSUMED, INVALID}`.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        match self {
            Self::Pending => matches!(next, Self::Available | Self::Invalid),
            Self::Available => matches!(next, Self::Consumed | Self::Invalid),
            Self::Consumed => matches!(next, Self::Invalid),
            Self::Invalid => false,
        }
    }

    /// Returns true if the artifact content can still be read.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Available | Self::Consumed)
    }
}

/// Why a step was skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// The gate input reported `passed = false` (or no value).
    GateClosed {
        /// The gate input name.
        gate_input: String,
    },
    /// A predecessor failed and no alternate path satisfies this step.
    UpstreamFailed {
        /// The failed predecessor.
        step: StepId,
    },
    /// A predecessor was skipped and this step required its outputs.
    UpstreamSkipped {
        /// The skipped predecessor.
        step: StepId,
    },
    /// The run was cancelled before this step started.
    Cancelled,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GateClosed { gate_input } => write!(f, "gate '{gate_input}' did not pass"),
            Self::UpstreamFailed { step } => write!(f, "upstream step '{step}' failed"),
            Self::UpstreamSkipped { step } => write!(f, "upstream step '{step}' was skipped"),
            Self::Cancelled => write!(f, "run cancelled"),
        }
    }
}
