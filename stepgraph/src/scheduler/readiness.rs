//! Predecessor satisfaction rules.
//!
//! Once every predecessor of a step is terminal, each incoming edge is
//! checked against its predecessor's final status. A succeeded or cached
//! predecessor always satisfies the edge. A failed predecessor satisfies it
//! only when the edge carries data, all of it optional, and no explicit
//! ordering constraint. A skipped predecessor is judged the same way when
//! its skip traces back to a failure; any other skip (a closed gate, or a
//! chain of them) satisfies every edge whose data bindings are all
//! optional, which includes control-only edges.

use crate::core::{SkipReason, StepStatus};
use crate::graph::Edge;

/// Verdict for one incoming edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Satisfaction {
    /// The edge does not block the successor.
    Satisfied,
    /// The edge blocks the successor, which must be skipped.
    Blocked(SkipReason),
    /// The predecessor has not finished yet.
    Pending,
}

/// Final state of a predecessor as seen by its successors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Predecessor {
    pub status: StepStatus,
    /// The step failed, or was skipped because of a failure further up.
    pub after_failure: bool,
}

impl Predecessor {
    pub(crate) fn new(status: StepStatus, after_failure: bool) -> Self {
        Self { status, after_failure }
    }
}

/// Only optional data bindings can route around a failure.
fn survives_failure(edge: &Edge) -> bool {
    !edge.control && !edge.data.is_empty() && edge.all_data_optional()
}

/// Checks one incoming edge given its predecessor's final state.
pub(crate) fn edge_satisfaction(edge: &Edge, predecessor: Predecessor) -> Satisfaction {
    match predecessor.status {
        StepStatus::Succeeded | StepStatus::Cached => Satisfaction::Satisfied,
        StepStatus::Skipped => {
            let satisfied = if predecessor.after_failure {
                survives_failure(edge)
            } else {
                edge.all_data_optional()
            };
            if satisfied {
                Satisfaction::Satisfied
            } else {
                Satisfaction::Blocked(SkipReason::UpstreamSkipped {
                    step: edge.from.clone(),
                })
            }
        }
        StepStatus::Failed => {
            if survives_failure(edge) {
                Satisfaction::Satisfied
            } else {
                Satisfaction::Blocked(SkipReason::UpstreamFailed {
                    step: edge.from.clone(),
                })
            }
        }
        StepStatus::Waiting | StepStatus::Ready | StepStatus::Running => Satisfaction::Pending,
    }
}
