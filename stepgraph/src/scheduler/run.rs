//! Run records and results.

use crate::cache::CacheKey;
use crate::core::{Artifact, ArtifactId, RunStatus, SkipReason, StepId, StepStatus};
use crate::graph::Graph;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// Per-step state inside a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepRunState {
    /// The step.
    pub step: StepId,
    /// Current status.
    pub status: StepStatus,
    /// Cache key computed when the step became ready.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_key: Option<CacheKey>,
    /// Number of attempts started.
    pub attempts: u32,
    /// Why the step was skipped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    /// Last error message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Identity of the backend that ran the step.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    /// Run whose outputs were reused, for cached steps.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reused_from: Option<Uuid>,
    /// Output name -> artifact id.
    pub outputs: BTreeMap<String, ArtifactId>,
    /// When the first attempt started.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the step reached a terminal status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepRunState {
    pub(crate) fn waiting(step: StepId) -> Self {
        Self {
            step,
            status: StepStatus::Waiting,
            cache_key: None,
            attempts: 0,
            skip_reason: None,
            error: None,
            backend: None,
            reused_from: None,
            outputs: BTreeMap::new(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Wall-clock duration between start and finish.
    #[must_use]
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

/// The complete record of one execution of a graph.
///
/// Built by the scheduler while the run progresses and frozen once it
/// finishes; history entries are shared as `Arc<RunRecord>`.
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    /// Unique run identifier.
    pub run_id: Uuid,
    /// Name of the executed graph.
    pub graph_name: String,
    /// The executed graph.
    #[serde(skip)]
    pub graph: Arc<Graph>,
    /// Whether caching was enabled.
    pub cache_enabled: bool,
    /// Concurrency limit in effect.
    pub concurrency_limit: usize,
    /// Per-step state in declaration order.
    pub steps: Vec<StepRunState>,
    /// Overall status.
    pub status: RunStatus,
    /// Reason given when the run was cancelled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run finished.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunRecord {
    pub(crate) fn new(run_id: Uuid, graph: Arc<Graph>, cache_enabled: bool, concurrency_limit: usize) -> Self {
        let steps = graph
            .steps()
            .iter()
            .map(|spec| StepRunState::waiting(spec.id.clone()))
            .collect();
        Self {
            run_id,
            graph_name: graph.name().to_string(),
            graph,
            cache_enabled,
            concurrency_limit,
            steps,
            status: RunStatus::Running,
            cancel_reason: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Returns the state of a step.
    #[must_use]
    pub fn step(&self, id: &str) -> Option<&StepRunState> {
        self.steps.iter().find(|s| s.step.as_str() == id)
    }

    /// Returns the status of a step.
    #[must_use]
    pub fn status_of(&self, id: &str) -> Option<StepStatus> {
        self.step(id).map(|s| s.status)
    }

    /// Returns the steps with the given status, in declaration order.
    #[must_use]
    pub fn steps_with_status(&self, status: StepStatus) -> Vec<&StepId> {
        self.steps
            .iter()
            .filter(|s| s.status == status)
            .map(|s| &s.step)
            .collect()
    }

    /// Serializes the record to JSON.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// What [`crate::scheduler::Orchestrator::run`] returns.
#[derive(Debug, Clone)]
pub struct RunResult {
    /// Unique run identifier.
    pub run_id: Uuid,
    /// Overall status.
    pub status: RunStatus,
    /// Final status of every step.
    pub step_status: BTreeMap<StepId, StepStatus>,
    /// Artifacts produced or reused by succeeded and cached steps.
    pub artifacts: BTreeMap<StepId, BTreeMap<String, Artifact>>,
    /// Total wall-clock duration.
    pub duration_ms: f64,
    /// The frozen run record.
    pub record: Arc<RunRecord>,
}

impl RunResult {
    /// Returns true if the run succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    /// Returns the final status of a step.
    #[must_use]
    pub fn status_of(&self, step: &str) -> Option<StepStatus> {
        self.step_status.get(&StepId::from(step)).copied()
    }

    /// Returns an artifact produced by a step.
    #[must_use]
    pub fn artifact(&self, step: &str, output: &str) -> Option<&Artifact> {
        self.artifacts.get(&StepId::from(step))?.get(output)
    }

    /// Returns the recorded error of a failed step.
    #[must_use]
    pub fn error_of(&self, step: &str) -> Option<&str> {
        self.record.step(step)?.error.as_deref()
    }

    /// Returns the recorded skip reason of a skipped step.
    #[must_use]
    pub fn skip_reason_of(&self, step: &str) -> Option<&SkipReason> {
        self.record.step(step)?.skip_reason.as_ref()
    }
}
