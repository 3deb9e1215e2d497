//! Managed-remote backend.

use super::{ExecutionBackend, Invocation};
use crate::core::{Artifact, StepId};
use crate::errors::ExecutionError;
use crate::step::{ExecutorKind, StepResult};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Job description submitted to a remote service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteJob {
    /// The run the job belongs to.
    pub run_id: Uuid,
    /// The step being run.
    pub step: StepId,
    /// Component name.
    pub component: String,
    /// Attempt number, one-based.
    pub attempt: u32,
    /// Backend-specific arguments from the executor policy.
    pub args: BTreeMap<String, serde_json::Value>,
    /// Step parameters.
    pub params: BTreeMap<String, serde_json::Value>,
    /// Resolved input artifacts.
    pub inputs: BTreeMap<String, Artifact>,
    /// Assigned output locations.
    pub output_locations: BTreeMap<String, String>,
}

/// Client for a managed job service.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteJobClient: Send + Sync {
    /// Submits a job and returns its service-side identifier.
    async fn submit(&self, job: &RemoteJob) -> Result<String, ExecutionError>;

    /// Waits for a submitted job to finish.
    async fn wait(&self, job_id: &str) -> Result<StepResult, ExecutionError>;

    /// Asks the service to stop a job.
    async fn cancel(&self, job_id: &str);
}

/// Runs steps as jobs on a managed remote service.
pub struct ManagedRemoteBackend {
    client: Arc<dyn RemoteJobClient>,
    /// (run, step) -> job id of the attempt in flight.
    active: DashMap<(Uuid, StepId), String>,
}

impl ManagedRemoteBackend {
    /// Creates a backend over `client`.
    #[must_use]
    pub fn new(client: Arc<dyn RemoteJobClient>) -> Self {
        Self {
            client,
            active: DashMap::new(),
        }
    }

    /// Returns the number of jobs in flight.
    #[must_use]
    pub fn active_jobs(&self) -> usize {
        self.active.len()
    }
}

impl fmt::Debug for ManagedRemoteBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedRemoteBackend")
            .field("active_jobs", &self.active.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ExecutionBackend for ManagedRemoteBackend {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::ManagedRemote
    }

    fn identity(&self) -> String {
        "managed_remote".to_string()
    }

    async fn execute(&self, invocation: &Invocation) -> Result<StepResult, ExecutionError> {
        let ctx = &invocation.ctx;
        let job = RemoteJob {
            run_id: ctx.run_id,
            step: ctx.step.clone(),
            component: invocation.component.name().to_string(),
            attempt: ctx.attempt,
            args: invocation.policy.remote_args.clone(),
            params: ctx.params.clone(),
            inputs: ctx.inputs.clone(),
            output_locations: ctx.output_locations.clone(),
        };

        let job_id = self.client.submit(&job).await?;
        tracing::debug!(run_id = %ctx.run_id, step = %ctx.step, job_id = %job_id, "Remote job submitted");

        let key = (ctx.run_id, ctx.step.clone());
        self.active.insert(key.clone(), job_id.clone());

        let result = tokio::select! {
            biased;
            () = ctx.cancellation.cancelled() => {
                if let Some((_, job_id)) = self.active.remove(&key) {
                    self.client.cancel(&job_id).await;
                }
                Err(ExecutionError::cancelled(&ctx.step))
            }
            result = self.client.wait(&job_id) => result,
        };

        self.active.remove(&key);
        result
    }

    async fn cancel(&self, run_id: Uuid, step: &StepId) {
        // Removing first makes sure each job is cancelled at most once.
        if let Some((_, job_id)) = self.active.remove(&(run_id, step.clone())) {
            tracing::info!(run_id = %run_id, step = %step, job_id = %job_id, "Cancelling remote job");
            self.client.cancel(&job_id).await;
        }
    }
}
