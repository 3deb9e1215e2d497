//! Execution backends and per-step backend selection.
//!
//! The scheduler never runs a component directly. It builds an
//! [`Invocation`] and hands it to the backend chosen by the step's executor
//! policy: the in-process [`LocalBackend`], or a [`ManagedRemoteBackend`]
//! that submits a job through a [`RemoteJobClient`].

mod local;
mod remote;

pub use local::LocalBackend;
pub use remote::{ManagedRemoteBackend, RemoteJob, RemoteJobClient};

use crate::core::StepId;
use crate::errors::{BackendConfigError, ExecutionError};
use crate::graph::Graph;
use crate::step::{Component, ExecutorKind, ExecutorPolicy, StepContext, StepResult, StepSpec};
use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;
use uuid::Uuid;

/// One attempt of one step, as handed to a backend.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Context passed to the component.
    pub ctx: StepContext,
    /// The component to run.
    pub component: Arc<dyn Component>,
    /// The step's executor policy.
    pub policy: ExecutorPolicy,
}

/// A strategy for running step attempts.
#[async_trait]
pub trait ExecutionBackend: Send + Sync + Debug {
    /// The executor kind this backend serves.
    fn kind(&self) -> ExecutorKind;

    /// Name recorded in run records.
    fn identity(&self) -> String;

    /// Runs one attempt to completion.
    ///
    /// # Errors
    ///
    /// Returns an error when the attempt fails or is cancelled.
    async fn execute(&self, invocation: &Invocation) -> Result<StepResult, ExecutionError>;

    /// Requests cooperative cancellation of a running attempt.
    async fn cancel(&self, _run_id: Uuid, _step: &StepId) {}
}

/// Chooses the backend for each step from its executor policy.
#[derive(Debug, Clone)]
pub struct BackendSelector {
    local: Arc<dyn ExecutionBackend>,
    remote: Option<Arc<dyn ExecutionBackend>>,
}

impl Default for BackendSelector {
    fn default() -> Self {
        Self {
            local: Arc::new(LocalBackend::new()),
            remote: None,
        }
    }
}

impl BackendSelector {
    /// Creates a selector with only the local backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the local backend.
    #[must_use]
    pub fn with_local(mut self, backend: Arc<dyn ExecutionBackend>) -> Self {
        self.local = backend;
        self
    }

    /// Registers the managed-remote backend.
    #[must_use]
    pub fn with_remote(mut self, backend: Arc<dyn ExecutionBackend>) -> Self {
        self.remote = Some(backend);
        self
    }

    /// Returns true if a managed-remote backend is registered.
    #[must_use]
    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    /// Returns the backend for `step`.
    ///
    /// # Errors
    ///
    /// Returns an error if the policy is invalid or requires a backend that
    /// is not registered.
    pub fn select(&self, step: &StepSpec) -> Result<Arc<dyn ExecutionBackend>, BackendConfigError> {
        step.executor.validate(&step.id)?;
        match step.executor.kind {
            ExecutorKind::Local => Ok(Arc::clone(&self.local)),
            ExecutorKind::ManagedRemote => self.remote.clone().ok_or_else(|| {
                BackendConfigError::new(step.id.clone(), "no managed-remote backend is configured")
            }),
        }
    }

    /// Checks that every step of `graph` can be served.
    ///
    /// # Errors
    ///
    /// Returns the first step whose policy cannot be satisfied.
    pub fn validate_graph(&self, graph: &Graph) -> Result<(), BackendConfigError> {
        for step in graph.steps() {
            self.select(step)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{EmitComponent, RecordingBackend};
    use std::collections::BTreeMap;

    fn remote_step() -> StepSpec {
        let mut args = BTreeMap::new();
        args.insert("region".to_string(), serde_json::json!("us-central1"));
        StepSpec::new("indexer", Arc::new(EmitComponent::new()))
            .executor(ExecutorPolicy::managed_remote(args))
    }

    #[test]
    fn test_local_selected_by_default() {
        let selector = BackendSelector::new();
        let step = StepSpec::new("a", Arc::new(EmitComponent::new()));
        let backend = selector.select(&step).unwrap();
        assert_eq!(backend.kind(), ExecutorKind::Local);
        assert!(!selector.has_remote());
    }

    #[test]
    fn test_remote_requires_registration() {
        let err = BackendSelector::new().select(&remote_step()).unwrap_err();
        assert!(err.reason.contains("no managed-remote backend"));

        let selector = BackendSelector::new()
            .with_remote(Arc::new(RecordingBackend::new(ExecutorKind::ManagedRemote)));
        assert_eq!(
            selector.select(&remote_step()).unwrap().kind(),
            ExecutorKind::ManagedRemote
        );
    }

    #[test]
    fn test_no_implicit_fallback() {
        let selector = BackendSelector::new()
            .with_remote(Arc::new(RecordingBackend::new(ExecutorKind::ManagedRemote)));
        let step = StepSpec::new("bare", Arc::new(EmitComponent::new()))
            .executor(ExecutorPolicy::managed_remote(BTreeMap::new()));
        assert!(selector.select(&step).is_err());
    }
}
