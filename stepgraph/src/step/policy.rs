//! Executor selection policy.

use crate::core::StepId;
use crate::errors::BackendConfigError;
use crate::scheduler::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Where a step's component runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutorKind {
    /// In-process on the scheduler's runtime.
    #[default]
    Local,
    /// Submitted as a job to a managed remote service.
    ManagedRemote,
}

impl fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "LOCAL"),
            Self::ManagedRemote => write!(f, "MANAGED_REMOTE"),
        }
    }
}

/// Per-step executor policy, decided once when the step is declared.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExecutorPolicy {
    /// Selected executor.
    pub kind: ExecutorKind,
    /// Backend-specific arguments for the remote service.
    #[serde(default)]
    pub remote_args: BTreeMap<String, serde_json::Value>,
    /// Per-attempt timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Retry policy; falls back to the run default when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

impl ExecutorPolicy {
    /// Runs the step in-process.
    #[must_use]
    pub fn local() -> Self {
        Self::default()
    }

    /// Runs the step on the managed remote service with `args`.
    #[must_use]
    pub fn managed_remote(args: BTreeMap<String, serde_json::Value>) -> Self {
        Self {
            kind: ExecutorKind::ManagedRemote,
            remote_args: args,
            ..Self::default()
        }
    }

    /// Chooses managed-remote when `args` is non-empty, local otherwise.
    #[must_use]
    pub fn from_remote_args(args: Option<BTreeMap<String, serde_json::Value>>) -> Self {
        match args {
            Some(args) if !args.is_empty() => Self::managed_remote(args),
            _ => Self::local(),
        }
    }

    /// Sets the per-attempt timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Returns the per-attempt timeout.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Returns the part of the policy that affects what a step produces.
    ///
    /// Timeout and retry only change whether an attempt finishes, so they
    /// are left out of cache keys.
    #[must_use]
    pub fn identity(&self) -> serde_json::Value {
        serde_json::json!({
            "kind": self.kind,
            "remote_args": self.remote_args,
        })
    }

    /// Checks the policy on its own, without a backend selector.
    ///
    /// # Errors
    ///
    /// Returns an error for managed-remote policies without arguments and
    /// for zero timeouts.
    pub fn validate(&self, step: &StepId) -> Result<(), BackendConfigError> {
        if self.kind == ExecutorKind::ManagedRemote && self.remote_args.is_empty() {
            return Err(BackendConfigError::new(
                step.clone(),
                "MANAGED_REMOTE requested without remote arguments",
            ));
        }
        if self.timeout_ms == Some(0) {
            return Err(BackendConfigError::new(step.clone(), "timeout must be non-zero"));
        }
        Ok(())
    }
}
