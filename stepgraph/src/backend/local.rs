//! In-process backend.

use super::{ExecutionBackend, Invocation};
use crate::errors::ExecutionError;
use crate::step::{ExecutorKind, StepResult};
use async_trait::async_trait;

/// Runs components on the scheduler's own runtime.
///
/// Cancellation is cooperative: the attempt is abandoned as soon as the
/// run's cancellation token fires, whether or not the component checks it.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalBackend;

impl LocalBackend {
    /// Creates a local backend.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ExecutionBackend for LocalBackend {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Local
    }

    fn identity(&self) -> String {
        "local".to_string()
    }

    async fn execute(&self, invocation: &Invocation) -> Result<StepResult, ExecutionError> {
        let ctx = &invocation.ctx;
        tokio::select! {
            result = invocation.component.run(ctx) => result,
            () = ctx.cancellation.cancelled() => Err(ExecutionError::cancelled(&ctx.step)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::{ExecutorPolicy, StepContext};
    use crate::testing::{EmitComponent, SlowComponent};
    use std::sync::Arc;
    use std::time::Duration;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_runs_component() {
        let invocation = Invocation {
            ctx: StepContext::new(Uuid::new_v4(), "emit"),
            component: Arc::new(EmitComponent::new().with_output("rows")),
            policy: ExecutorPolicy::local(),
        };

        let result = LocalBackend::new().execute(&invocation).await.unwrap();
        assert!(result.output("rows").is_some());
    }

    #[tokio::test]
    async fn test_cancellation_abandons_attempt() {
        let ctx = StepContext::new(Uuid::new_v4(), "slow");
        let token = Arc::clone(&ctx.cancellation);
        let invocation = Invocation {
            ctx,
            component: Arc::new(SlowComponent::new(Duration::from_secs(30))),
            policy: ExecutorPolicy::local(),
        };

        let handle = tokio::spawn(async move { LocalBackend::new().execute(&invocation).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel("test");

        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(ExecutionError::Cancelled { .. })));
    }
}
