//! Mock components and backends for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::backend::{ExecutionBackend, Invocation};
use crate::core::StepId;
use crate::errors::ExecutionError;
use crate::gate::PASSED_PROPERTY;
use crate::step::{Component, ExecutorKind, ProducedOutput, StepContext, StepResult};

/// Builds a result with one output per assigned location plus `extra`.
fn emit_outputs(
    ctx: &StepContext,
    extra: &BTreeSet<String>,
    properties: &BTreeMap<String, BTreeMap<String, serde_json::Value>>,
) -> StepResult {
    let names: BTreeSet<&String> = ctx.output_locations.keys().chain(extra.iter()).collect();
    let mut result = StepResult::new();
    for name in names {
        let mut output = ProducedOutput::new();
        if let Some(props) = properties.get(name) {
            for (key, value) in props {
                output = output.with_property(key.clone(), value.clone());
            }
        }
        result = result.with_output(name.clone(), output);
    }
    result
}

/// Succeeds immediately, producing every declared output.
#[derive(Debug, Default)]
pub struct EmitComponent {
    outputs: BTreeSet<String>,
    properties: BTreeMap<String, BTreeMap<String, serde_json::Value>>,
    call_count: Mutex<usize>,
    last_context: Mutex<Option<StepContext>>,
}

impl EmitComponent {
    /// Creates a component that emits whatever the step declares.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Also emits `name`, even when no location was assigned for it.
    #[must_use]
    pub fn with_output(mut self, name: impl Into<String>) -> Self {
        self.outputs.insert(name.into());
        self
    }

    /// Attaches a property to an output.
    #[must_use]
    pub fn with_property(
        mut self,
        output: impl Into<String>,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Self {
        self.properties
            .entry(output.into())
            .or_default()
            .insert(key.into(), value);
        self
    }

    /// Returns the number of times the component ran.
    #[must_use]
    pub fn call_count(&self) -> usize {
        *self.call_count.lock()
    }

    /// Returns the context of the most recent call.
    #[must_use]
    pub fn last_context(&self) -> Option<StepContext> {
        self.last_context.lock().clone()
    }
}

#[async_trait]
impl Component for EmitComponent {
    fn name(&self) -> &str {
        "emit"
    }

    async fn run(&self, ctx: &StepContext) -> Result<StepResult, ExecutionError> {
        *self.call_count.lock() += 1;
        *self.last_context.lock() = Some(ctx.clone());
        Ok(emit_outputs(ctx, &self.outputs, &self.properties))
    }
}

/// Always fails with a fixed message.
#[derive(Debug)]
pub struct FailingComponent {
    message: String,
    call_count: Mutex<usize>,
}

impl FailingComponent {
    /// Creates a failing component.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            call_count: Mutex::new(0),
        }
    }

    /// Returns the number of times the component ran.
    #[must_use]
    pub fn call_count(&self) -> usize {
        *self.call_count.lock()
    }
}

#[async_trait]
impl Component for FailingComponent {
    fn name(&self) -> &str {
        "failing"
    }

    async fn run(&self, ctx: &StepContext) -> Result<StepResult, ExecutionError> {
        *self.call_count.lock() += 1;
        Err(ctx.fail(self.message.clone()))
    }
}

/// Fails a fixed number of times, then succeeds.
#[derive(Debug)]
pub struct FlakyComponent {
    failures: usize,
    call_count: Mutex<usize>,
    attempts_seen: Mutex<Vec<u32>>,
}

impl FlakyComponent {
    /// Creates a component that fails `failures` times before succeeding.
    #[must_use]
    pub fn new(failures: usize) -> Self {
        Self {
            failures,
            call_count: Mutex::new(0),
            attempts_seen: Mutex::new(Vec::new()),
        }
    }

    /// Returns the number of times the component ran.
    #[must_use]
    pub fn call_count(&self) -> usize {
        *self.call_count.lock()
    }

    /// Returns the attempt number passed on each call.
    #[must_use]
    pub fn attempts_seen(&self) -> Vec<u32> {
        self.attempts_seen.lock().clone()
    }
}

#[async_trait]
impl Component for FlakyComponent {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn run(&self, ctx: &StepContext) -> Result<StepResult, ExecutionError> {
        let call = {
            let mut count = self.call_count.lock();
            *count += 1;
            *count
        };
        self.attempts_seen.lock().push(ctx.attempt);

        if call <= self.failures {
            return Err(ctx.fail(format!("transient failure {call}")));
        }
        Ok(emit_outputs(ctx, &BTreeSet::new(), &BTreeMap::new()))
    }
}

/// Tracks how many components run at once.
#[derive(Debug, Default)]
pub struct ConcurrencyGauge {
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ConcurrencyGauge {
    /// Creates a gauge at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn enter(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    /// Returns the highest number of simultaneous runs observed.
    #[must_use]
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Sleeps before emitting its declared outputs.
#[derive(Debug)]
pub struct SlowComponent {
    delay: Duration,
    gauge: Option<Arc<ConcurrencyGauge>>,
    call_count: Mutex<usize>,
}

impl SlowComponent {
    /// Creates a component that sleeps for `delay`.
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            gauge: None,
            call_count: Mutex::new(0),
        }
    }

    /// Reports into `gauge` while running.
    #[must_use]
    pub fn with_gauge(mut self, gauge: Arc<ConcurrencyGauge>) -> Self {
        self.gauge = Some(gauge);
        self
    }

    /// Returns the number of times the component ran.
    #[must_use]
    pub fn call_count(&self) -> usize {
        *self.call_count.lock()
    }
}

#[async_trait]
impl Component for SlowComponent {
    fn name(&self) -> &str {
        "slow"
    }

    async fn run(&self, ctx: &StepContext) -> Result<StepResult, ExecutionError> {
        *self.call_count.lock() += 1;
        if let Some(ref gauge) = self.gauge {
            gauge.enter();
        }
        tokio::time::sleep(self.delay).await;
        if let Some(ref gauge) = self.gauge {
            gauge.exit();
        }
        Ok(emit_outputs(ctx, &BTreeSet::new(), &BTreeMap::new()))
    }
}

/// Emits a validation result with a fixed verdict.
///
/// `None` omits the "passed" property altogether.
#[derive(Debug)]
pub struct ValidationComponent {
    output: String,
    verdict: Option<serde_json::Value>,
    call_count: Mutex<usize>,
}

impl ValidationComponent {
    /// Creates a validator writing `verdict` to `output`.
    #[must_use]
    pub fn new(output: impl Into<String>, verdict: Option<bool>) -> Self {
        Self {
            output: output.into(),
            verdict: verdict.map(serde_json::Value::Bool),
            call_count: Mutex::new(0),
        }
    }

    /// Creates a validator writing an arbitrary "passed" value.
    #[must_use]
    pub fn with_raw_verdict(output: impl Into<String>, verdict: serde_json::Value) -> Self {
        Self {
            output: output.into(),
            verdict: Some(verdict),
            call_count: Mutex::new(0),
        }
    }

    /// Returns the number of times the component ran.
    #[must_use]
    pub fn call_count(&self) -> usize {
        *self.call_count.lock()
    }
}

#[async_trait]
impl Component for ValidationComponent {
    fn name(&self) -> &str {
        "validation"
    }

    async fn run(&self, ctx: &StepContext) -> Result<StepResult, ExecutionError> {
        *self.call_count.lock() += 1;
        let mut properties = BTreeMap::new();
        if let Some(ref verdict) = self.verdict {
            properties.insert(
                self.output.clone(),
                BTreeMap::from([(PASSED_PROPERTY.to_string(), verdict.clone())]),
            );
        }
        let extra = BTreeSet::from([self.output.clone()]);
        Ok(emit_outputs(ctx, &extra, &properties))
    }
}

/// A backend that records every invocation and runs the component in place.
#[derive(Debug)]
pub struct RecordingBackend {
    kind: ExecutorKind,
    invocations: Mutex<Vec<StepContext>>,
    cancelled: Mutex<Vec<(Uuid, StepId)>>,
}

impl RecordingBackend {
    /// Creates a recording backend serving `kind`.
    #[must_use]
    pub fn new(kind: ExecutorKind) -> Self {
        Self {
            kind,
            invocations: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
        }
    }

    /// Returns the steps invoked, one entry per attempt.
    #[must_use]
    pub fn invoked_steps(&self) -> Vec<StepId> {
        self.invocations.lock().iter().map(|ctx| ctx.step.clone()).collect()
    }

    /// Returns the context of every attempt.
    #[must_use]
    pub fn invocations(&self) -> Vec<StepContext> {
        self.invocations.lock().clone()
    }

    /// Returns the steps a cancellation was requested for.
    #[must_use]
    pub fn cancelled_steps(&self) -> Vec<StepId> {
        self.cancelled.lock().iter().map(|(_, step)| step.clone()).collect()
    }
}

#[async_trait]
impl ExecutionBackend for RecordingBackend {
    fn kind(&self) -> ExecutorKind {
        self.kind
    }

    fn identity(&self) -> String {
        format!("recording-{}", self.kind)
    }

    async fn execute(&self, invocation: &Invocation) -> Result<StepResult, ExecutionError> {
        let ctx = &invocation.ctx;
        self.invocations.lock().push(ctx.clone());
        tokio::select! {
            result = invocation.component.run(ctx) => result,
            () = ctx.cancellation.cancelled() => Err(ExecutionError::cancelled(&ctx.step)),
        }
    }

    async fn cancel(&self, run_id: Uuid, step: &StepId) {
        self.cancelled.lock().push((run_id, step.clone()));
    }
}
