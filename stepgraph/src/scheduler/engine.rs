//! The run loop.
//!
//! One [`RunEngine`] drives one run of a graph. All run state lives here and
//! is only mutated by the loop itself; backend attempts run on spawned tasks
//! and report back through a `FuturesUnordered` of completions, so the
//! record never needs a lock.

use super::cancellation::CancellationToken;
use super::readiness::{edge_satisfaction, Predecessor, Satisfaction};
use super::retry::RetryPolicy;
use super::run::{RunRecord, RunResult};
use crate::backend::{BackendSelector, ExecutionBackend, Invocation};
use crate::cache::{compute_cache_key, CacheEntry, CacheIndex, CacheKey};
use crate::config::{EngineConfig, RunOptions};
use crate::core::{Artifact, ArtifactId, ArtifactKind, ArtifactState, RunStatus, SkipReason, StepStatus};
use crate::errors::ExecutionError;
use crate::events::{self, EventSink};
use crate::gate::{self, GateDecision};
use crate::graph::{Graph, ResolvedSource};
use crate::step::{StepContext, StepResult};
use crate::store::ArtifactStore;
use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinError;
use uuid::Uuid;

/// Outcome of every attempt of one step.
struct AttemptOutcome {
    result: Result<StepResult, ExecutionError>,
    attempts: u32,
}

type Completion = (usize, Result<AttemptOutcome, JoinError>);

enum Wake {
    Completed(Completion),
    Cancelled,
    Drained,
}

/// Services shared by every run of an orchestrator.
pub(crate) struct RunServices<'a> {
    pub config: &'a EngineConfig,
    pub selector: &'a BackendSelector,
    pub store: Arc<dyn ArtifactStore>,
    pub cache: Arc<dyn CacheIndex>,
    pub events: Arc<dyn EventSink>,
}

pub(crate) struct RunEngine<'a> {
    services: RunServices<'a>,
    graph: Arc<Graph>,
    options: RunOptions,
    token: Arc<CancellationToken>,
    record: RunRecord,
    /// Predecessors not yet terminal, per step.
    remaining: Vec<usize>,
    /// Ready steps by declaration index.
    ready: BTreeSet<usize>,
    /// Pending output artifacts of running steps.
    pending: Vec<BTreeMap<String, ArtifactId>>,
    /// Input artifacts handed to each started step.
    consumed: Vec<Vec<ArtifactId>>,
    imports: HashMap<(String, ArtifactKind), ArtifactId>,
    running: BTreeMap<usize, Arc<dyn ExecutionBackend>>,
    /// Steps that failed, or were skipped because of a failure upstream.
    after_failure: Vec<bool>,
    in_flight: FuturesUnordered<BoxFuture<'static, Completion>>,
    cancel_handled: bool,
}

impl<'a> RunEngine<'a> {
    pub(crate) fn new(
        services: RunServices<'a>,
        graph: Arc<Graph>,
        options: RunOptions,
        token: Arc<CancellationToken>,
    ) -> Self {
        let count = graph.step_count();
        let remaining = (0..count).map(|idx| graph.incoming_at(idx).len()).collect();
        let record = RunRecord::new(
            Uuid::now_v7(),
            Arc::clone(&graph),
            options.cache_enabled,
            options.concurrency_limit,
        );
        Self {
            services,
            graph,
            options,
            token,
            record,
            remaining,
            ready: BTreeSet::new(),
            pending: vec![BTreeMap::new(); count],
            consumed: vec![Vec::new(); count],
            imports: HashMap::new(),
            running: BTreeMap::new(),
            after_failure: vec![false; count],
            in_flight: FuturesUnordered::new(),
            cancel_handled: false,
        }
    }

    pub(crate) fn run_id(&self) -> Uuid {
        self.record.run_id
    }

    /// Drives the run until every step is terminal.
    pub(crate) async fn execute(mut self) -> RunResult {
        let start = Instant::now();
        let run_id = self.run_id();
        self.emit(
            events::RUN_STARTED,
            json!({
                "run_id": run_id,
                "graph": self.graph.name(),
                "steps": self.graph.step_count(),
                "cache_enabled": self.options.cache_enabled,
                "concurrency_limit": self.options.concurrency_limit,
            }),
        )
        .await;
        tracing::info!(
            steps = self.graph.step_count(),
            cache_enabled = self.options.cache_enabled,
            "Run started"
        );

        self.register_imports().await;

        for idx in 0..self.graph.step_count() {
            if self.remaining[idx] == 0 {
                self.mark_ready(idx).await;
            }
        }

        loop {
            if self.token.is_cancelled() && !self.cancel_handled {
                self.handle_cancellation().await;
            }

            while !self.cancel_handled && self.in_flight.len() < self.options.concurrency_limit {
                let Some(idx) = self.ready.pop_first() else {
                    break;
                };
                self.dispatch(idx).await;
            }

            if self.in_flight.is_empty() {
                break;
            }

            let token = Arc::clone(&self.token);
            let wake = tokio::select! {
                biased;
                () = token.cancelled(), if !self.cancel_handled => Wake::Cancelled,
                done = self.in_flight.next() => done.map_or(Wake::Drained, Wake::Completed),
            };

            match wake {
                Wake::Completed((idx, joined)) => self.complete(idx, joined).await,
                Wake::Cancelled => self.handle_cancellation().await,
                Wake::Drained => break,
            }
        }

        self.finish(start).await
    }

    async fn register_imports(&mut self) {
        let graph = Arc::clone(&self.graph);
        for spec in graph.steps() {
            for input in graph.resolved_inputs(&spec.id) {
                let ResolvedSource::Import { ref location } = input.source else {
                    continue;
                };
                let key = (location.clone(), input.kind);
                if self.imports.contains_key(&key) {
                    continue;
                }
                let id = self
                    .services
                    .store
                    .register(Artifact::imported(input.kind, location.clone()))
                    .await;
                tracing::debug!(location = %location, kind = %input.kind, artifact = %id, "Registered import");
                self.imports.insert(key, id);
            }
        }
    }

    /// Applies a status change, refusing transitions the lifecycle forbids.
    fn transition(&mut self, idx: usize, next: StepStatus) -> bool {
        let state = &mut self.record.steps[idx];
        if !state.status.can_transition_to(next) {
            tracing::warn!(
                step = %state.step,
                from = %state.status,
                to = %next,
                "Ignoring illegal step transition"
            );
            return false;
        }
        state.status = next;
        if next.is_terminal() {
            state.finished_at = Some(Utc::now());
        }
        true
    }

    async fn mark_ready(&mut self, idx: usize) {
        if !self.transition(idx, StepStatus::Ready) {
            return;
        }
        self.ready.insert(idx);
        let step = self.graph.step_at(idx).id.clone();
        self.emit(events::STEP_READY, json!({ "run_id": self.run_id(), "step": step }))
            .await;
    }

    async fn skip(&mut self, idx: usize, reason: SkipReason) {
        if !self.transition(idx, StepStatus::Skipped) {
            return;
        }
        let step = self.graph.step_at(idx).id.clone();
        tracing::info!(step = %step, reason = %reason, "Step skipped");
        self.record.steps[idx].skip_reason = Some(reason.clone());
        self.emit(
            events::STEP_SKIPPED,
            json!({
                "run_id": self.run_id(),
                "step": step,
                "reason": reason,
            }),
        )
        .await;
    }

    async fn fail(&mut self, idx: usize, error: ExecutionError) {
        let pending = std::mem::take(&mut self.pending[idx]);
        for id in pending.values() {
            if let Err(e) = self.services.store.transition(id, ArtifactState::Invalid).await {
                tracing::debug!(artifact = %id, error = %e, "Could not invalidate pending artifact");
            }
        }

        if !self.transition(idx, StepStatus::Failed) {
            return;
        }
        self.after_failure[idx] = true;
        let spec = self.graph.step_at(idx);
        let step = spec.id.clone();
        let optional = spec.optional;
        let message = error.to_string();
        tracing::error!(step = %step, optional, error = %message, "Step failed");

        let state = &mut self.record.steps[idx];
        state.error = Some(message.clone());
        let attempts = state.attempts;
        self.emit(
            events::STEP_FAILED,
            json!({
                "run_id": self.run_id(),
                "step": step,
                "error": message,
                "attempts": attempts,
                "optional": optional,
            }),
        )
        .await;
    }

    /// Propagates a terminal step to its successors.
    async fn settle(&mut self, idx: usize) {
        let graph = Arc::clone(&self.graph);
        let mut queue = vec![idx];

        while let Some(done) = queue.pop() {
            for &edge in graph.outgoing_at(done) {
                let (_, _, to) = graph.edge_at(edge);
                if self.record.steps[to].status != StepStatus::Waiting {
                    continue;
                }
                self.remaining[to] = self.remaining[to].saturating_sub(1);
                if self.remaining[to] > 0 {
                    continue;
                }
                match self.blocking_reason(to) {
                    Some((reason, after_failure)) => {
                        self.skip(to, reason).await;
                        self.after_failure[to] = after_failure;
                        queue.push(to);
                    }
                    None => self.mark_ready(to).await,
                }
            }
        }
    }

    /// Returns why `idx` cannot run, preferring blockers that trace back to
    /// a failure, and whether the skip inherits that failure.
    fn blocking_reason(&self, idx: usize) -> Option<(SkipReason, bool)> {
        let mut first = None;
        for &edge in self.graph.incoming_at(idx) {
            let (edge, from, _) = self.graph.edge_at(edge);
            let predecessor = Predecessor::new(self.record.steps[from].status, self.after_failure[from]);
            if let Satisfaction::Blocked(reason) = edge_satisfaction(edge, predecessor) {
                if predecessor.after_failure {
                    return Some((reason, true));
                }
                first.get_or_insert(reason);
            }
        }
        first.map(|reason| (reason, false))
    }

    /// Gathers the artifacts bound to `idx`'s inputs.
    ///
    /// Optional inputs whose producer did not run are left out. A required
    /// input without a valid artifact fails the step before dispatch.
    async fn collect_inputs(&self, idx: usize) -> Result<BTreeMap<String, Artifact>, ExecutionError> {
        let spec = self.graph.step_at(idx);
        let mut inputs = BTreeMap::new();

        for input in self.graph.resolved_inputs(&spec.id) {
            let id = match input.source {
                ResolvedSource::Upstream {
                    ref step,
                    ref output,
                    ..
                } => self
                    .graph
                    .index_of(step)
                    .and_then(|from| self.record.steps[from].outputs.get(output).copied()),
                ResolvedSource::Import { ref location } => {
                    self.imports.get(&(location.clone(), input.kind)).copied()
                }
            };
            let unavailable = |detail: String| ExecutionError::InputUnavailable {
                step: spec.id.clone(),
                input: input.name.clone(),
                detail,
            };
            let Some(id) = id else {
                if input.optional {
                    continue;
                }
                return Err(unavailable("no artifact was produced".to_string()));
            };
            match self.services.store.get(&id).await {
                Some(artifact) if artifact.is_valid() => {
                    inputs.insert(input.name.clone(), artifact);
                }
                found => {
                    let detail = found.map_or_else(
                        || format!("artifact {id} is not in the store"),
                        |artifact| format!("artifact {id} is {}", artifact.state),
                    );
                    if input.optional {
                        tracing::warn!(step = %spec.id, input = %input.name, artifact = %id, detail = %detail, "Dropping unavailable optional input");
                        continue;
                    }
                    return Err(unavailable(detail));
                }
            }
        }

        Ok(inputs)
    }

    async fn dispatch(&mut self, idx: usize) {
        let graph = Arc::clone(&self.graph);
        let spec = graph.step_at(idx);
        let inputs = match self.collect_inputs(idx).await {
            Ok(inputs) => inputs,
            Err(e) => {
                self.fail(idx, e).await;
                self.settle(idx).await;
                return;
            }
        };

        match gate::evaluate(spec, &inputs, graph.registry()) {
            Ok(GateDecision::Closed) => {
                let gate_input = spec.gate.clone().unwrap_or_default();
                self.skip(idx, SkipReason::GateClosed { gate_input }).await;
                self.settle(idx).await;
                return;
            }
            Ok(GateDecision::Open | GateDecision::Ungated) => {}
            Err(e) => {
                self.fail(idx, e.into()).await;
                self.settle(idx).await;
                return;
            }
        }

        let ordered: Vec<(&str, Option<&Artifact>)> = graph
            .resolved_inputs(&spec.id)
            .iter()
            .map(|input| (input.name.as_str(), inputs.get(&input.name)))
            .collect();
        let key = compute_cache_key(spec, &ordered);
        self.record.steps[idx].cache_key = Some(key.clone());

        if self.options.cache_enabled && self.reuse_cached(idx, &key).await {
            self.settle(idx).await;
            return;
        }

        let backend = match self.services.selector.select(spec) {
            Ok(backend) => backend,
            Err(e) => {
                self.fail(idx, ExecutionError::step_failed(&spec.id, e.to_string()))
                    .await;
                self.settle(idx).await;
                return;
            }
        };

        self.launch(idx, inputs, backend).await;
    }

    /// Reuses a recorded execution. Returns false on a miss.
    async fn reuse_cached(&mut self, idx: usize, key: &CacheKey) -> bool {
        let spec = self.graph.step_at(idx);
        let Some(hit) = self.services.cache.lookup(key, self.services.store.as_ref()).await else {
            tracing::debug!(step = %spec.id, cache_key = %key, "Cache miss");
            return false;
        };

        let mut outputs = BTreeMap::new();
        for decl in &spec.outputs {
            let Some(artifact) = hit.artifacts.get(&decl.name) else {
                tracing::debug!(step = %spec.id, output = %decl.name, "Cache entry lacks a declared output");
                return false;
            };
            outputs.insert(decl.name.clone(), artifact.id);
        }

        let step = spec.id.clone();
        if !self.transition(idx, StepStatus::Cached) {
            return false;
        }
        let state = &mut self.record.steps[idx];
        state.outputs = outputs;
        state.reused_from = Some(hit.entry.run_id);

        tracing::info!(step = %step, cache_key = %key, reused_from = %hit.entry.run_id, "Step cached");
        self.emit(
            events::STEP_CACHED,
            json!({
                "run_id": self.run_id(),
                "step": step,
                "cache_key": key,
                "reused_from": hit.entry.run_id,
            }),
        )
        .await;
        true
    }

    async fn launch(
        &mut self,
        idx: usize,
        inputs: BTreeMap<String, Artifact>,
        backend: Arc<dyn ExecutionBackend>,
    ) {
        let graph = Arc::clone(&self.graph);
        let spec = graph.step_at(idx);
        let run_id = self.run_id();

        let mut output_locations = BTreeMap::new();
        let mut pending = BTreeMap::new();
        for decl in &spec.outputs {
            let location = self.services.config.output_location(&spec.id, &decl.name, run_id);
            let artifact = Artifact::pending(
                decl.kind,
                location.clone(),
                spec.id.clone(),
                decl.name.clone(),
                run_id,
            );
            let id = self.services.store.register(artifact).await;
            output_locations.insert(decl.name.clone(), location);
            pending.insert(decl.name.clone(), id);
        }
        self.pending[idx] = pending;
        self.consumed[idx] = inputs.values().map(|a| a.id).collect();

        if !self.transition(idx, StepStatus::Running) {
            return;
        }
        let state = &mut self.record.steps[idx];
        state.started_at = Some(Utc::now());
        state.backend = Some(backend.identity());

        let invocation = Invocation {
            ctx: StepContext {
                run_id,
                pipeline_name: self.services.config.pipeline_name.clone(),
                pipeline_root: self.services.config.pipeline_root.clone(),
                step: spec.id.clone(),
                inputs,
                params: spec.params.clone(),
                output_locations,
                attempt: 1,
                cancellation: Arc::clone(&self.token),
            },
            component: Arc::clone(&spec.component),
            policy: spec.executor.clone(),
        };
        let retry = spec.executor.retry.unwrap_or(self.options.default_retry);
        let timeout = spec.executor.timeout();

        tracing::info!(step = %spec.id, backend = %backend.identity(), component = spec.component.name(), "Step started");
        self.emit(
            events::STEP_STARTED,
            json!({
                "run_id": run_id,
                "step": spec.id,
                "backend": backend.identity(),
                "component": spec.component.name(),
            }),
        )
        .await;

        self.running.insert(idx, Arc::clone(&backend));
        let sink = Arc::clone(&self.services.events);
        let handle = tokio::spawn(run_attempts(backend, invocation, retry, timeout, sink));
        self.in_flight.push(async move { (idx, handle.await) }.boxed());
    }

    async fn complete(&mut self, idx: usize, joined: Result<AttemptOutcome, JoinError>) {
        self.running.remove(&idx);
        let step = self.graph.step_at(idx).id.clone();

        let (result, attempts) = match joined {
            Ok(outcome) => (outcome.result, outcome.attempts),
            Err(e) => (
                Err(ExecutionError::step_failed(&step, format!("attempt task aborted: {e}"))),
                1,
            ),
        };
        self.record.steps[idx].attempts = attempts;

        let published = match result {
            Ok(step_result) => self.publish(idx, step_result).await,
            Err(e) => Err(e),
        };

        match published {
            Ok(()) => self.succeed(idx).await,
            Err(e) => self.fail(idx, e).await,
        }
        self.settle(idx).await;
    }

    /// Moves the pending outputs to AVAILABLE and records what was consumed.
    async fn publish(&mut self, idx: usize, mut result: StepResult) -> Result<(), ExecutionError> {
        let spec = self.graph.step_at(idx);
        if let Some(missing) = spec
            .outputs
            .iter()
            .find(|decl| !result.outputs.contains_key(&decl.name))
        {
            return Err(ExecutionError::MissingOutput {
                step: spec.id.clone(),
                output: missing.name.clone(),
            });
        }

        let pending = std::mem::take(&mut self.pending[idx]);
        let mut outputs = BTreeMap::new();
        for (name, id) in &pending {
            let produced = result.outputs.remove(name).unwrap_or_default();
            let published = self
                .services
                .store
                .mark_available(id, produced.properties, produced.fingerprint)
                .await;
            if let Err(e) = published {
                // Leave the rest for `fail` to invalidate.
                self.pending[idx] = pending;
                return Err(e.into());
            }
            outputs.insert(name.clone(), *id);
        }

        for id in std::mem::take(&mut self.consumed[idx]) {
            if let Err(e) = self.services.store.transition(&id, ArtifactState::Consumed).await {
                tracing::debug!(artifact = %id, error = %e, "Could not mark input consumed");
            }
        }

        if self.options.cache_enabled {
            if let Some(key) = self.record.steps[idx].cache_key.clone() {
                let entry = CacheEntry::new(key, self.run_id(), spec.id.clone(), outputs.clone());
                self.services.cache.insert(entry).await;
            }
        }

        self.record.steps[idx].outputs = outputs;
        Ok(())
    }

    async fn succeed(&mut self, idx: usize) {
        if !self.transition(idx, StepStatus::Succeeded) {
            return;
        }
        let state = &self.record.steps[idx];
        let step = state.step.clone();
        let attempts = state.attempts;
        let duration_ms = state.duration_ms();
        let outputs: Vec<String> = state.outputs.keys().cloned().collect();
        tracing::info!(step = %step, attempts, "Step succeeded");
        self.emit(
            events::STEP_SUCCEEDED,
            json!({
                "run_id": self.run_id(),
                "step": step,
                "attempts": attempts,
                "duration_ms": duration_ms,
                "outputs": outputs,
            }),
        )
        .await;
    }

    async fn handle_cancellation(&mut self) {
        self.cancel_handled = true;
        let reason = self.token.reason();
        tracing::warn!(reason = reason.as_deref().unwrap_or(""), "Run cancelled");
        self.record.cancel_reason = reason;

        self.ready.clear();
        for idx in 0..self.graph.step_count() {
            if matches!(
                self.record.steps[idx].status,
                StepStatus::Waiting | StepStatus::Ready
            ) {
                self.skip(idx, SkipReason::Cancelled).await;
            }
        }

        let running: Vec<(usize, Arc<dyn ExecutionBackend>)> = self
            .running
            .iter()
            .map(|(&idx, backend)| (idx, Arc::clone(backend)))
            .collect();
        for (idx, backend) in running {
            let step = &self.graph.step_at(idx).id;
            backend.cancel(self.record.run_id, step).await;
        }
    }

    async fn finish(mut self, start: Instant) -> RunResult {
        let status = if self.cancel_handled {
            RunStatus::Cancelled
        } else if self
            .record
            .steps
            .iter()
            .zip(self.graph.steps())
            .any(|(state, spec)| state.status == StepStatus::Failed && !spec.optional)
        {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        };
        self.record.status = status;
        self.record.finished_at = Some(Utc::now());

        let mut step_status = BTreeMap::new();
        let mut artifacts = BTreeMap::new();
        for state in &self.record.steps {
            step_status.insert(state.step.clone(), state.status);
            if !state.status.is_success() {
                continue;
            }
            let mut produced = BTreeMap::new();
            for (name, id) in &state.outputs {
                if let Some(artifact) = self.services.store.get(id).await {
                    produced.insert(name.clone(), artifact);
                }
            }
            artifacts.insert(state.step.clone(), produced);
        }

        let duration_ms = start.elapsed().as_secs_f64() * 1000.0;
        tracing::info!(status = %status, duration_ms, "Run completed");
        self.emit(
            events::RUN_COMPLETED,
            json!({
                "run_id": self.run_id(),
                "graph": self.graph.name(),
                "status": status,
                "duration_ms": duration_ms,
            }),
        )
        .await;

        RunResult {
            run_id: self.record.run_id,
            status,
            step_status,
            artifacts,
            duration_ms,
            record: Arc::new(self.record),
        }
    }

    async fn emit(&self, event_type: &str, data: serde_json::Value) {
        self.services.events.emit(event_type, Some(data)).await;
    }
}

/// Runs attempts until one succeeds, retries are exhausted or the run is cancelled.
async fn run_attempts(
    backend: Arc<dyn ExecutionBackend>,
    mut invocation: Invocation,
    retry: RetryPolicy,
    timeout: Option<Duration>,
    sink: Arc<dyn EventSink>,
) -> AttemptOutcome {
    let mut attempt = 1;
    loop {
        invocation.ctx.attempt = attempt;
        let result = match timeout {
            Some(limit) => {
                if let Ok(result) = tokio::time::timeout(limit, backend.execute(&invocation)).await {
                    result
                } else {
                    backend.cancel(invocation.ctx.run_id, &invocation.ctx.step).await;
                    Err(ExecutionError::timeout(&invocation.ctx.step, limit))
                }
            }
            None => backend.execute(&invocation).await,
        };

        match result {
            Err(error)
                if error.is_retryable()
                    && retry.allows_another(attempt)
                    && !invocation.ctx.is_cancelled() =>
            {
                let delay = retry.delay_for(attempt - 1);
                let step = &invocation.ctx.step;
                tracing::warn!(
                    step = %step,
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %error,
                    "Retrying step"
                );
                sink.try_emit(
                    events::STEP_RETRYING,
                    Some(json!({
                        "run_id": invocation.ctx.run_id,
                        "step": step,
                        "attempt": attempt,
                        "next_attempt": attempt + 1,
                        "delay_ms": u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "error": error.to_string(),
                    })),
                );

                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = invocation.ctx.cancellation.cancelled() => {
                        return AttemptOutcome {
                            result: Err(ExecutionError::cancelled(step)),
                            attempts: attempt,
                        };
                    }
                }
                attempt += 1;
            }
            result => {
                return AttemptOutcome {
                    result,
                    attempts: attempt,
                }
            }
        }
    }
}
