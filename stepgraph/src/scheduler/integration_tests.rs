//! End-to-end scheduler tests.

use super::*;
use crate::core::{ArtifactKind, ArtifactState, RunStatus, SkipReason, StepId, StepStatus, IMPORT_PRODUCER};
use crate::errors::{ConstructionError, ExecutionError};
use crate::events::{self, EventSink};
use crate::graph::GraphBuilder;
use crate::step::{
    Component, ExecutorKind, ExecutorPolicy, ProducedOutput, StepContext, StepResult, StepSpec,
};
use crate::testing::{
    assert_all_succeeded, assert_run_status, assert_skipped_with, assert_step_status, gated_graph,
    linear_graph, test_orchestrator, ConcurrencyGauge, EmitComponent, FailingComponent,
    FlakyComponent, RecordingBackend, SlowComponent, ValidationComponent,
};
use crate::cache::fingerprint_value;
use crate::store::ArtifactStore;
use async_trait::async_trait;
use pretty_assertions::assert_eq;
use std::collections::BTreeMap;
use std::time::Duration;

/// Finishes without producing anything.
#[derive(Debug)]
struct SilentComponent;

#[async_trait]
impl Component for SilentComponent {
    fn name(&self) -> &str {
        "silent"
    }

    async fn run(&self, _ctx: &StepContext) -> Result<StepResult, ExecutionError> {
        Ok(StepResult::new())
    }
}

/// Emits every declared output with a fingerprint derived from the step,
/// the output name and the fingerprints of its inputs.
#[derive(Debug)]
struct DerivingComponent;

#[async_trait]
impl Component for DerivingComponent {
    fn name(&self) -> &str {
        "deriving"
    }

    async fn run(&self, ctx: &StepContext) -> Result<StepResult, ExecutionError> {
        let inputs: BTreeMap<&str, String> = ctx
            .inputs
            .iter()
            .map(|(name, artifact)| (name.as_str(), artifact.content_fingerprint()))
            .collect();
        let mut result = StepResult::new();
        for output in ctx.output_locations.keys() {
            let fingerprint = fingerprint_value(&serde_json::json!({
                "step": ctx.step.as_str(),
                "output": output,
                "inputs": inputs,
            }));
            result = result.with_output(output.clone(), ProducedOutput::new().with_fingerprint(fingerprint));
        }
        Ok(result)
    }
}

/// Marks every dataset in the store invalid.
struct InvalidatingComponent {
    store: Arc<dyn ArtifactStore>,
}

impl std::fmt::Debug for InvalidatingComponent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvalidatingComponent").finish_non_exhaustive()
    }
}

#[async_trait]
impl Component for InvalidatingComponent {
    fn name(&self) -> &str {
        "invalidating"
    }

    async fn run(&self, ctx: &StepContext) -> Result<StepResult, ExecutionError> {
        for artifact in self.store.query_by_kind(ArtifactKind::Dataset).await {
            self.store
                .transition(&artifact.id, ArtifactState::Invalid)
                .await
                .map_err(|e| ExecutionError::step_failed(&ctx.step, e.to_string()))?;
        }
        Ok(StepResult::new())
    }
}

fn fast_retry(retries: u32) -> RetryPolicy {
    RetryPolicy::new()
        .with_max_retries(retries)
        .with_base_delay_ms(1)
        .with_max_delay_ms(5)
}

#[tokio::test]
async fn test_gate_false_skips_publish_and_run_succeeds() {
    let (orchestrator, sink) = test_orchestrator();
    let graph = Arc::new(gated_graph(Some(false)).unwrap());

    let result = orchestrator.run(&graph, RunOptions::new()).await.unwrap();

    assert_run_status(&result, RunStatus::Succeeded);
    assert_all_succeeded(&result, &["extract", "validate"]);
    assert_skipped_with(
        &result,
        "publish",
        &SkipReason::GateClosed {
            gate_input: "verdict".to_string(),
        },
    );
    assert!(!sink.steps_for(events::STEP_STARTED).contains(&"publish".to_string()));
    assert!(result.artifact("publish", "pushed").is_none());
}

#[tokio::test]
async fn test_gate_true_runs_publish() {
    let (orchestrator, _sink) = test_orchestrator();
    let graph = Arc::new(gated_graph(Some(true)).unwrap());

    let result = orchestrator.run(&graph, RunOptions::new()).await.unwrap();

    assert_run_status(&result, RunStatus::Succeeded);
    assert_all_succeeded(&result, &["extract", "validate", "publish"]);
    assert_eq!(
        result.artifact("publish", "pushed").map(|a| a.kind),
        Some(ArtifactKind::PushedModel)
    );
}

#[tokio::test]
async fn test_missing_or_non_boolean_verdict_closes_gate() {
    let (orchestrator, _sink) = test_orchestrator();
    let graph = Arc::new(gated_graph(None).unwrap());
    let result = orchestrator.run(&graph, RunOptions::new()).await.unwrap();
    assert_step_status(&result, "publish", StepStatus::Skipped);

    let publish = Arc::new(EmitComponent::new());
    let graph = Arc::new(
        GraphBuilder::new("stringly")
            .step(
                StepSpec::new(
                    "validate",
                    Arc::new(ValidationComponent::with_raw_verdict("verdict", serde_json::json!("true"))),
                )
                .output("verdict", ArtifactKind::ValidationResult),
            )
            .step(
                StepSpec::new("publish", publish.clone())
                    .input("verdict", ArtifactKind::ValidationResult, "validate", "verdict")
                    .gated_on("verdict"),
            )
            .build()
            .unwrap(),
    );
    let result = orchestrator.run(&graph, RunOptions::new()).await.unwrap();
    assert_step_status(&result, "publish", StepStatus::Skipped);
    assert_eq!(publish.call_count(), 0);
}

#[tokio::test]
async fn test_failure_cascades_but_independent_branch_finishes() {
    let (orchestrator, _sink) = test_orchestrator();
    let independent = Arc::new(EmitComponent::new());
    let graph = Arc::new(
        GraphBuilder::new("cascade")
            .step(
                StepSpec::new("a", Arc::new(FailingComponent::new("disk full")))
                    .output("data", ArtifactKind::Dataset),
            )
            .step(
                StepSpec::new("b", Arc::new(EmitComponent::new()))
                    .input("data", ArtifactKind::Dataset, "a", "data")
                    .output("model", ArtifactKind::Model),
            )
            .step(
                StepSpec::new("d", Arc::new(EmitComponent::new()))
                    .input("model", ArtifactKind::Model, "b", "model"),
            )
            .step(StepSpec::new("c", independent.clone()).output("stats", ArtifactKind::Statistics))
            .build()
            .unwrap(),
    );

    let result = orchestrator.run(&graph, RunOptions::new()).await.unwrap();

    assert_run_status(&result, RunStatus::Failed);
    assert_step_status(&result, "a", StepStatus::Failed);
    assert!(result.error_of("a").unwrap().contains("disk full"));
    assert_skipped_with(&result, "b", &SkipReason::UpstreamFailed { step: StepId::from("a") });
    assert_skipped_with(&result, "d", &SkipReason::UpstreamSkipped { step: StepId::from("b") });
    assert_step_status(&result, "c", StepStatus::Succeeded);
    assert_eq!(independent.call_count(), 1);
}

#[tokio::test]
async fn test_failure_cascades_through_ordering_edge() {
    let (orchestrator, _sink) = test_orchestrator();
    let exporter = Arc::new(EmitComponent::new());
    let graph = Arc::new(
        GraphBuilder::new("ordering_cascade")
            .step(
                StepSpec::new("trainer", Arc::new(FailingComponent::new("out of memory")))
                    .output("model", ArtifactKind::Model),
            )
            .step(
                StepSpec::new("extractor", Arc::new(EmitComponent::new()))
                    .input("model", ArtifactKind::Model, "trainer", "model")
                    .output("embeddings", ArtifactKind::Table),
            )
            .step(StepSpec::new("exporter", exporter.clone()).after("extractor"))
            .build()
            .unwrap(),
    );

    let result = orchestrator.run(&graph, RunOptions::new()).await.unwrap();

    assert_run_status(&result, RunStatus::Failed);
    assert_skipped_with(&result, "extractor", &SkipReason::UpstreamFailed { step: StepId::from("trainer") });
    assert_skipped_with(&result, "exporter", &SkipReason::UpstreamSkipped { step: StepId::from("extractor") });
    assert_eq!(exporter.call_count(), 0);
}

#[tokio::test]
async fn test_ordering_edge_after_gate_skip_still_runs() {
    let (orchestrator, _sink) = test_orchestrator();
    let follower = Arc::new(EmitComponent::new());
    let graph = Arc::new(
        GraphBuilder::new("gate_then_order")
            .step(
                StepSpec::new("check", Arc::new(ValidationComponent::new("verdict", Some(false))))
                    .output("verdict", ArtifactKind::ValidationResult),
            )
            .step(
                StepSpec::new("push", Arc::new(EmitComponent::new()))
                    .input("verdict", ArtifactKind::ValidationResult, "check", "verdict")
                    .gated_on("verdict")
                    .output("pushed", ArtifactKind::PushedModel),
            )
            .step(
                StepSpec::new("report", Arc::new(EmitComponent::new()))
                    .optional_input("pushed", ArtifactKind::PushedModel, "push", "pushed"),
            )
            .step(StepSpec::new("notify", follower.clone()).after("report"))
            .build()
            .unwrap(),
    );

    let result = orchestrator.run(&graph, RunOptions::new()).await.unwrap();

    assert_run_status(&result, RunStatus::Succeeded);
    assert_step_status(&result, "push", StepStatus::Skipped);
    assert_all_succeeded(&result, &["check", "report", "notify"]);
    assert_eq!(follower.call_count(), 1);
}

#[tokio::test]
async fn test_failed_step_invalidates_pending_outputs() {
    let (orchestrator, _sink) = test_orchestrator();
    let graph = Arc::new(
        GraphBuilder::new("invalid")
            .step(
                StepSpec::new("trainer", Arc::new(FailingComponent::new("nan loss")))
                    .output("model", ArtifactKind::Model),
            )
            .build()
            .unwrap(),
    );

    orchestrator.run(&graph, RunOptions::new()).await.unwrap();

    let models = orchestrator.store().query_by_kind(ArtifactKind::Model).await;
    assert_eq!(models.len(), 1);
    assert_eq!(models[0].state, ArtifactState::Invalid);
}

#[tokio::test]
async fn test_optional_step_failure_does_not_fail_run() {
    let (orchestrator, _sink) = test_orchestrator();
    let graph = Arc::new(
        GraphBuilder::new("optional")
            .step(StepSpec::new("main", Arc::new(EmitComponent::new())).output("data", ArtifactKind::Dataset))
            .step(
                StepSpec::new("report", Arc::new(FailingComponent::new("no smtp")))
                    .input("data", ArtifactKind::Dataset, "main", "data")
                    .optional(),
            )
            .build()
            .unwrap(),
    );

    let result = orchestrator.run(&graph, RunOptions::new()).await.unwrap();

    assert_run_status(&result, RunStatus::Succeeded);
    assert_step_status(&result, "report", StepStatus::Failed);
}

#[tokio::test]
async fn test_optional_input_survives_failed_producer() {
    let (orchestrator, _sink) = test_orchestrator();
    let consumer = Arc::new(EmitComponent::new());
    let graph = Arc::new(
        GraphBuilder::new("alternate")
            .step(
                StepSpec::new("baseline", Arc::new(FailingComponent::new("no baseline")))
                    .output("model", ArtifactKind::Model)
                    .optional(),
            )
            .step(StepSpec::new("data", Arc::new(EmitComponent::new())).output("rows", ArtifactKind::Dataset))
            .step(
                StepSpec::new("evaluate", consumer.clone())
                    .input("rows", ArtifactKind::Dataset, "data", "rows")
                    .optional_input("baseline", ArtifactKind::Model, "baseline", "model")
                    .output("blessing", ArtifactKind::ModelBlessing),
            )
            .build()
            .unwrap(),
    );

    let result = orchestrator.run(&graph, RunOptions::new()).await.unwrap();

    assert_run_status(&result, RunStatus::Succeeded);
    assert_step_status(&result, "evaluate", StepStatus::Succeeded);
    let ctx = consumer.last_context().unwrap();
    assert!(ctx.input("rows").is_some());
    assert!(ctx.input("baseline").is_none());
}

#[tokio::test]
async fn test_invalidated_required_input_fails_consumer() {
    let (orchestrator, _sink) = test_orchestrator();
    let consumer = Arc::new(EmitComponent::new());
    let cleanup = InvalidatingComponent {
        store: Arc::clone(orchestrator.store()),
    };
    let graph = Arc::new(
        GraphBuilder::new("stale_input")
            .step(StepSpec::new("gen", Arc::new(EmitComponent::new())).output("rows", ArtifactKind::Dataset))
            .step(StepSpec::new("cleanup", Arc::new(cleanup)).after("gen"))
            .step(
                StepSpec::new("consumer", consumer.clone())
                    .input("rows", ArtifactKind::Dataset, "gen", "rows")
                    .after("cleanup")
                    .output("model", ArtifactKind::Model),
            )
            .build()
            .unwrap(),
    );

    let result = orchestrator.run(&graph, RunOptions::new()).await.unwrap();

    assert_run_status(&result, RunStatus::Failed);
    assert_step_status(&result, "consumer", StepStatus::Failed);
    assert_eq!(consumer.call_count(), 0);
    let error = result.error_of("consumer").unwrap();
    assert!(error.contains("'rows' is unavailable"), "{error}");
}

#[tokio::test]
async fn test_control_edges() {
    let (orchestrator, _sink) = test_orchestrator();
    let graph = Arc::new(
        GraphBuilder::new("control")
            .step(StepSpec::new("flaky_setup", Arc::new(FailingComponent::new("boom"))).optional())
            .step(StepSpec::new("after_failure", Arc::new(EmitComponent::new())).after("flaky_setup"))
            .step(
                StepSpec::new("check", Arc::new(ValidationComponent::new("verdict", Some(false))))
                    .output("verdict", ArtifactKind::ValidationResult),
            )
            .step(
                StepSpec::new("gated", Arc::new(EmitComponent::new()))
                    .input("verdict", ArtifactKind::ValidationResult, "check", "verdict")
                    .gated_on("verdict"),
            )
            .step(StepSpec::new("after_skip", Arc::new(EmitComponent::new())).after("gated"))
            .build()
            .unwrap(),
    );

    let result = orchestrator.run(&graph, RunOptions::new()).await.unwrap();

    assert_skipped_with(
        &result,
        "after_failure",
        &SkipReason::UpstreamFailed {
            step: StepId::from("flaky_setup"),
        },
    );
    assert_step_status(&result, "gated", StepStatus::Skipped);
    assert_step_status(&result, "after_skip", StepStatus::Succeeded);
}

fn diamond(branches: [&str; 2]) -> Arc<Graph> {
    let mut builder = GraphBuilder::new("diamond")
        .step(StepSpec::new("source", Arc::new(DerivingComponent)).output("rows", ArtifactKind::Dataset));
    for branch in branches {
        builder = builder.step(
            StepSpec::new(branch, Arc::new(DerivingComponent))
                .input("rows", ArtifactKind::Dataset, "source", "rows")
                .output("stats", ArtifactKind::Statistics),
        );
    }
    let graph = builder
        .step(
            StepSpec::new("join", Arc::new(DerivingComponent))
                .input("left", ArtifactKind::Statistics, "left", "stats")
                .input("right", ArtifactKind::Statistics, "right", "stats")
                .output("report", ArtifactKind::Table),
        )
        .build()
        .unwrap();
    Arc::new(graph)
}

fn fingerprints(result: &RunResult) -> BTreeMap<StepId, BTreeMap<String, String>> {
    result
        .artifacts
        .iter()
        .map(|(step, outputs)| {
            let outputs = outputs
                .iter()
                .map(|(name, artifact)| (name.clone(), artifact.content_fingerprint()))
                .collect();
            (step.clone(), outputs)
        })
        .collect()
}

#[tokio::test]
async fn test_independent_steps_order_does_not_change_outcome() {
    let (first_orchestrator, _) = test_orchestrator();
    let (second_orchestrator, _) = test_orchestrator();

    let first = first_orchestrator
        .run(&diamond(["left", "right"]), RunOptions::new())
        .await
        .unwrap();
    let second = second_orchestrator
        .run(&diamond(["right", "left"]), RunOptions::new())
        .await
        .unwrap();

    assert_run_status(&first, RunStatus::Succeeded);
    assert_eq!(first.status, second.status);
    assert_eq!(first.step_status, second.step_status);
    assert_eq!(fingerprints(&first), fingerprints(&second));
    assert_eq!(fingerprints(&first).len(), 4);
}

#[tokio::test]
async fn test_cache_idempotence() {
    let (orchestrator, _sink) = test_orchestrator();
    let gen = Arc::new(EmitComponent::new());
    let trainer = Arc::new(EmitComponent::new());
    let graph = Arc::new(
        GraphBuilder::new("cached")
            .step(
                StepSpec::new("gen", gen.clone())
                    .import("raw", ArtifactKind::Table, "gs://bucket/raw")
                    .output("examples", ArtifactKind::Dataset),
            )
            .step(
                StepSpec::new("trainer", trainer.clone())
                    .input("examples", ArtifactKind::Dataset, "gen", "examples")
                    .param("steps", serde_json::json!(100))
                    .output("model", ArtifactKind::Model),
            )
            .build()
            .unwrap(),
    );
    let options = RunOptions::new().with_cache(true);

    let first = orchestrator.run(&graph, options.clone()).await.unwrap();
    let second = orchestrator.run(&graph, options).await.unwrap();

    assert_all_succeeded(&first, &["gen", "trainer"]);
    assert_step_status(&second, "gen", StepStatus::Cached);
    assert_step_status(&second, "trainer", StepStatus::Cached);
    assert_eq!(gen.call_count(), 1);
    assert_eq!(trainer.call_count(), 1);

    let before = first.artifact("trainer", "model").unwrap();
    let after = second.artifact("trainer", "model").unwrap();
    assert_eq!(before.id, after.id);
    assert_eq!(before.content_fingerprint(), after.content_fingerprint());

    let state = second.record.step("trainer").unwrap();
    assert_eq!(state.reused_from, Some(first.run_id));
    assert_eq!(state.cache_key, first.record.step("trainer").unwrap().cache_key);
}

#[tokio::test]
async fn test_cache_disabled_reruns_but_records_key() {
    let (orchestrator, _sink) = test_orchestrator();
    let graph = Arc::new(linear_graph(&["a", "b"]).unwrap());

    let first = orchestrator.run(&graph, RunOptions::new()).await.unwrap();
    let second = orchestrator.run(&graph, RunOptions::new()).await.unwrap();

    assert_step_status(&second, "a", StepStatus::Succeeded);
    assert!(orchestrator.cache().is_empty());
    assert!(first.record.step("a").unwrap().cache_key.is_some());
    assert_eq!(
        first.record.step("a").unwrap().cache_key,
        second.record.step("a").unwrap().cache_key
    );
}

#[tokio::test]
async fn test_invalidated_output_forces_rerun() {
    let (orchestrator, _sink) = test_orchestrator();
    let gen = Arc::new(EmitComponent::new());
    let graph = Arc::new(
        GraphBuilder::new("invalidate")
            .step(StepSpec::new("gen", gen.clone()).output("rows", ArtifactKind::Dataset))
            .build()
            .unwrap(),
    );
    let options = RunOptions::new().with_cache(true);

    let first = orchestrator.run(&graph, options.clone()).await.unwrap();
    let rows = first.artifact("gen", "rows").unwrap();
    orchestrator
        .store()
        .transition(&rows.id, ArtifactState::Invalid)
        .await
        .unwrap();

    let second = orchestrator.run(&graph, options).await.unwrap();
    assert_step_status(&second, "gen", StepStatus::Succeeded);
    assert_eq!(gen.call_count(), 2);
}

#[tokio::test]
async fn test_param_change_misses_cache() {
    let (orchestrator, _sink) = test_orchestrator();
    let build = |steps: i64| {
        Arc::new(
            GraphBuilder::new("params")
                .step(
                    StepSpec::new("trainer", Arc::new(EmitComponent::new()))
                        .param("steps", serde_json::json!(steps))
                        .output("model", ArtifactKind::Model),
                )
                .build()
                .unwrap(),
        )
    };
    let options = RunOptions::new().with_cache(true);

    orchestrator.run(&build(100), options.clone()).await.unwrap();
    let changed = orchestrator.run(&build(200), options.clone()).await.unwrap();
    let same = orchestrator.run(&build(100), options).await.unwrap();

    assert_step_status(&changed, "trainer", StepStatus::Succeeded);
    assert_step_status(&same, "trainer", StepStatus::Cached);
}

#[tokio::test]
async fn test_cycle_never_dispatches() {
    let a = Arc::new(EmitComponent::new());
    let result = GraphBuilder::new("cyclic")
        .step(
            StepSpec::new("a", a.clone())
                .input("in", ArtifactKind::Dataset, "b", "out")
                .output("out", ArtifactKind::Dataset),
        )
        .step(
            StepSpec::new("b", Arc::new(EmitComponent::new()))
                .input("in", ArtifactKind::Dataset, "a", "out")
                .output("out", ArtifactKind::Dataset),
        )
        .build();

    let Err(ConstructionError::Cycle(err)) = result else {
        panic!("expected a cycle error");
    };
    assert_eq!(err.steps().len(), 2);
    assert_eq!(a.call_count(), 0);
}

#[tokio::test]
async fn test_retry_until_success() {
    let (orchestrator, sink) = test_orchestrator();
    let flaky = Arc::new(FlakyComponent::new(2));
    let graph = Arc::new(
        GraphBuilder::new("retry")
            .step(
                StepSpec::new("fetch", flaky.clone())
                    .output("rows", ArtifactKind::Dataset)
                    .with_retry(fast_retry(2)),
            )
            .build()
            .unwrap(),
    );

    let result = orchestrator.run(&graph, RunOptions::new()).await.unwrap();

    assert_step_status(&result, "fetch", StepStatus::Succeeded);
    assert_eq!(result.record.step("fetch").unwrap().attempts, 3);
    assert_eq!(flaky.attempts_seen(), vec![1, 2, 3]);
    assert_eq!(sink.events_of_type(events::STEP_RETRYING).len(), 2);
}

#[tokio::test]
async fn test_retries_exhausted() {
    let (orchestrator, _sink) = test_orchestrator();
    let flaky = Arc::new(FlakyComponent::new(5));
    let graph = Arc::new(
        GraphBuilder::new("exhausted")
            .step(StepSpec::new("fetch", flaky.clone()).output("rows", ArtifactKind::Dataset))
            .build()
            .unwrap(),
    );

    let result = orchestrator
        .run(&graph, RunOptions::new().with_default_retry(fast_retry(1)))
        .await
        .unwrap();

    assert_run_status(&result, RunStatus::Failed);
    assert_eq!(flaky.call_count(), 2);
}

#[tokio::test]
async fn test_timeout_fails_step() {
    let (orchestrator, _sink) = test_orchestrator();
    let graph = Arc::new(
        GraphBuilder::new("timeout")
            .step(
                StepSpec::new("slow", Arc::new(SlowComponent::new(Duration::from_secs(10))))
                    .output("rows", ArtifactKind::Dataset)
                    .with_timeout(Duration::from_millis(20)),
            )
            .build()
            .unwrap(),
    );

    let result = orchestrator.run(&graph, RunOptions::new()).await.unwrap();

    assert_run_status(&result, RunStatus::Failed);
    assert!(result.error_of("slow").unwrap().contains("timed out after 20ms"));
}

#[tokio::test]
async fn test_missing_output_fails_step() {
    let (orchestrator, _sink) = test_orchestrator();
    let graph = Arc::new(
        GraphBuilder::new("silent")
            .step(StepSpec::new("quiet", Arc::new(SilentComponent)).output("rows", ArtifactKind::Dataset))
            .build()
            .unwrap(),
    );

    let result = orchestrator.run(&graph, RunOptions::new()).await.unwrap();

    assert_step_status(&result, "quiet", StepStatus::Failed);
    assert!(result.error_of("quiet").unwrap().contains("'rows'"));
}

#[tokio::test]
async fn test_cancellation_skips_pending_and_stops_running() {
    let (orchestrator, _sink) = test_orchestrator();
    let graph = Arc::new(
        GraphBuilder::new("cancel")
            .step(StepSpec::new("done", Arc::new(EmitComponent::new())).output("rows", ArtifactKind::Dataset))
            .step(
                StepSpec::new("long", Arc::new(SlowComponent::new(Duration::from_secs(30))))
                    .input("rows", ArtifactKind::Dataset, "done", "rows")
                    .output("model", ArtifactKind::Model),
            )
            .step(
                StepSpec::new("next", Arc::new(EmitComponent::new()))
                    .input("model", ArtifactKind::Model, "long", "model"),
            )
            .build()
            .unwrap(),
    );
    let token = Arc::new(CancellationToken::new());
    let canceller = Arc::clone(&token);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel("operator request");
    });

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        orchestrator.run_with_cancellation(&graph, RunOptions::new(), token),
    )
    .await
    .unwrap()
    .unwrap();

    assert_run_status(&result, RunStatus::Cancelled);
    assert_step_status(&result, "done", StepStatus::Succeeded);
    assert_step_status(&result, "long", StepStatus::Failed);
    assert_skipped_with(&result, "next", &SkipReason::Cancelled);
    assert_eq!(result.record.cancel_reason.as_deref(), Some("operator request"));
    assert!(result.artifact("done", "rows").unwrap().is_valid());
}

#[tokio::test]
async fn test_cancelled_before_start_runs_nothing() {
    let (orchestrator, _sink) = test_orchestrator();
    let graph = Arc::new(linear_graph(&["a", "b"]).unwrap());
    let token = Arc::new(CancellationToken::new());
    token.cancel("shutdown");

    let result = orchestrator
        .run_with_cancellation(&graph, RunOptions::new(), token)
        .await
        .unwrap();

    assert_run_status(&result, RunStatus::Cancelled);
    assert_skipped_with(&result, "a", &SkipReason::Cancelled);
    assert_skipped_with(&result, "b", &SkipReason::Cancelled);
}

#[tokio::test]
async fn test_concurrency_limit_is_respected() {
    for limit in [1, 2] {
        let (orchestrator, _sink) = test_orchestrator();
        let gauge = Arc::new(ConcurrencyGauge::new());
        let mut builder = GraphBuilder::new("wide");
        for i in 0..4 {
            builder.add_step(StepSpec::new(
                format!("s{i}"),
                Arc::new(SlowComponent::new(Duration::from_millis(20)).with_gauge(Arc::clone(&gauge))),
            ));
        }
        let graph = Arc::new(builder.build().unwrap());

        let result = orchestrator
            .run(&graph, RunOptions::new().with_concurrency_limit(limit))
            .await
            .unwrap();

        assert_run_status(&result, RunStatus::Succeeded);
        assert!(gauge.peak() <= limit, "peak {} exceeded limit {limit}", gauge.peak());
    }
}

#[tokio::test]
async fn test_zero_concurrency_rejected_before_run() {
    let (orchestrator, sink) = test_orchestrator();
    let graph = Arc::new(linear_graph(&["a"]).unwrap());

    let err = orchestrator
        .run(&graph, RunOptions::new().with_concurrency_limit(0))
        .await
        .unwrap_err();

    assert!(matches!(err, crate::errors::StepgraphError::Config(_)));
    assert!(sink.is_empty());
    assert!(orchestrator.history().is_empty());
}

#[tokio::test]
async fn test_imports_are_registered() {
    let (orchestrator, _sink) = test_orchestrator();
    let gen = Arc::new(EmitComponent::new());
    let graph = Arc::new(
        GraphBuilder::new("imports")
            .step(
                StepSpec::new("gen", gen.clone())
                    .import("raw", ArtifactKind::Table, "bq://project.dataset.items")
                    .output("examples", ArtifactKind::Dataset),
            )
            .build()
            .unwrap(),
    );

    orchestrator.run(&graph, RunOptions::new()).await.unwrap();

    let tables = orchestrator.store().query_by_kind(ArtifactKind::Table).await;
    assert_eq!(tables.len(), 1);
    assert_eq!(tables[0].producer.as_str(), IMPORT_PRODUCER);
    assert_eq!(tables[0].state, ArtifactState::Consumed);
    let ctx = gen.last_context().unwrap();
    assert_eq!(ctx.input("raw").unwrap().location, "bq://project.dataset.items");
}

#[tokio::test]
async fn test_outputs_land_at_assigned_locations() {
    let (orchestrator, _sink) = test_orchestrator();
    let graph = Arc::new(linear_graph(&["a", "b"]).unwrap());

    let result = orchestrator.run(&graph, RunOptions::new()).await.unwrap();

    let outputs = orchestrator.store().get_outputs(&StepId::from("a")).await;
    let data = &outputs["data"];
    assert_eq!(data.location, format!("/tmp/stepgraph/a/data/{}", result.run_id));
    assert_eq!(data.state, ArtifactState::Consumed);
    assert_eq!(result.artifact("b", "data").unwrap().state, ArtifactState::Available);
}

#[tokio::test]
async fn test_event_order() {
    let (orchestrator, sink) = test_orchestrator();
    let graph = Arc::new(linear_graph(&["a", "b"]).unwrap());

    orchestrator.run(&graph, RunOptions::new()).await.unwrap();

    let types = sink.event_types();
    assert_eq!(types.first().map(String::as_str), Some(events::RUN_STARTED));
    assert_eq!(types.last().map(String::as_str), Some(events::RUN_COMPLETED));
    assert_eq!(sink.steps_for(events::STEP_SUCCEEDED), vec!["a", "b"]);

    let position = |event: &str, step: &str| {
        sink.events()
            .iter()
            .position(|(t, data)| {
                t == event
                    && data.as_ref().and_then(|d| d.get("step")).and_then(|s| s.as_str()) == Some(step)
            })
            .unwrap()
    };
    assert!(position(events::STEP_SUCCEEDED, "a") < position(events::STEP_STARTED, "b"));
}

#[tokio::test]
async fn test_remote_steps_use_remote_backend() {
    let remote = Arc::new(RecordingBackend::new(ExecutorKind::ManagedRemote));
    let remote_backend: Arc<dyn crate::backend::ExecutionBackend> = remote.clone();
    let (orchestrator, _sink) = test_orchestrator();
    let orchestrator = orchestrator.with_remote_backend(remote_backend);

    let args = BTreeMap::from([("machine_type".to_string(), serde_json::json!("n1-highmem-8"))]);
    let graph = Arc::new(
        GraphBuilder::new("remote")
            .step(StepSpec::new("local", Arc::new(EmitComponent::new())).output("rows", ArtifactKind::Dataset))
            .step(
                StepSpec::new("index", Arc::new(EmitComponent::new()))
                    .input("rows", ArtifactKind::Dataset, "local", "rows")
                    .output("index", ArtifactKind::Model)
                    .executor(ExecutorPolicy::managed_remote(args)),
            )
            .build()
            .unwrap(),
    );

    let result = orchestrator.run(&graph, RunOptions::new()).await.unwrap();

    assert_all_succeeded(&result, &["local", "index"]);
    assert_eq!(remote.invoked_steps(), vec![StepId::from("index")]);
    assert_eq!(
        result.record.step("index").unwrap().backend.as_deref(),
        Some("recording-MANAGED_REMOTE")
    );
}

#[tokio::test]
async fn test_missing_remote_backend_rejected_before_run() {
    let (orchestrator, sink) = test_orchestrator();
    let args = BTreeMap::from([("machine_type".to_string(), serde_json::json!("n1"))]);
    let graph = Arc::new(
        GraphBuilder::new("remote")
            .step(
                StepSpec::new("index", Arc::new(EmitComponent::new()))
                    .executor(ExecutorPolicy::managed_remote(args)),
            )
            .build()
            .unwrap(),
    );

    let err = orchestrator.run(&graph, RunOptions::new()).await.unwrap_err();

    assert!(matches!(
        err,
        crate::errors::StepgraphError::Construction(ConstructionError::BackendConfig(_))
    ));
    assert!(sink.is_empty());
}

#[tokio::test]
async fn test_history_records_each_run() {
    let (orchestrator, _sink) = test_orchestrator();
    let graph = Arc::new(linear_graph(&["a"]).unwrap());

    let first = orchestrator.run(&graph, RunOptions::new()).await.unwrap();
    let second = orchestrator.run(&graph, RunOptions::new()).await.unwrap();

    let history = orchestrator.history();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].run_id, first.run_id);
    assert_eq!(orchestrator.last_run().unwrap().run_id, second.run_id);
    assert_ne!(first.run_id, second.run_id);
    assert_eq!(history[1].to_json()["status"], "SUCCEEDED");
}

#[tokio::test]
async fn test_dependent_never_starts_before_predecessor_finishes() {
    let (orchestrator, sink) = test_orchestrator();
    let graph = Arc::new(
        GraphBuilder::new("ordering")
            .step(
                StepSpec::new("slow", Arc::new(SlowComponent::new(Duration::from_millis(30))))
                    .output("rows", ArtifactKind::Dataset),
            )
            .step(StepSpec::new("fast", Arc::new(EmitComponent::new())).output("rows", ArtifactKind::Dataset))
            .step(
                StepSpec::new("join", Arc::new(EmitComponent::new()))
                    .input("left", ArtifactKind::Dataset, "slow", "rows")
                    .input("right", ArtifactKind::Dataset, "fast", "rows"),
            )
            .build()
            .unwrap(),
    );

    let result = orchestrator.run(&graph, RunOptions::new()).await.unwrap();
    assert_run_status(&result, RunStatus::Succeeded);

    let record = &result.record;
    let join_started = record.step("join").unwrap().started_at.unwrap();
    for upstream in ["slow", "fast"] {
        assert!(record.step(upstream).unwrap().finished_at.unwrap() <= join_started);
    }
    assert_eq!(sink.steps_for(events::STEP_READY).last().map(String::as_str), Some("join"));
}

#[tokio::test]
async fn test_events_reach_custom_sink() {
    #[derive(Debug, Default)]
    struct Counter(parking_lot::Mutex<usize>);

    #[async_trait]
    impl EventSink for Counter {
        async fn emit(&self, _event_type: &str, _data: Option<serde_json::Value>) {
            *self.0.lock() += 1;
        }

        fn try_emit(&self, _event_type: &str, _data: Option<serde_json::Value>) {
            *self.0.lock() += 1;
        }
    }

    let counter = Arc::new(Counter::default());
    let sink: Arc<dyn EventSink> = counter.clone();
    let orchestrator = Orchestrator::new(crate::config::EngineConfig::default()).with_event_sink(sink);
    let graph = Arc::new(linear_graph(&["a"]).unwrap());

    orchestrator.run(&graph, RunOptions::new()).await.unwrap();

    // run.started, step.ready, step.started, step.succeeded, run.completed
    assert_eq!(*counter.0.lock(), 5);
}
