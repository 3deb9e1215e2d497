//! Graph and orchestrator fixtures.

use std::sync::Arc;

use crate::config::EngineConfig;
use crate::core::ArtifactKind;
use crate::errors::ConstructionError;
use crate::events::{CollectingEventSink, EventSink};
use crate::graph::{Graph, GraphBuilder};
use crate::scheduler::Orchestrator;
use crate::step::StepSpec;

use super::mocks::{EmitComponent, ValidationComponent};

/// Builds a chain `names[0] -> names[1] -> ...` of emitting steps.
///
/// Each step declares a `data` output of kind dataset; every step after
/// the first consumes its predecessor's `data` as `upstream`.
///
/// # Errors
///
/// Returns an error if the names are not valid, unique identities.
pub fn linear_graph(names: &[&str]) -> Result<Graph, ConstructionError> {
    let mut builder = GraphBuilder::new("linear");
    let mut previous: Option<&str> = None;
    for name in names {
        let mut step = StepSpec::new(*name, Arc::new(EmitComponent::new()))
            .output("data", ArtifactKind::Dataset);
        if let Some(prev) = previous {
            step = step.input("upstream", ArtifactKind::Dataset, prev, "data");
        }
        builder.add_step(step);
        previous = Some(name);
    }
    builder.build()
}

/// Builds `extract -> validate -> publish` with `publish` gated on the
/// validator's verdict.
///
/// # Errors
///
/// Never fails for the fixed step set; the result mirrors [`GraphBuilder::build`].
pub fn gated_graph(verdict: Option<bool>) -> Result<Graph, ConstructionError> {
    GraphBuilder::new("gated")
        .step(
            StepSpec::new("extract", Arc::new(EmitComponent::new()))
                .output("rows", ArtifactKind::Dataset),
        )
        .step(
            StepSpec::new("validate", Arc::new(ValidationComponent::new("verdict", verdict)))
                .input("rows", ArtifactKind::Dataset, "extract", "rows")
                .output("verdict", ArtifactKind::ValidationResult),
        )
        .step(
            StepSpec::new("publish", Arc::new(EmitComponent::new()))
                .input("rows", ArtifactKind::Dataset, "extract", "rows")
                .input("verdict", ArtifactKind::ValidationResult, "validate", "verdict")
                .output("pushed", ArtifactKind::PushedModel)
                .gated_on("verdict"),
        )
        .build()
}

/// An orchestrator wired to a collecting event sink.
#[must_use]
pub fn test_orchestrator() -> (Orchestrator, Arc<CollectingEventSink>) {
    let sink = Arc::new(CollectingEventSink::new());
    let events: Arc<dyn EventSink> = sink.clone();
    let orchestrator =
        Orchestrator::new(EngineConfig::default().with_pipeline_root("/tmp/stepgraph"))
            .with_event_sink(events);
    (orchestrator, sink)
}
