//! Graph validation.
//!
//! Checks run in a fixed order and stop at the first failure: emptiness,
//! identity uniqueness, per-step declarations, reference resolution, kind
//! compatibility, acyclicity, gate bindings and executor policies. Only a
//! step set that passes every check becomes a [`Graph`].

use super::resolver::{resolve, ResolvedInput, ResolvedSource};
use super::Graph;
use crate::core::StepId;
use crate::errors::{ConstructionError, CycleError, DuplicateStepError, GateTypeError, TypeMismatchError};
use crate::registry::TypeRegistry;
use crate::step::StepSpec;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// Validates `steps` and assembles an immutable graph.
///
/// # Errors
///
/// Returns the first construction error found.
pub fn validate(
    name: &str,
    steps: Vec<StepSpec>,
    registry: Arc<TypeRegistry>,
) -> Result<Graph, ConstructionError> {
    if steps.is_empty() {
        return Err(ConstructionError::EmptyGraph(name.to_string()));
    }

    check_unique(&steps)?;
    for step in &steps {
        step.validate()?;
    }

    let resolution = resolve(&steps)?;
    check_types(&steps, &resolution.inputs, &registry)?;

    let index: HashMap<StepId, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.clone(), i))
        .collect();
    let links: Vec<(usize, usize)> = resolution
        .edges
        .iter()
        .filter_map(|e| Some((*index.get(&e.from)?, *index.get(&e.to)?)))
        .collect();

    let mut outgoing = vec![Vec::new(); steps.len()];
    let mut incoming = vec![Vec::new(); steps.len()];
    for (edge, &(from, to)) in links.iter().enumerate() {
        outgoing[from].push(edge);
        incoming[to].push(edge);
    }

    if let Some(cycle) = find_cycle(&steps, &links, &outgoing) {
        return Err(CycleError::new(cycle).into());
    }

    check_gates(&steps, &registry)?;
    for step in &steps {
        step.executor.validate(&step.id)?;
    }

    let order = kahn_order(steps.len(), &links, &outgoing, &incoming);

    tracing::debug!(
        graph = name,
        steps = steps.len(),
        edges = resolution.edges.len(),
        raw_edges = resolution.raw_edge_count,
        "Graph validated"
    );

    Ok(Graph {
        name: name.to_string(),
        registry,
        steps,
        index,
        edges: resolution.edges,
        raw_edge_count: resolution.raw_edge_count,
        resolved: resolution.inputs,
        links,
        outgoing,
        incoming,
        order,
    })
}

fn check_unique(steps: &[StepSpec]) -> Result<(), DuplicateStepError> {
    let mut seen = HashSet::new();
    for step in steps {
        if !seen.insert(&step.id) {
            return Err(DuplicateStepError {
                step: step.id.clone(),
            });
        }
    }
    Ok(())
}

fn check_types(
    steps: &[StepSpec],
    inputs: &HashMap<StepId, Vec<ResolvedInput>>,
    registry: &TypeRegistry,
) -> Result<(), TypeMismatchError> {
    for step in steps {
        let Some(resolved) = inputs.get(&step.id) else {
            continue;
        };
        for input in resolved {
            if let ResolvedSource::Upstream {
                step: from,
                output,
                produced,
            } = &input.source
            {
                if !registry.satisfies(*produced, input.kind) {
                    return Err(TypeMismatchError {
                        from: from.clone(),
                        output: output.clone(),
                        to: step.id.clone(),
                        input: input.name.clone(),
                        expected: input.kind,
                        actual: *produced,
                    });
                }
            }
        }
    }
    Ok(())
}

fn check_gates(steps: &[StepSpec], registry: &TypeRegistry) -> Result<(), GateTypeError> {
    for step in steps {
        let Some(ref gate) = step.gate else {
            continue;
        };
        let binding = step.binding(gate).ok_or_else(|| GateTypeError {
            step: step.id.clone(),
            gate_input: gate.clone(),
            actual: None,
        })?;
        if !registry.is_validation_result(binding.kind) {
            return Err(GateTypeError {
                step: step.id.clone(),
                gate_input: gate.clone(),
                actual: Some(binding.kind),
            });
        }
    }
    Ok(())
}

/// Depth-first search over successors with an explicit path stack.
///
/// Each frame holds a step and the position of the next outgoing edge to
/// try, so depth is bounded by memory rather than the thread stack. Returns
/// the cycle as a path whose first step is repeated at the end.
fn find_cycle(
    steps: &[StepSpec],
    links: &[(usize, usize)],
    outgoing: &[Vec<usize>],
) -> Option<Vec<StepId>> {
    let mut visited = vec![false; steps.len()];
    let mut on_stack = vec![false; steps.len()];
    let mut frames: Vec<(usize, usize)> = Vec::new();

    for start in 0..steps.len() {
        if visited[start] {
            continue;
        }
        visited[start] = true;
        on_stack[start] = true;
        frames.push((start, 0));

        while let Some(frame) = frames.last_mut() {
            let (node, cursor) = *frame;
            let Some(&edge) = outgoing[node].get(cursor) else {
                on_stack[node] = false;
                frames.pop();
                continue;
            };
            frame.1 += 1;

            let next = links[edge].1;
            if on_stack[next] {
                let from = frames.iter().position(|&(n, _)| n == next).unwrap_or(0);
                let cycle = frames[from..]
                    .iter()
                    .map(|&(n, _)| n)
                    .chain(std::iter::once(next))
                    .map(|n| steps[n].id.clone())
                    .collect();
                return Some(cycle);
            }
            if !visited[next] {
                visited[next] = true;
                on_stack[next] = true;
                frames.push((next, 0));
            }
        }
    }
    None
}

/// Kahn's algorithm, breaking ties by declaration order.
fn kahn_order(
    len: usize,
    links: &[(usize, usize)],
    outgoing: &[Vec<usize>],
    incoming: &[Vec<usize>],
) -> Vec<usize> {
    let mut in_degree: Vec<usize> = incoming.iter().map(Vec::len).collect();
    let mut ready: BTreeSet<usize> = (0..len).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(len);

    while let Some(next) = ready.pop_first() {
        order.push(next);
        for &edge in &outgoing[next] {
            let to = links[edge].1;
            in_degree[to] -= 1;
            if in_degree[to] == 0 {
                ready.insert(to);
            }
        }
    }

    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ArtifactKind;
    use crate::step::ExecutorPolicy;
    use crate::testing::EmitComponent;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    fn step(id: &str) -> StepSpec {
        StepSpec::new(id, Arc::new(EmitComponent::new()))
    }

    fn check(steps: Vec<StepSpec>) -> Result<Graph, ConstructionError> {
        validate("test", steps, Arc::new(TypeRegistry::default()))
    }

    #[test]
    fn test_empty_graph() {
        assert_eq!(check(vec![]).unwrap_err().code(), "GRAPH-008-EMPTY");
    }

    #[test]
    fn test_duplicate_identity() {
        let err = check(vec![step("a"), step("b"), step("a")]).unwrap_err();
        assert_eq!(
            err,
            ConstructionError::DuplicateStep(DuplicateStepError {
                step: StepId::from("a")
            })
        );
    }

    #[test]
    fn test_type_mismatch_names_edge() {
        let err = check(vec![
            step("stats").output("statistics", ArtifactKind::Statistics),
            step("trainer").input("examples", ArtifactKind::Dataset, "stats", "statistics"),
        ])
        .unwrap_err();

        match err {
            ConstructionError::TypeMismatch(e) => {
                assert_eq!(e.from.as_str(), "stats");
                assert_eq!(e.to.as_str(), "trainer");
                assert_eq!(e.expected, ArtifactKind::Dataset);
                assert_eq!(e.actual, ArtifactKind::Statistics);
            }
            other => panic!("expected type mismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_registry_compatibility_allows_blessing() {
        let graph = check(vec![
            step("validator").output("blessing", ArtifactKind::InfraBlessing),
            step("pusher")
                .input("check", ArtifactKind::ValidationResult, "validator", "blessing")
                .gated_on("check"),
        ]);
        assert!(graph.is_ok());
    }

    #[test]
    fn test_cycle_names_every_step() {
        let err = check(vec![
            step("a").after("c"),
            step("b").after("a"),
            step("c").after("b"),
            step("d").after("a"),
        ])
        .unwrap_err();

        match err {
            ConstructionError::Cycle(cycle) => {
                let names: Vec<&str> = cycle.cycle_path.iter().map(StepId::as_str).collect();
                assert_eq!(names, vec!["a", "b", "c", "a"]);
                assert_eq!(cycle.steps().len(), 3);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_cycle_through_data_edges() {
        let err = check(vec![
            step("x")
                .input("in", ArtifactKind::Dataset, "y", "out")
                .output("out", ArtifactKind::Dataset),
            step("y")
                .input("in", ArtifactKind::Dataset, "x", "out")
                .output("out", ArtifactKind::Dataset),
        ])
        .unwrap_err();
        assert_eq!(err.code(), "GRAPH-004-CYCLE");
    }

    fn chain(len: usize) -> Vec<StepSpec> {
        (0..len)
            .map(|i| {
                let spec = step(&format!("s{i}"));
                if i == 0 { spec } else { spec.after(format!("s{}", i - 1)) }
            })
            .collect()
    }

    #[test]
    fn test_deep_chain_validates() {
        let graph = check(chain(20_000)).unwrap();
        let order = graph.topological_order();
        assert_eq!(order.len(), 20_000);
        assert_eq!(order[0].as_str(), "s0");
        assert_eq!(order[19_999].as_str(), "s19999");
    }

    #[test]
    fn test_deep_cycle_reported_in_full() {
        let mut steps = chain(20_000);
        steps[0] = step("s0").after("s19999");

        match check(steps).unwrap_err() {
            ConstructionError::Cycle(cycle) => {
                assert_eq!(cycle.cycle_path.len(), 20_001);
                assert_eq!(cycle.cycle_path.first(), cycle.cycle_path.last());
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_gate_on_non_validation_kind() {
        let err = check(vec![
            step("trainer").output("model", ArtifactKind::Model),
            step("pusher")
                .input("model", ArtifactKind::Model, "trainer", "model")
                .gated_on("model"),
        ])
        .unwrap_err();

        assert_eq!(
            err,
            ConstructionError::GateType(GateTypeError {
                step: StepId::from("pusher"),
                gate_input: "model".to_string(),
                actual: Some(ArtifactKind::Model),
            })
        );
    }

    #[test]
    fn test_backend_config_checked_before_run() {
        let err = check(vec![step("indexer").executor(ExecutorPolicy::managed_remote(BTreeMap::new()))])
            .unwrap_err();
        assert_eq!(err.code(), "GRAPH-005-BACKEND");
    }

    #[test]
    fn test_topological_order_uses_declaration_tie_break() {
        let graph = check(vec![
            step("late").after("root"),
            step("root"),
            step("early").after("root"),
            step("join").after("early").after("late"),
        ])
        .unwrap();

        let order: Vec<&str> = graph.topological_order().into_iter().map(StepId::as_str).collect();
        assert_eq!(order, vec!["root", "late", "early", "join"]);
    }

    #[test]
    fn test_kahn_covers_every_step() {
        let links = vec![(0, 2), (1, 2), (2, 3)];
        let mut outgoing = vec![Vec::new(); 4];
        let mut incoming = vec![Vec::new(); 4];
        for (e, &(f, t)) in links.iter().enumerate() {
            outgoing[f].push(e);
            incoming[t].push(e);
        }
        assert_eq!(kahn_order(4, &links, &outgoing, &incoming), vec![0, 1, 2, 3]);
    }
}
