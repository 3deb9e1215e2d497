//! Dependency resolution.
//!
//! Derives the edge set of a graph from two sources: data edges implied by
//! input bindings that name an upstream output, and control edges declared
//! through explicit predecessors. Edges between the same pair of steps are
//! collapsed into one, which remembers every binding that produced it.

use crate::core::{ArtifactKind, StepId};
use crate::errors::UnresolvedReferenceError;
use crate::step::{InputSource, StepSpec};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A data binding carried by an edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataLink {
    /// Output name on the producing step.
    pub output: String,
    /// Input name on the consuming step.
    pub input: String,
    /// Whether the consumer can run without it.
    pub optional: bool,
}

/// A collapsed predecessor -> successor edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    /// Predecessor.
    pub from: StepId,
    /// Successor.
    pub to: StepId,
    /// Data bindings between the pair, in binding order.
    pub data: Vec<DataLink>,
    /// Whether the successor also declared the predecessor explicitly.
    pub control: bool,
}

impl Edge {
    /// Returns true if no data flows along the edge.
    #[must_use]
    pub fn is_control_only(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns true if every data binding on the edge is optional.
    #[must_use]
    pub fn all_data_optional(&self) -> bool {
        self.data.iter().all(|link| link.optional)
    }
}

/// Where a resolved input comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ResolvedSource {
    /// An output of a step in the graph.
    Upstream {
        /// The producing step.
        step: StepId,
        /// The output name.
        output: String,
        /// The kind the producer declared.
        produced: ArtifactKind,
    },
    /// An external artifact.
    Import {
        /// Opaque location.
        location: String,
    },
}

/// An input binding with its source resolved against the step set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedInput {
    /// Binding name.
    pub name: String,
    /// The kind the consumer requires.
    pub kind: ArtifactKind,
    /// Whether the consumer can run without it.
    pub optional: bool,
    /// Resolved source.
    pub source: ResolvedSource,
}

/// Output of [`resolve`].
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    /// Collapsed edges in discovery order.
    pub edges: Vec<Edge>,
    /// Number of edges before collapsing.
    pub raw_edge_count: usize,
    /// Resolved inputs per step, in binding order.
    pub inputs: HashMap<StepId, Vec<ResolvedInput>>,
}

/// Resolves every input binding and explicit predecessor of `steps`.
///
/// Step identities are assumed to be unique.
///
/// # Errors
///
/// Returns an error naming the first binding or predecessor that refers to
/// a step or output not present in `steps`.
pub fn resolve(steps: &[StepSpec]) -> Result<Resolution, UnresolvedReferenceError> {
    let by_id: HashMap<&StepId, &StepSpec> = steps.iter().map(|s| (&s.id, s)).collect();

    let mut resolution = Resolution::default();
    let mut edge_index: HashMap<(StepId, StepId), usize> = HashMap::new();

    let mut edge_for = |resolution: &mut Resolution, from: &StepId, to: &StepId| -> usize {
        resolution.raw_edge_count += 1;
        *edge_index.entry((from.clone(), to.clone())).or_insert_with(|| {
            resolution.edges.push(Edge {
                from: from.clone(),
                to: to.clone(),
                data: Vec::new(),
                control: false,
            });
            resolution.edges.len() - 1
        })
    };

    for step in steps {
        let mut resolved = Vec::with_capacity(step.inputs.len());

        for binding in &step.inputs {
            let source = match &binding.source {
                InputSource::Import { location } => ResolvedSource::Import {
                    location: location.clone(),
                },
                InputSource::Upstream {
                    step: upstream,
                    output,
                } => {
                    let producer = by_id.get(upstream).ok_or_else(|| UnresolvedReferenceError {
                        step: step.id.clone(),
                        input: binding.name.clone(),
                        upstream: upstream.clone(),
                        output: None,
                    })?;
                    let produced =
                        producer
                            .output_kind(output)
                            .ok_or_else(|| UnresolvedReferenceError {
                                step: step.id.clone(),
                                input: binding.name.clone(),
                                upstream: upstream.clone(),
                                output: Some(output.clone()),
                            })?;

                    let idx = edge_for(&mut resolution, upstream, &step.id);
                    resolution.edges[idx].data.push(DataLink {
                        output: output.clone(),
                        input: binding.name.clone(),
                        optional: binding.optional,
                    });

                    ResolvedSource::Upstream {
                        step: upstream.clone(),
                        output: output.clone(),
                        produced,
                    }
                }
            };

            resolved.push(ResolvedInput {
                name: binding.name.clone(),
                kind: binding.kind,
                optional: binding.optional,
                source,
            });
        }

        for predecessor in &step.after {
            if !by_id.contains_key(predecessor) {
                return Err(UnresolvedReferenceError {
                    step: step.id.clone(),
                    input: "after".to_string(),
                    upstream: predecessor.clone(),
                    output: None,
                });
            }
            let idx = edge_for(&mut resolution, predecessor, &step.id);
            resolution.edges[idx].control = true;
        }

        resolution.inputs.insert(step.id.clone(), resolved);
    }

    Ok(resolution)
}
