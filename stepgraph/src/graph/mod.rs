//! Typed step graphs.
//!
//! Assembly is a pure two-phase affair: a [`GraphBuilder`] collects step
//! specifications, and [`GraphBuilder::build`] resolves, validates and
//! freezes them into a [`Graph`]. Nothing runs until the graph is handed to
//! the scheduler.

mod resolver;
mod validator;


pub use resolver::{resolve, DataLink, Edge, Resolution, ResolvedInput, ResolvedSource};
pub use validator::validate;

use crate::core::StepId;
use crate::errors::ConstructionError;
use crate::registry::TypeRegistry;
use crate::step::StepSpec;
use std::collections::HashMap;
use std::sync::Arc;

/// A validated, immutable step graph.
#[derive(Debug)]
pub struct Graph {
    name: String,
    registry: Arc<TypeRegistry>,
    /// Steps in declaration order.
    steps: Vec<StepSpec>,
    index: HashMap<StepId, usize>,
    edges: Vec<Edge>,
    raw_edge_count: usize,
    resolved: HashMap<StepId, Vec<ResolvedInput>>,
    /// `(from, to)` step indices, parallel to `edges`.
    links: Vec<(usize, usize)>,
    outgoing: Vec<Vec<usize>>,
    incoming: Vec<Vec<usize>>,
    order: Vec<usize>,
}

impl Graph {
    /// Returns the graph name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the type registry the graph was validated against.
    #[must_use]
    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    /// Returns the steps in declaration order.
    #[must_use]
    pub fn steps(&self) -> &[StepSpec] {
        &self.steps
    }

    /// Returns the number of steps.
    #[must_use]
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Looks up a step by identity.
    #[must_use]
    pub fn step(&self, id: &StepId) -> Option<&StepSpec> {
        self.index.get(id).map(|&i| &self.steps[i])
    }

    /// Returns the collapsed edge set.
    #[must_use]
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Returns the number of edges before duplicates were collapsed.
    #[must_use]
    pub fn raw_edge_count(&self) -> usize {
        self.raw_edge_count
    }

    /// Returns the edge between two steps, if any.
    #[must_use]
    pub fn edge(&self, from: &StepId, to: &StepId) -> Option<&Edge> {
        let to = *self.index.get(to)?;
        self.incoming[to]
            .iter()
            .map(|&e| &self.edges[e])
            .find(|edge| &edge.from == from)
    }

    /// Returns the direct predecessors of a step.
    #[must_use]
    pub fn predecessors(&self, id: &StepId) -> Vec<&StepId> {
        self.index.get(id).map_or_else(Vec::new, |&i| {
            self.incoming[i].iter().map(|&e| &self.edges[e].from).collect()
        })
    }

    /// Returns the direct successors of a step.
    #[must_use]
    pub fn successors(&self, id: &StepId) -> Vec<&StepId> {
        self.index.get(id).map_or_else(Vec::new, |&i| {
            self.outgoing[i].iter().map(|&e| &self.edges[e].to).collect()
        })
    }

    /// Returns the resolved inputs of a step, in binding order.
    #[must_use]
    pub fn resolved_inputs(&self, id: &StepId) -> &[ResolvedInput] {
        self.resolved.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Returns a topological order, ties broken by declaration order.
    #[must_use]
    pub fn topological_order(&self) -> Vec<&StepId> {
        self.order.iter().map(|&i| &self.steps[i].id).collect()
    }

    /// Returns true if `to` is reachable from `from` along graph edges.
    #[must_use]
    pub fn depends_on(&self, to: &StepId, from: &StepId) -> bool {
        let (Some(&target), Some(&start)) = (self.index.get(to), self.index.get(from)) else {
            return false;
        };
        let mut seen = vec![false; self.steps.len()];
        let mut stack = vec![start];
        while let Some(node) = stack.pop() {
            for &e in &self.outgoing[node] {
                let next = self.links[e].1;
                if next == target {
                    return true;
                }
                if !seen[next] {
                    seen[next] = true;
                    stack.push(next);
                }
            }
        }
        false
    }

    pub(crate) fn index_of(&self, id: &StepId) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub(crate) fn step_at(&self, idx: usize) -> &StepSpec {
        &self.steps[idx]
    }

    /// Edge indices entering step `idx`.
    pub(crate) fn incoming_at(&self, idx: usize) -> &[usize] {
        &self.incoming[idx]
    }

    /// Edge indices leaving step `idx`.
    pub(crate) fn outgoing_at(&self, idx: usize) -> &[usize] {
        &self.outgoing[idx]
    }

    pub(crate) fn edge_at(&self, edge: usize) -> (&Edge, usize, usize) {
        let (from, to) = self.links[edge];
        (&self.edges[edge], from, to)
    }
}

/// Builder for validated graphs.
#[derive(Debug, Clone)]
pub struct GraphBuilder {
    name: String,
    steps: Vec<StepSpec>,
    registry: Arc<TypeRegistry>,
}

impl GraphBuilder {
    /// Creates a new graph builder.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            registry: Arc::new(TypeRegistry::default()),
        }
    }

    /// Adds a step.
    #[must_use]
    pub fn step(mut self, spec: StepSpec) -> Self {
        self.steps.push(spec);
        self
    }

    /// Adds a step in place.
    pub fn add_step(&mut self, spec: StepSpec) {
        self.steps.push(spec);
    }

    /// Replaces the type registry.
    #[must_use]
    pub fn with_registry(mut self, registry: TypeRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    /// Validates the collected steps and freezes them into a graph.
    ///
    /// # Errors
    ///
    /// Returns the first construction error found. No step runs and no
    /// artifact is registered when this fails.
    pub fn build(self) -> Result<Graph, ConstructionError> {
        validate(&self.name, self.steps, self.registry)
    }

    /// Returns the graph name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of steps collected so far.
    #[must_use]
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }
}
