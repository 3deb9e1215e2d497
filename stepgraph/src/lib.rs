//! # Stepgraph
//!
//! An orchestration engine for typed step graphs.
//!
//! Stepgraph executes graphs of steps that exchange typed artifacts, with
//! support for:
//!
//! - **Two-phase construction**: steps are declared on a builder and frozen
//!   into an immutable, validated [`graph::Graph`]
//! - **Validation gating**: a step may run only when a quality check passed
//! - **Cache-aware scheduling**: identical inputs and parameters reuse prior outputs
//! - **Pluggable execution**: steps run in-process or on a managed remote service
//! - **Event-driven observability**: every state transition reaches an event sink
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use stepgraph::prelude::*;
//!
//! let graph = GraphBuilder::new("etl")
//!     .step(StepSpec::new("extract", extract).output("rows", ArtifactKind::Dataset))
//!     .step(
//!         StepSpec::new("load", load)
//!             .input("rows", ArtifactKind::Dataset, "extract", "rows")
//!             .output("table", ArtifactKind::Table),
//!     )
//!     .build()?;
//!
//! let orchestrator = Orchestrator::new(EngineConfig::default());
//! let result = orchestrator.run_default(&Arc::new(graph)).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod backend;
pub mod cache;
pub mod components;
pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod gate;
pub mod graph;
pub mod registry;
pub mod scheduler;
pub mod step;
pub mod store;
pub mod telemetry;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::backend::{BackendSelector, ExecutionBackend, LocalBackend, ManagedRemoteBackend};
    pub use crate::cache::{CacheIndex, CacheKey, InMemoryCacheIndex};
    pub use crate::components::{Importer, InfraValidator, PushDestination, Pusher, ValidationSpec};
    pub use crate::config::{EngineConfig, RunOptions};
    pub use crate::core::{
        Artifact, ArtifactKind, ArtifactRef, ArtifactState, RunStatus, SkipReason, StepId,
        StepStatus,
    };
    pub use crate::errors::{
        ConstructionError, ContractErrorInfo, ExecutionError, StepgraphError,
    };
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::graph::{Graph, GraphBuilder};
    pub use crate::registry::TypeRegistry;
    pub use crate::scheduler::{
        CancellationToken, Orchestrator, RetryPolicy, RunRecord, RunResult,
    };
    pub use crate::step::{
        Component, ExecutorKind, ExecutorPolicy, ProducedOutput, StepContext, StepResult,
        StepSpec,
    };
    pub use crate::store::{ArtifactStore, InMemoryArtifactStore};
}
