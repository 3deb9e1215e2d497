//! Testing utilities for stepgraph.
//!
//! This module provides:
//! - Mock components and a recording backend
//! - Graph and orchestrator fixtures
//! - Assertions over run results

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{
    assert_all_succeeded, assert_run_status, assert_skipped_with, assert_step_status,
};
pub use fixtures::{gated_graph, linear_graph, test_orchestrator};
pub use mocks::{
    ConcurrencyGauge, EmitComponent, FailingComponent, FlakyComponent, RecordingBackend,
    SlowComponent, ValidationComponent,
};
