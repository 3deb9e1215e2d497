//! Core domain model types for stepgraph.
//!
//! This module contains the fundamental types used throughout the engine:
//! - Step identities
//! - Artifact kinds, handles and typed output references
//! - Step, run and artifact status enums

mod artifact;
mod id;
mod status;

pub use artifact::{Artifact, ArtifactId, ArtifactKind, ArtifactRef, IMPORT_PRODUCER};
pub use id::StepId;
pub use status::{ArtifactState, RunStatus, SkipReason, StepStatus};
