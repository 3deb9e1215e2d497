//! Step specifications and the component interface.

mod component;
mod policy;
mod spec;

pub use component::{Component, ProducedOutput, StepContext, StepResult};
pub use policy::{ExecutorKind, ExecutorPolicy};
pub use spec::{InputBinding, InputSource, OutputDecl, StepSpec};
