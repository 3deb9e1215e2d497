//! Run and step lifecycle events.
//!
//! The scheduler emits one event per state transition through an
//! [`EventSink`]. Payloads are JSON objects carrying at least `run_id` and,
//! for step events, `step`.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

/// A run began.
pub const RUN_STARTED: &str = "run.started";
/// A run reached a final status.
pub const RUN_COMPLETED: &str = "run.completed";
/// Every predecessor of a step reached a satisfying terminal state.
pub const STEP_READY: &str = "step.ready";
/// A step was handed to its backend.
pub const STEP_STARTED: &str = "step.started";
/// A step produced its outputs.
pub const STEP_SUCCEEDED: &str = "step.succeeded";
/// A step reused outputs recorded by an earlier run.
pub const STEP_CACHED: &str = "step.cached";
/// A step did not run.
pub const STEP_SKIPPED: &str = "step.skipped";
/// A step exhausted its attempts.
pub const STEP_FAILED: &str = "step.failed";
/// A failed attempt will be retried.
pub const STEP_RETRYING: &str = "step.retrying";
