//! The turn state machine.
//!
//! [`LoopRunner`] drives one run: stream phase (provider call, canonical
//! event folding) and tool phase (sequential execution with steering
//! checkpoints), repeated until no tool calls remain and both mailboxes are
//! empty. Suspension happens at exactly two points: reading the next
//! provider-stream event and awaiting one tool execution.

pub mod events;
pub mod runner;
pub mod types;

pub use events::AgentEvent;
pub use runner::{
    EventSink, FollowUpMessagesFn, LoopRunner, MessageBatchFn, PersistMessageFn, RunHandle,
    RunRequest, SteeringMessagesFn, TransformContextFn,
};
pub use types::{RunResult, RunStatus};
