//! High-level agent runtime wrapping the loop.

pub mod runtime;

pub use runtime::{Agent, AgentConfig, AgentState, AgentStateSnapshot, QueueDrainMode};
