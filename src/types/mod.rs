//! Core data types: messages, content blocks, usage, model configuration.

pub mod message;
pub mod model;
pub mod usage;

pub use message::{
    AgentMessage, AssistantBlock, AssistantMessage, StopReason, ToolCallBlock, ToolResultMessage,
    UserBlock, UserContent, UserMessage,
};
pub use model::{ModelConfig, ThinkingLevel};
pub use usage::Usage;

/// Current time as epoch milliseconds (message timestamps).
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Current time as an RFC3339 string with millisecond precision (entry
/// timestamps).
pub fn now_iso() -> String {
    chrono::Utc::now()
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
