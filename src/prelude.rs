//! Convenience re-exports for embedders.

pub use crate::agent::{Agent, AgentConfig, AgentState, QueueDrainMode};
pub use crate::agent_loop::{AgentEvent, RunResult, RunStatus};
pub use crate::bus::EventBus;
pub use crate::config::CanopyConfig;
pub use crate::control::{ControlCommand, ControlHandler, ControlResponse};
pub use crate::error::{CanopyError, ProviderErrorKind, Result};
pub use crate::provider::{
    AdapterRegistry, CredentialResolver, GenerationSettings, ProviderAdapter, ProviderRequest,
    StreamEvent, ToolDefinition,
};
pub use crate::session::{SessionContext, SessionEntry, SessionInfo, SessionManager};
pub use crate::tools::{FnTool, Tool, ToolOutput};
pub use crate::types::{
    AgentMessage, AssistantMessage, ModelConfig, StopReason, ThinkingLevel, ToolResultMessage,
    Usage, UserBlock,
};
