//! Canonical lifecycle event stream.
//!
//! The closed set delivered to every subscriber of an agent instance. Per
//! external send the ordering contract is:
//!
//! `agent_start` → { `turn_start`, (`message_start` `message_update`*
//! `message_end`)+, (`tool_execution_start` `tool_execution_update`*
//! `tool_execution_end`)*, `turn_end` } across turns → `agent_end` (only
//! when the loop settles with both mailboxes empty).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::provider::StreamEvent;
use crate::tools::ToolOutput;
use crate::types::{AgentMessage, ToolResultMessage};

/// A lifecycle event, tagged by `type` on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum AgentEvent {
    /// A run began processing.
    AgentStart,
    /// The run settled with both mailboxes empty.
    AgentEnd { messages: Vec<AgentMessage> },

    /// A turn began: initial send, steering injection, or follow-up.
    TurnStart,
    /// A turn ended. `message` is the turn's final assistant message (absent
    /// when the turn never produced one); `tool_results` are every result
    /// recorded during the turn, in execution order.
    TurnEnd {
        message: Option<AgentMessage>,
        tool_results: Vec<ToolResultMessage>,
    },

    /// A message entered the conversation (input or in-progress assistant).
    MessageStart { message: AgentMessage },
    /// The in-progress assistant message changed; `event` is the canonical
    /// provider delta that caused the change.
    MessageUpdate {
        message: AgentMessage,
        event: StreamEvent,
    },
    /// The message is complete and appended to the session tree.
    MessageEnd { message: AgentMessage },

    ToolExecutionStart {
        tool_call_id: String,
        tool_name: String,
        args: Value,
    },
    ToolExecutionUpdate {
        tool_call_id: String,
        tool_name: String,
        args: Value,
        partial: ToolOutput,
    },
    ToolExecutionEnd {
        tool_call_id: String,
        tool_name: String,
        result: ToolResultMessage,
        is_error: bool,
    },
}

impl AgentEvent {
    /// Wire tag of this event.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AgentStart => "agent_start",
            Self::AgentEnd { .. } => "agent_end",
            Self::TurnStart => "turn_start",
            Self::TurnEnd { .. } => "turn_end",
            Self::MessageStart { .. } => "message_start",
            Self::MessageUpdate { .. } => "message_update",
            Self::MessageEnd { .. } => "message_end",
            Self::ToolExecutionStart { .. } => "tool_execution_start",
            Self::ToolExecutionUpdate { .. } => "tool_execution_update",
            Self::ToolExecutionEnd { .. } => "tool_execution_end",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_snake_case_type_tags() {
        let event = AgentEvent::ToolExecutionStart {
            tool_call_id: "call-1".into(),
            tool_name: "bash".into(),
            args: serde_json::json!({ "command": "ls" }),
        };
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["type"], "tool_execution_start");
        assert_eq!(value["toolCallId"], "call-1");
        assert_eq!(value["toolName"], "bash");
    }

    #[test]
    fn kind_matches_wire_tag_for_every_variant() {
        let samples = vec![
            AgentEvent::AgentStart,
            AgentEvent::TurnStart,
            AgentEvent::TurnEnd {
                message: None,
                tool_results: Vec::new(),
            },
            AgentEvent::AgentEnd {
                messages: Vec::new(),
            },
        ];
        for event in samples {
            let value = serde_json::to_value(&event).expect("serialize");
            assert_eq!(value["type"], event.kind());
        }
    }
}
