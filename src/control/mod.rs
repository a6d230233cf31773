//! Control-channel command set.
//!
//! A thin, transport-agnostic dispatch layer: the embedding application
//! frames commands however it likes (stdin lines, RPC, websocket) and hands
//! each decoded command to [`ControlHandler::handle`] — or raw JSON to
//! [`ControlHandler::handle_json`]. Every command produces exactly one
//! response object; `prompt`/`send` additionally stream the canonical event
//! sequence through the agent's bus while they run.
//!
//! Field names and command tags are accepted in snake_case or camelCase;
//! output always uses the canonical casing.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::agent::{Agent, AgentStateSnapshot, QueueDrainMode};
use crate::agent_loop::RunResult;
use crate::error::CanopyError;
use crate::types::{AgentMessage, ThinkingLevel};

/// A control-channel command, tagged by `type`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlCommand {
    /// Send a user message and run the loop until it settles.
    #[serde(alias = "prompt")]
    Send { message: String },
    /// Queue a steering message for the active run.
    Steer { message: String },
    /// Queue a follow-up message.
    #[serde(alias = "followUp")]
    FollowUp { message: String },
    /// Cancel the active run.
    Abort,
    /// Abort if needed and start a fresh session.
    #[serde(alias = "new_session", alias = "newSession")]
    Reset,
    /// Observable agent state.
    #[serde(alias = "getState")]
    GetState,
    /// Current conversation messages.
    #[serde(alias = "getMessages")]
    GetMessages,
    /// Switch provider/model.
    #[serde(alias = "setModel")]
    SetModel {
        provider: String,
        #[serde(alias = "modelId")]
        model_id: String,
    },
    /// Change the reasoning effort.
    #[serde(alias = "setThinkingLevel")]
    SetThinkingLevel { level: ThinkingLevel },
    /// Change how the steering mailbox drains.
    #[serde(alias = "setSteeringMode")]
    SetSteeringMode { mode: QueueDrainMode },
    /// Change how the follow-up mailbox drains.
    #[serde(alias = "setFollowUpMode")]
    SetFollowUpMode { mode: QueueDrainMode },
}

/// One response per command, tagged by `type`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ControlResponse {
    /// The command was applied.
    Ok,
    /// Terminal response for `prompt`/`send`: how the run settled.
    RunCompleted { result: RunResult },
    State { state: AgentStateSnapshot },
    Messages { messages: Vec<AgentMessage> },
    /// The command failed; the agent keeps running.
    Error { message: String },
}

/// Dispatches control commands onto one [`Agent`].
#[derive(Clone)]
pub struct ControlHandler {
    agent: Arc<Agent>,
}

impl ControlHandler {
    pub fn new(agent: Arc<Agent>) -> Self {
        Self { agent }
    }

    pub fn agent(&self) -> &Arc<Agent> {
        &self.agent
    }

    /// Decode a raw JSON command and dispatch it. Malformed input yields an
    /// `error` response rather than a transport failure.
    pub async fn handle_json(&self, raw: &str) -> ControlResponse {
        match serde_json::from_str::<ControlCommand>(raw) {
            Ok(command) => self.handle(command).await,
            Err(err) => ControlResponse::Error {
                message: CanopyError::Protocol(format!("malformed command: {err}")).to_string(),
            },
        }
    }

    /// Dispatch one command and produce its response.
    pub async fn handle(&self, command: ControlCommand) -> ControlResponse {
        match command {
            ControlCommand::Send { message } => match self.agent.send(message).await {
                Ok(result) => ControlResponse::RunCompleted { result },
                Err(err) => ControlResponse::Error {
                    message: err.to_string(),
                },
            },
            ControlCommand::Steer { message } => {
                self.agent.steer(message);
                ControlResponse::Ok
            }
            ControlCommand::FollowUp { message } => {
                self.agent.follow_up(message);
                ControlResponse::Ok
            }
            ControlCommand::Abort => {
                self.agent.abort();
                ControlResponse::Ok
            }
            ControlCommand::Reset => {
                self.agent.reset().await;
                ControlResponse::Ok
            }
            ControlCommand::GetState => ControlResponse::State {
                state: self.agent.snapshot(),
            },
            ControlCommand::GetMessages => ControlResponse::Messages {
                messages: self.agent.messages(),
            },
            ControlCommand::SetModel { provider, model_id } => {
                self.apply(self.agent.set_model(provider, model_id))
            }
            ControlCommand::SetThinkingLevel { level } => {
                self.apply(self.agent.set_thinking_level(level))
            }
            ControlCommand::SetSteeringMode { mode } => {
                self.agent.set_steering_mode(mode);
                ControlResponse::Ok
            }
            ControlCommand::SetFollowUpMode { mode } => {
                self.agent.set_follow_up_mode(mode);
                ControlResponse::Ok
            }
        }
    }

    fn apply(&self, result: crate::error::Result<()>) -> ControlResponse {
        match result {
            Ok(()) => ControlResponse::Ok,
            Err(err) => ControlResponse::Error {
                message: err.to_string(),
            },
        }
    }
}
