//! Core run types for the agent loop.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::AgentMessage;

/// How a run settled.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
    Canceled,
}

/// Result of a run: the settle status plus every message produced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub status: RunStatus,
    /// Messages appended during this run, in order.
    #[serde(default)]
    pub messages: Vec<AgentMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default = "Utc::now")]
    pub finished_at: DateTime<Utc>,
}

impl RunResult {
    pub fn completed(messages: Vec<AgentMessage>) -> Self {
        Self {
            status: RunStatus::Completed,
            messages,
            error: None,
            finished_at: Utc::now(),
        }
    }

    pub fn canceled(messages: Vec<AgentMessage>) -> Self {
        Self {
            status: RunStatus::Canceled,
            messages,
            error: None,
            finished_at: Utc::now(),
        }
    }

    pub fn failed(error: impl Into<String>, messages: Vec<AgentMessage>) -> Self {
        Self {
            status: RunStatus::Failed,
            messages,
            error: Some(error.into()),
            finished_at: Utc::now(),
        }
    }
}
