//! Session wire records: one JSON object per line, camelCase field names.
//!
//! The first line of a session file is a [`SessionHeader`]; every following
//! line is a [`SessionEntry`]. Entries are immutable once written.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{now_iso, AgentMessage, ThinkingLevel};

/// Current session file format version.
pub const SESSION_VERSION: u8 = 3;

/// Session file header (first line).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionHeader {
    pub r#type: String,
    pub version: u8,
    pub id: String,
    pub timestamp: String,
    pub cwd: String,
    /// Path of the session this one was branched from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_session: Option<String>,
}

impl SessionHeader {
    pub fn new(id: String, cwd: String, parent_session: Option<String>) -> Self {
        Self {
            r#type: "session".to_string(),
            version: SESSION_VERSION,
            id,
            timestamp: now_iso(),
            cwd,
            parent_session,
        }
    }
}

/// Base fields shared by every entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EntryBase {
    pub id: String,
    pub parent_id: Option<String>,
    pub timestamp: String,
}

impl EntryBase {
    pub fn new(id: String, parent_id: Option<String>) -> Self {
        Self {
            id,
            parent_id,
            timestamp: now_iso(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageEntry {
    #[serde(flatten)]
    pub base: EntryBase,
    pub message: AgentMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ThinkingLevelChangeEntry {
    #[serde(flatten)]
    pub base: EntryBase,
    pub thinking_level: ThinkingLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelChangeEntry {
    #[serde(flatten)]
    pub base: EntryBase,
    pub provider: String,
    pub model_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompactionEntry {
    #[serde(flatten)]
    pub base: EntryBase,
    pub summary: String,
    /// First ancestor entry still replayed verbatim after the compaction.
    pub first_kept_entry_id: String,
    pub tokens_before: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BranchSummaryEntry {
    #[serde(flatten)]
    pub base: EntryBase,
    pub from_id: String,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CustomEntry {
    #[serde(flatten)]
    pub base: EntryBase,
    pub custom_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CustomMessageEntry {
    #[serde(flatten)]
    pub base: EntryBase,
    pub custom_type: String,
    pub content: Value,
    #[serde(default)]
    pub display: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LabelEntry {
    #[serde(flatten)]
    pub base: EntryBase,
    pub target_id: String,
    /// `None` clears a previously set label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfoEntry {
    #[serde(flatten)]
    pub base: EntryBase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// A session entry, tagged by `type` on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEntry {
    Message(MessageEntry),
    ThinkingLevelChange(ThinkingLevelChangeEntry),
    ModelChange(ModelChangeEntry),
    Compaction(CompactionEntry),
    BranchSummary(BranchSummaryEntry),
    Custom(CustomEntry),
    CustomMessage(CustomMessageEntry),
    Label(LabelEntry),
    SessionInfo(SessionInfoEntry),
}

impl SessionEntry {
    pub fn base(&self) -> &EntryBase {
        match self {
            Self::Message(e) => &e.base,
            Self::ThinkingLevelChange(e) => &e.base,
            Self::ModelChange(e) => &e.base,
            Self::Compaction(e) => &e.base,
            Self::BranchSummary(e) => &e.base,
            Self::Custom(e) => &e.base,
            Self::CustomMessage(e) => &e.base,
            Self::Label(e) => &e.base,
            Self::SessionInfo(e) => &e.base,
        }
    }

    pub fn id(&self) -> &str {
        &self.base().id
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.base().parent_id.as_deref()
    }

    /// Wire tag of this entry.
    pub fn entry_type(&self) -> &'static str {
        match self {
            Self::Message(_) => "message",
            Self::ThinkingLevelChange(_) => "thinking_level_change",
            Self::ModelChange(_) => "model_change",
            Self::Compaction(_) => "compaction",
            Self::BranchSummary(_) => "branch_summary",
            Self::Custom(_) => "custom",
            Self::CustomMessage(_) => "custom_message",
            Self::Label(_) => "label",
            Self::SessionInfo(_) => "session_info",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn message_entry_round_trips_with_camel_case_names() {
        let entry = SessionEntry::Message(MessageEntry {
            base: EntryBase {
                id: "abc12345".into(),
                parent_id: Some("def67890".into()),
                timestamp: "2026-08-06T12:00:00.000Z".into(),
            },
            message: AgentMessage::user("hello"),
        });

        let line = serde_json::to_string(&entry).expect("serialize");
        assert!(line.contains("\"type\":\"message\""));
        assert!(line.contains("\"parentId\":\"def67890\""));

        let decoded: SessionEntry = serde_json::from_str(&line).expect("deserialize");
        assert_eq!(decoded, entry);
    }

    #[test]
    fn entry_type_tags_match_the_closed_set() {
        let base = EntryBase::new("a".into(), None);
        let entry = SessionEntry::ThinkingLevelChange(ThinkingLevelChangeEntry {
            base: base.clone(),
            thinking_level: ThinkingLevel::High,
        });
        let value = serde_json::to_value(&entry).expect("serialize");
        assert_eq!(value["type"], "thinking_level_change");
        assert_eq!(value["thinkingLevel"], "high");

        let entry = SessionEntry::ModelChange(ModelChangeEntry {
            base,
            provider: "anthropic".into(),
            model_id: "opus-4".into(),
        });
        let value = serde_json::to_value(&entry).expect("serialize");
        assert_eq!(value["type"], "model_change");
        assert_eq!(value["modelId"], "opus-4");
    }

    #[test]
    fn header_serializes_parent_session_only_when_present() {
        let header = SessionHeader::new("id-1".into(), "/work".into(), None);
        let value = serde_json::to_value(&header).expect("serialize");
        assert_eq!(value["type"], "session");
        assert_eq!(value["version"], SESSION_VERSION);
        assert!(value.get("parentSession").is_none());

        let branched =
            SessionHeader::new("id-2".into(), "/work".into(), Some("/tmp/a.jsonl".into()));
        let value = serde_json::to_value(&branched).expect("serialize");
        assert_eq!(value["parentSession"], "/tmp/a.jsonl");
    }
}
