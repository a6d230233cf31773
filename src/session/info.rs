//! Session discovery: summarize and enumerate stored sessions.

use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::types::AgentMessage;

use super::entries::{SessionEntry, SessionHeader};

/// Summary of one stored session, used for resumption pickers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub path: String,
    pub id: String,
    pub cwd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_session_path: Option<String>,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub message_count: usize,
    pub first_message: String,
}

/// Encode a working directory path for use in session directory names.
pub fn encode_cwd(path: &Path) -> String {
    let s = path.display().to_string();
    let s = s.trim_start_matches(['/', '\\']);
    let s = s.replace(['/', '\\', ':'], "-");
    format!("--{s}--")
}

/// Parse a session file into `(header, entries)`, skipping malformed lines.
/// Returns `None` when the file has no valid header.
pub fn read_session_file(path: &Path) -> Option<(SessionHeader, Vec<SessionEntry>)> {
    let content = std::fs::read_to_string(path).ok()?;
    let mut lines = content.lines().filter(|line| !line.trim().is_empty());

    let header: SessionHeader = serde_json::from_str(lines.next()?).ok()?;
    if header.r#type != "session" {
        return None;
    }

    let entries = lines
        .filter_map(|line| serde_json::from_str::<SessionEntry>(line).ok())
        .collect();
    Some((header, entries))
}

/// Build a [`SessionInfo`] for one session file.
pub fn build_session_info(path: &Path) -> Option<SessionInfo> {
    let (header, entries) = read_session_file(path)?;

    let stats_mtime = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());

    let mut message_count = 0usize;
    let mut first_message = String::new();
    let mut last_activity: Option<i64> = None;
    let mut name: Option<String> = None;

    for entry in &entries {
        match entry {
            SessionEntry::SessionInfo(info) => {
                if let Some(n) = &info.name {
                    if !n.trim().is_empty() {
                        name = Some(n.trim().to_string());
                    }
                }
            }
            SessionEntry::Message(message_entry) => {
                message_count += 1;
                match &message_entry.message {
                    AgentMessage::User(user) => {
                        let text = user.content.text();
                        if first_message.is_empty() && !text.is_empty() {
                            first_message = text;
                        }
                        last_activity = Some(last_activity.unwrap_or(0).max(user.timestamp));
                    }
                    AgentMessage::Assistant(assistant) => {
                        last_activity = Some(last_activity.unwrap_or(0).max(assistant.timestamp));
                    }
                    AgentMessage::ToolResult(_) => {}
                }
            }
            _ => {}
        }
    }

    let created = DateTime::parse_from_rfc3339(&header.timestamp)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or(stats_mtime);
    let modified = last_activity
        .filter(|ms| *ms > 0)
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or(created);

    Some(SessionInfo {
        path: path.display().to_string(),
        id: header.id,
        cwd: header.cwd,
        name,
        parent_session_path: header.parent_session,
        created,
        modified,
        message_count,
        first_message: if first_message.is_empty() {
            "(no messages)".to_string()
        } else {
            first_message
        },
    })
}

/// All sessions in one directory, most recently modified first.
pub fn list_sessions_from_dir(dir: &Path) -> Vec<SessionInfo> {
    let mut sessions: Vec<SessionInfo> = session_files(dir)
        .iter()
        .filter_map(|path| build_session_info(path))
        .collect();
    sessions.sort_by(|a, b| b.modified.cmp(&a.modified));
    sessions
}

/// All sessions under a sessions root (one subdirectory per project),
/// most recently modified first.
pub fn list_all_sessions(sessions_root: &Path) -> Vec<SessionInfo> {
    let mut sessions = Vec::new();
    let Ok(dirs) = std::fs::read_dir(sessions_root) else {
        return sessions;
    };
    for dir in dirs.filter_map(|d| d.ok()) {
        if dir.path().is_dir() {
            sessions.extend(
                session_files(&dir.path())
                    .iter()
                    .filter_map(|path| build_session_info(path)),
            );
        }
    }
    sessions.sort_by(|a, b| b.modified.cmp(&a.modified));
    sessions
}

/// The most recently modified parseable session file in a directory.
pub fn find_most_recent_session(dir: &Path) -> Option<PathBuf> {
    session_files(dir)
        .into_iter()
        .filter(|path| read_session_file(path).is_some())
        .max_by_key(|path| {
            std::fs::metadata(path)
                .and_then(|m| m.modified())
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH)
        })
}

fn session_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "jsonl"))
        .collect()
}
