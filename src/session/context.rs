//! Context reconstruction: replay an ancestor chain into a message list.

use std::collections::HashMap;

use crate::types::{AgentMessage, ThinkingLevel};

use super::entries::SessionEntry;

/// Pure transform applied to the projected message list before it is handed
/// to the adapter (pruning, rewriting). It never alters stored entries,
/// only the projection.
pub type ContextTransform = dyn Fn(Vec<AgentMessage>) -> Vec<AgentMessage> + Send + Sync;

/// The replayed state at a leaf: adapter-facing messages plus the effective
/// model selection along the branch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionContext {
    pub messages: Vec<AgentMessage>,
    pub thinking_level: ThinkingLevel,
    /// `(provider, model_id)` most recently in effect, if any.
    pub model: Option<(String, String)>,
}

/// Build the context for a leaf by replaying its root-to-leaf chain.
///
/// Message-bearing entries project into the message list; the most recent
/// `compaction` entry replaces everything before its `firstKeptEntryId`
/// with the stored summary. `thinking_level_change` / `model_change`
/// entries fold into the effective configuration without producing
/// messages.
pub fn build_session_context(
    entries: &[SessionEntry],
    by_id: &HashMap<String, usize>,
    leaf_id: Option<&str>,
    transform: Option<&ContextTransform>,
) -> SessionContext {
    let leaf_index = match leaf_id.and_then(|id| by_id.get(id)) {
        Some(index) => *index,
        None => return SessionContext::default(),
    };

    // Root-to-leaf chain via parent pointers.
    let mut path: Vec<&SessionEntry> = Vec::new();
    let mut current = Some(&entries[leaf_index]);
    while let Some(entry) = current {
        path.push(entry);
        current = entry
            .parent_id()
            .and_then(|pid| by_id.get(pid))
            .map(|index| &entries[*index]);
    }
    path.reverse();

    let mut thinking_level = ThinkingLevel::Off;
    let mut model: Option<(String, String)> = None;
    let mut compaction: Option<&SessionEntry> = None;

    for entry in &path {
        match entry {
            SessionEntry::ThinkingLevelChange(e) => thinking_level = e.thinking_level,
            SessionEntry::ModelChange(e) => {
                model = Some((e.provider.clone(), e.model_id.clone()));
            }
            SessionEntry::Message(e) => {
                if let AgentMessage::Assistant(assistant) = &e.message {
                    model = Some((assistant.provider.clone(), assistant.model.clone()));
                }
            }
            SessionEntry::Compaction(_) => compaction = Some(entry),
            _ => {}
        }
    }

    let mut messages: Vec<AgentMessage> = Vec::new();

    if let Some(SessionEntry::Compaction(compaction)) = compaction {
        messages.push(AgentMessage::user(format!(
            "Summary of the conversation so far:\n{}",
            compaction.summary
        )));
        let compaction_index = path
            .iter()
            .position(|entry| entry.id() == compaction.base.id)
            .unwrap_or(0);
        let mut found_first_kept = false;
        for entry in &path[..compaction_index] {
            if entry.id() == compaction.first_kept_entry_id {
                found_first_kept = true;
            }
            if found_first_kept {
                project_entry(entry, &mut messages);
            }
        }
        for entry in &path[compaction_index + 1..] {
            project_entry(entry, &mut messages);
        }
    } else {
        for entry in &path {
            project_entry(entry, &mut messages);
        }
    }

    if let Some(transform) = transform {
        messages = transform(messages);
    }

    SessionContext {
        messages,
        thinking_level,
        model,
    }
}

/// Project one entry into the message list. Non-message entries (labels,
/// custom data, session info) contribute nothing; branch summaries become
/// model-visible text.
fn project_entry(entry: &SessionEntry, messages: &mut Vec<AgentMessage>) {
    match entry {
        SessionEntry::Message(e) => messages.push(e.message.clone()),
        SessionEntry::BranchSummary(e) => {
            messages.push(AgentMessage::user(format!(
                "Summary of an earlier branch:\n{}",
                e.summary
            )));
        }
        _ => {}
    }
}
