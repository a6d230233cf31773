//! Branching, append-only session storage.
//!
//! A session is a JSONL file: one header line followed by immutable
//! entries. Entries form a tree via parent pointers — branching moves the
//! leaf pointer to an earlier entry and new appends grow a divergent chain
//! that shares the existing prefix. Nothing is ever edited or deleted.

pub mod context;
pub mod entries;
pub mod info;

pub use context::{build_session_context, ContextTransform, SessionContext};
pub use entries::{
    BranchSummaryEntry, CompactionEntry, CustomEntry, CustomMessageEntry, EntryBase, LabelEntry,
    MessageEntry, ModelChangeEntry, SessionEntry, SessionHeader, SessionInfoEntry,
    ThinkingLevelChangeEntry, SESSION_VERSION,
};
pub use info::{encode_cwd, SessionInfo};

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde_json::Value;
use uuid::Uuid;

use crate::error::{CanopyError, Result};
use crate::types::{AgentMessage, ThinkingLevel};

/// One session tree in one node's view of a session.
///
/// Used by embedders to render the branch structure.
#[derive(Debug, Clone)]
pub struct SessionTreeNode {
    pub entry: SessionEntry,
    pub label: Option<String>,
    pub children: Vec<SessionTreeNode>,
}

/// Owns a session's entries, index, leaf pointer, and persistence.
///
/// Writes are append-only and flushed before the append returns, so a
/// partially written entry is never observable. Persistence failures are
/// surfaced as [`CanopyError::Persistence`]; callers must treat them as
/// fatal for the run that encountered them.
pub struct SessionManager {
    cwd: String,
    session_dir: PathBuf,
    session_file: Option<PathBuf>,
    persist: bool,
    flushed: bool,
    header: SessionHeader,
    entries: Vec<SessionEntry>,
    by_id: HashMap<String, usize>,
    labels: HashMap<String, String>,
    leaf_id: Option<String>,
}

impl SessionManager {
    /// Create a new persisted session in `session_dir`.
    pub fn create(cwd: impl Into<String>, session_dir: impl Into<PathBuf>) -> Result<Self> {
        let cwd = cwd.into();
        let session_dir = session_dir.into();
        std::fs::create_dir_all(&session_dir)
            .map_err(|e| CanopyError::persistence("failed to create session directory", e))?;
        let mut manager = Self {
            cwd: cwd.clone(),
            session_dir,
            session_file: None,
            persist: true,
            flushed: false,
            header: SessionHeader::new(Uuid::new_v4().simple().to_string(), cwd, None),
            entries: Vec::new(),
            by_id: HashMap::new(),
            labels: HashMap::new(),
            leaf_id: None,
        };
        manager.assign_session_file();
        Ok(manager)
    }

    /// Create an ephemeral session that is never written to disk.
    pub fn in_memory(cwd: impl Into<String>) -> Self {
        let cwd = cwd.into();
        Self {
            cwd: cwd.clone(),
            session_dir: PathBuf::new(),
            session_file: None,
            persist: false,
            flushed: false,
            header: SessionHeader::new(Uuid::new_v4().simple().to_string(), cwd, None),
            entries: Vec::new(),
            by_id: HashMap::new(),
            labels: HashMap::new(),
            leaf_id: None,
        }
    }

    /// Open an existing session file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let (header, entries) = info::read_session_file(path).ok_or_else(|| {
            CanopyError::Persistence {
                message: format!("not a session file: {}", path.display()),
                source: None,
            }
        })?;

        let mut manager = Self {
            cwd: header.cwd.clone(),
            session_dir: path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(PathBuf::new),
            session_file: Some(path.to_path_buf()),
            persist: true,
            flushed: true,
            header,
            entries: Vec::new(),
            by_id: HashMap::new(),
            labels: HashMap::new(),
            leaf_id: None,
        };
        for entry in entries {
            manager.index_entry(entry);
        }
        Ok(manager)
    }

    /// Resume the most recent session in `session_dir`, or create a new one.
    pub fn continue_recent(
        cwd: impl Into<String>,
        session_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        let cwd = cwd.into();
        let session_dir = session_dir.into();
        match info::find_most_recent_session(&session_dir) {
            Some(path) => Self::open(path),
            None => Self::create(cwd, session_dir),
        }
    }

    /// Enumerate sessions for one project directory, most recent first.
    pub fn list(sessions_root: &Path, cwd: &Path) -> Vec<SessionInfo> {
        info::list_sessions_from_dir(&sessions_root.join(encode_cwd(cwd)))
    }

    /// Enumerate all sessions under a sessions root, most recent first.
    pub fn list_all(sessions_root: &Path) -> Vec<SessionInfo> {
        info::list_all_sessions(sessions_root)
    }

    /// Default per-project session directory under a sessions root.
    pub fn default_session_dir(sessions_root: &Path, cwd: &Path) -> PathBuf {
        sessions_root.join(encode_cwd(cwd))
    }

    // -- Accessors --

    pub fn is_persisted(&self) -> bool {
        self.persist
    }

    pub fn cwd(&self) -> &str {
        &self.cwd
    }

    pub fn session_id(&self) -> &str {
        &self.header.id
    }

    pub fn session_file(&self) -> Option<&Path> {
        self.session_file.as_deref()
    }

    pub fn header(&self) -> &SessionHeader {
        &self.header
    }

    pub fn entries(&self) -> &[SessionEntry] {
        &self.entries
    }

    pub fn entry(&self, id: &str) -> Option<&SessionEntry> {
        self.by_id.get(id).map(|index| &self.entries[*index])
    }

    pub fn leaf_id(&self) -> Option<&str> {
        self.leaf_id.as_deref()
    }

    pub fn leaf_entry(&self) -> Option<&SessionEntry> {
        self.leaf_id.as_deref().and_then(|id| self.entry(id))
    }

    /// Display label for an entry, if one is set.
    pub fn label(&self, entry_id: &str) -> Option<&str> {
        self.labels.get(entry_id).map(String::as_str)
    }

    /// Children of an entry, in append order.
    pub fn children(&self, parent_id: &str) -> Vec<&SessionEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.parent_id() == Some(parent_id))
            .collect()
    }

    /// Most recent session name, if any `session_info` entry set one.
    pub fn session_name(&self) -> Option<&str> {
        self.entries.iter().rev().find_map(|entry| match entry {
            SessionEntry::SessionInfo(info) => info.name.as_deref(),
            _ => None,
        })
    }

    // -- Appends --

    /// Append a conversation message at the current leaf.
    pub fn append_message(&mut self, message: AgentMessage) -> Result<String> {
        let base = self.next_base();
        self.append_entry(SessionEntry::Message(MessageEntry { base, message }))
    }

    pub fn append_thinking_level_change(&mut self, level: ThinkingLevel) -> Result<String> {
        let base = self.next_base();
        self.append_entry(SessionEntry::ThinkingLevelChange(ThinkingLevelChangeEntry {
            base,
            thinking_level: level,
        }))
    }

    pub fn append_model_change(
        &mut self,
        provider: impl Into<String>,
        model_id: impl Into<String>,
    ) -> Result<String> {
        let base = self.next_base();
        self.append_entry(SessionEntry::ModelChange(ModelChangeEntry {
            base,
            provider: provider.into(),
            model_id: model_id.into(),
        }))
    }

    pub fn append_compaction(
        &mut self,
        summary: impl Into<String>,
        first_kept_entry_id: impl Into<String>,
        tokens_before: u64,
        details: Option<Value>,
    ) -> Result<String> {
        let base = self.next_base();
        self.append_entry(SessionEntry::Compaction(CompactionEntry {
            base,
            summary: summary.into(),
            first_kept_entry_id: first_kept_entry_id.into(),
            tokens_before,
            details,
        }))
    }

    pub fn append_custom(
        &mut self,
        custom_type: impl Into<String>,
        data: Option<Value>,
    ) -> Result<String> {
        let base = self.next_base();
        self.append_entry(SessionEntry::Custom(CustomEntry {
            base,
            custom_type: custom_type.into(),
            data,
        }))
    }

    pub fn append_custom_message(
        &mut self,
        custom_type: impl Into<String>,
        content: Value,
        display: bool,
        details: Option<Value>,
    ) -> Result<String> {
        let base = self.next_base();
        self.append_entry(SessionEntry::CustomMessage(CustomMessageEntry {
            base,
            custom_type: custom_type.into(),
            content,
            display,
            details,
        }))
    }

    /// Set or clear (`label: None`) the display label of an entry.
    pub fn append_label(
        &mut self,
        target_id: impl Into<String>,
        label: Option<String>,
    ) -> Result<String> {
        let base = self.next_base();
        self.append_entry(SessionEntry::Label(LabelEntry {
            base,
            target_id: target_id.into(),
            label,
        }))
    }

    pub fn append_session_info(&mut self, name: Option<String>) -> Result<String> {
        let name = name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty());
        let base = self.next_base();
        self.append_entry(SessionEntry::SessionInfo(SessionInfoEntry { base, name }))
    }

    // -- Branching --

    /// Move the leaf pointer to an existing entry. Subsequent appends grow a
    /// new branch sharing the prefix up to that entry; nothing is copied and
    /// the original chain is untouched.
    pub fn branch(&mut self, at_entry_id: &str) -> Result<()> {
        if !self.by_id.contains_key(at_entry_id) {
            return Err(CanopyError::InvalidState(format!(
                "entry {at_entry_id} not found"
            )));
        }
        self.leaf_id = Some(at_entry_id.to_string());
        Ok(())
    }

    /// Branch and record a `branch_summary` entry describing the abandoned
    /// tip.
    pub fn branch_with_summary(
        &mut self,
        at_entry_id: Option<&str>,
        summary: impl Into<String>,
        details: Option<Value>,
    ) -> Result<String> {
        if let Some(id) = at_entry_id {
            if !self.by_id.contains_key(id) {
                return Err(CanopyError::InvalidState(format!("entry {id} not found")));
            }
        }
        self.leaf_id = at_entry_id.map(Into::into);
        let base = self.next_base();
        let from_id = at_entry_id.unwrap_or("root").to_string();
        self.append_entry(SessionEntry::BranchSummary(BranchSummaryEntry {
            base,
            from_id,
            summary: summary.into(),
            details,
        }))
    }

    /// Detach the leaf pointer; the next append starts a new root.
    pub fn reset_leaf(&mut self) {
        self.leaf_id = None;
    }

    /// Ordered root-to-leaf chain for an entry (current leaf by default).
    pub fn branch_entries(&self, entry_id: Option<&str>) -> Vec<&SessionEntry> {
        let start = entry_id.or(self.leaf_id.as_deref());
        let Some(start) = start.and_then(|id| self.entry(id)) else {
            return Vec::new();
        };
        let mut path = vec![start];
        let mut current = start;
        while let Some(parent) = current.parent_id().and_then(|pid| self.entry(pid)) {
            path.push(parent);
            current = parent;
        }
        path.reverse();
        path
    }

    /// Full tree of this session's entries (forest of roots).
    pub fn tree(&self) -> Vec<SessionTreeNode> {
        let roots: Vec<&SessionEntry> = self
            .entries
            .iter()
            .filter(|entry| match entry.parent_id() {
                None => true,
                Some(pid) => !self.by_id.contains_key(pid),
            })
            .collect();
        roots.iter().map(|root| self.build_node(root)).collect()
    }

    fn build_node(&self, entry: &SessionEntry) -> SessionTreeNode {
        SessionTreeNode {
            entry: entry.clone(),
            label: self.labels.get(entry.id()).cloned(),
            children: self
                .children(entry.id())
                .iter()
                .map(|child| self.build_node(child))
                .collect(),
        }
    }

    /// Start a fresh session (new header, empty tree) in the same
    /// directory. Returns the new session file path when persisted.
    pub fn new_session(&mut self) -> Option<PathBuf> {
        self.header = SessionHeader::new(Uuid::new_v4().simple().to_string(), self.cwd.clone(), None);
        self.entries.clear();
        self.by_id.clear();
        self.labels.clear();
        self.leaf_id = None;
        self.flushed = false;
        self.session_file = None;
        self.assign_session_file();
        self.session_file.clone()
    }

    /// Fork a new session whose history is the root-to-leaf chain of
    /// `leaf_id`. The current session file is left untouched; the fork gets
    /// its own header with `parentSession` pointing back. Returns the new
    /// file path when persisted.
    pub fn fork_at(&mut self, leaf_id: &str) -> Result<Option<PathBuf>> {
        let path: Vec<SessionEntry> = self
            .branch_entries(Some(leaf_id))
            .into_iter()
            .cloned()
            .collect();
        if path.is_empty() {
            return Err(CanopyError::InvalidState(format!(
                "entry {leaf_id} not found"
            )));
        }

        let parent_session = self
            .session_file
            .as_ref()
            .filter(|_| self.persist)
            .map(|p| p.display().to_string());
        self.header = SessionHeader::new(
            Uuid::new_v4().simple().to_string(),
            self.cwd.clone(),
            parent_session,
        );

        let kept_ids: HashSet<String> = path.iter().map(|e| e.id().to_string()).collect();
        let kept_labels: Vec<(String, String)> = self
            .labels
            .iter()
            .filter(|(target, _)| kept_ids.contains(*target))
            .map(|(target, label)| (target.clone(), label.clone()))
            .collect();

        self.entries.clear();
        self.by_id.clear();
        self.labels.clear();
        self.leaf_id = None;
        for entry in path {
            self.index_entry(entry);
        }

        self.session_file = None;
        self.flushed = false;
        self.assign_session_file();
        self.rewrite_file()?;
        for (target_id, label) in kept_labels {
            self.append_label(target_id, Some(label))?;
        }
        Ok(self.session_file.clone())
    }

    // -- Context --

    /// Replay the current leaf's chain into adapter-facing context.
    pub fn build_context(&self, transform: Option<&ContextTransform>) -> SessionContext {
        build_session_context(&self.entries, &self.by_id, self.leaf_id.as_deref(), transform)
    }

    /// Replay a specific leaf's chain into adapter-facing context.
    pub fn build_context_at(
        &self,
        leaf_id: &str,
        transform: Option<&ContextTransform>,
    ) -> SessionContext {
        build_session_context(&self.entries, &self.by_id, Some(leaf_id), transform)
    }

    // -- Internals --

    fn next_base(&self) -> EntryBase {
        EntryBase::new(self.generate_entry_id(), self.leaf_id.clone())
    }

    /// Generate a unique entry id (8 hex characters), falling back to a full
    /// UUID on collision.
    fn generate_entry_id(&self) -> String {
        for _ in 0..100 {
            let id = Uuid::new_v4().simple().to_string()[..8].to_string();
            if !self.by_id.contains_key(&id) {
                return id;
            }
        }
        Uuid::new_v4().simple().to_string()
    }

    fn index_entry(&mut self, entry: SessionEntry) {
        if let SessionEntry::Label(label) = &entry {
            match &label.label {
                Some(text) => {
                    self.labels.insert(label.target_id.clone(), text.clone());
                }
                None => {
                    self.labels.remove(&label.target_id);
                }
            }
        }
        self.leaf_id = Some(entry.id().to_string());
        self.by_id.insert(entry.id().to_string(), self.entries.len());
        self.entries.push(entry);
    }

    fn append_entry(&mut self, entry: SessionEntry) -> Result<String> {
        let id = entry.id().to_string();
        self.persist_entry(&entry)?;
        self.index_entry(entry);
        tracing::debug!(session_id = %self.header.id, entry_id = %id, "session entry appended");
        Ok(id)
    }

    fn assign_session_file(&mut self) {
        if !self.persist {
            return;
        }
        let file_timestamp = self.header.timestamp.replace([':', '.'], "-");
        self.session_file = Some(
            self.session_dir
                .join(format!("{}_{}.jsonl", file_timestamp, self.header.id)),
        );
    }

    /// Write one entry line, flushing before returning. The first write also
    /// lays down the header.
    fn persist_entry(&mut self, entry: &SessionEntry) -> Result<()> {
        if !self.persist {
            return Ok(());
        }
        let Some(path) = self.session_file.clone() else {
            return Ok(());
        };

        if !self.flushed {
            self.rewrite_file()?;
        }

        let line = serde_json::to_string(entry)
            .map_err(|e| CanopyError::persistence("failed to encode session entry", e))?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| CanopyError::persistence("failed to open session file", e))?;
        writeln!(file, "{line}")
            .and_then(|_| file.flush())
            .map_err(|e| CanopyError::persistence("failed to append session entry", e))?;
        Ok(())
    }

    /// Rewrite the whole file: header plus current entries.
    fn rewrite_file(&mut self) -> Result<()> {
        if !self.persist {
            return Ok(());
        }
        let Some(path) = self.session_file.clone() else {
            return Ok(());
        };
        let mut content = serde_json::to_string(&self.header)
            .map_err(|e| CanopyError::persistence("failed to encode session header", e))?;
        content.push('\n');
        for entry in &self.entries {
            content.push_str(
                &serde_json::to_string(entry)
                    .map_err(|e| CanopyError::persistence("failed to encode session entry", e))?,
            );
            content.push('\n');
        }
        std::fs::write(&path, content)
            .map_err(|e| CanopyError::persistence("failed to write session file", e))?;
        self.flushed = true;
        Ok(())
    }
}
