// Core state types synchronized from the daemon to connected clients.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Authoritative state of one open workspace.
///
/// Owned by the daemon's state store and only ever changed through
/// [`crate::mutation::apply_mutation`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceState {
    pub id: String,
    pub path: String,
    /// Version of the last mutation applied to this state (0 = none).
    pub version: u64,
    #[serde(default)]
    pub slots: BTreeMap<String, SlotState>,
    #[serde(default)]
    pub sessions: Vec<SessionInfo>,
    #[serde(default)]
    pub plans: Vec<PlanInfo>,
    #[serde(default)]
    pub jobs: Vec<JobInfo>,
    #[serde(default)]
    pub active_plan: Option<PlanInfo>,
    #[serde(default)]
    pub active_jobs: Vec<JobInfo>,
    #[serde(default)]
    pub pane_tabs: Vec<PaneTab>,
    #[serde(default)]
    pub watched_directories: BTreeMap<String, DirectoryEntries>,
    #[serde(default)]
    pub file_watcher_stats: Option<FileWatcherStats>,
}

impl WorkspaceState {
    pub fn new(id: impl Into<String>, path: impl Into<String>) -> Self {
        Self { id: id.into(), path: path.into(), ..Self::default() }
    }

    pub fn slot(&self, slot_id: &str) -> Option<&SlotState> {
        self.slots.get(slot_id)
    }
}

/// One pane/session within a workspace.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SlotState {
    pub slot_id: String,
    /// Append-only for the lifetime of the slot's session.
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub is_streaming: bool,
    #[serde(default)]
    pub is_compacting: bool,
    #[serde(default)]
    pub active_tool_executions: BTreeMap<String, ToolExecution>,
    #[serde(default)]
    pub queued_messages: QueuedMessages,
    #[serde(default, rename = "pendingUI")]
    pub pending_ui: Option<Value>,
}

impl SlotState {
    pub fn new(slot_id: impl Into<String>) -> Self {
        Self { slot_id: slot_id.into(), ..Self::default() }
    }
}

/// A chat message produced by the agent bridge. The body is opaque to sync.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub role: String,
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolExecution {
    pub tool_call_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
}

/// Messages typed while the agent is busy, delivered once it yields.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMessages {
    #[serde(default)]
    pub steering: Vec<String>,
    #[serde(default)]
    pub follow_up: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub message_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PlanInfo {
    pub path: String,
    pub title: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub completed_tasks: u32,
    #[serde(default)]
    pub total_tasks: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JobInfo {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// A tab in the workspace's pane strip; `slot_id` links it to a slot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PaneTab {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot_id: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub active: bool,
}

/// Latest scan result for a watched directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryEntries {
    #[serde(default)]
    pub entries: Vec<DirectoryEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryEntry {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub is_directory: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileWatcherStats {
    #[serde(default)]
    pub watched_directories: u32,
    #[serde(default)]
    pub cached_directories: u32,
    #[serde(default)]
    pub evictions: u64,
    #[serde(default)]
    pub scans: u64,
}
