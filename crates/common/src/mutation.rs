// State mutations: the unit of application, persistence and wire transfer.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::types::{
    ChatMessage, DirectoryEntries, DirectoryEntry, FileWatcherStats, JobInfo, PaneTab, PlanInfo,
    QueuedMessages, SessionInfo, SlotState, ToolExecution, WorkspaceState,
};

/// A single typed change to one workspace's state.
///
/// Internally tagged by `type` so the JSON form matches what clients send and
/// receive (`{"type":"slotCreate","workspaceId":"ws-1","slotId":"s1"}`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum StateMutation {
    WorkspaceCreate {
        workspace_id: String,
        path: String,
    },
    WorkspaceClose {
        workspace_id: String,
    },
    SlotCreate {
        workspace_id: String,
        slot_id: String,
    },
    SlotDelete {
        workspace_id: String,
        slot_id: String,
    },
    /// Partial patch; absent fields are left untouched.
    SlotUpdate {
        workspace_id: String,
        slot_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_streaming: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_compacting: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        messages: Option<Vec<ChatMessage>>,
    },
    MessagesAppend {
        workspace_id: String,
        slot_id: String,
        messages: Vec<ChatMessage>,
    },
    ToolExecutionStart {
        workspace_id: String,
        slot_id: String,
        execution: ToolExecution,
    },
    ToolExecutionEnd {
        workspace_id: String,
        slot_id: String,
        tool_call_id: String,
    },
    SessionsUpdate {
        workspace_id: String,
        sessions: Vec<SessionInfo>,
    },
    PlansUpdate {
        workspace_id: String,
        plans: Vec<PlanInfo>,
    },
    JobsUpdate {
        workspace_id: String,
        jobs: Vec<JobInfo>,
    },
    ActivePlanUpdate {
        workspace_id: String,
        #[serde(default)]
        active_plan: Option<PlanInfo>,
    },
    ActiveJobsUpdate {
        workspace_id: String,
        active_jobs: Vec<JobInfo>,
    },
    #[serde(rename = "workspaceUIUpdate")]
    WorkspaceUiUpdate {
        workspace_id: String,
        pane_tabs: Vec<PaneTab>,
    },
    QueuedMessagesUpdate {
        workspace_id: String,
        slot_id: String,
        queued_messages: QueuedMessages,
    },
    #[serde(rename = "pendingUISet")]
    PendingUiSet {
        workspace_id: String,
        slot_id: String,
        #[serde(default, rename = "pendingUI")]
        pending_ui: Option<Value>,
    },
    WatchedDirectoryAdd {
        workspace_id: String,
        path: String,
    },
    WatchedDirectoryRemove {
        workspace_id: String,
        path: String,
    },
    DirectoryEntriesUpdate {
        workspace_id: String,
        path: String,
        entries: Vec<DirectoryEntry>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        updated_at: Option<i64>,
    },
    FileWatcherStatsUpdate {
        workspace_id: String,
        stats: FileWatcherStats,
    },
    DirectoryWatchError {
        workspace_id: String,
        path: String,
        error: String,
    },
}

impl StateMutation {
    pub fn workspace_id(&self) -> &str {
        match self {
            Self::WorkspaceCreate { workspace_id, .. }
            | Self::WorkspaceClose { workspace_id }
            | Self::SlotCreate { workspace_id, .. }
            | Self::SlotDelete { workspace_id, .. }
            | Self::SlotUpdate { workspace_id, .. }
            | Self::MessagesAppend { workspace_id, .. }
            | Self::ToolExecutionStart { workspace_id, .. }
            | Self::ToolExecutionEnd { workspace_id, .. }
            | Self::SessionsUpdate { workspace_id, .. }
            | Self::PlansUpdate { workspace_id, .. }
            | Self::JobsUpdate { workspace_id, .. }
            | Self::ActivePlanUpdate { workspace_id, .. }
            | Self::ActiveJobsUpdate { workspace_id, .. }
            | Self::WorkspaceUiUpdate { workspace_id, .. }
            | Self::QueuedMessagesUpdate { workspace_id, .. }
            | Self::PendingUiSet { workspace_id, .. }
            | Self::WatchedDirectoryAdd { workspace_id, .. }
            | Self::WatchedDirectoryRemove { workspace_id, .. }
            | Self::DirectoryEntriesUpdate { workspace_id, .. }
            | Self::FileWatcherStatsUpdate { workspace_id, .. }
            | Self::DirectoryWatchError { workspace_id, .. } => workspace_id,
        }
    }

    pub fn slot_id(&self) -> Option<&str> {
        match self {
            Self::SlotCreate { slot_id, .. }
            | Self::SlotDelete { slot_id, .. }
            | Self::SlotUpdate { slot_id, .. }
            | Self::MessagesAppend { slot_id, .. }
            | Self::ToolExecutionStart { slot_id, .. }
            | Self::ToolExecutionEnd { slot_id, .. }
            | Self::QueuedMessagesUpdate { slot_id, .. }
            | Self::PendingUiSet { slot_id, .. } => Some(slot_id),
            Self::WorkspaceCreate { .. }
            | Self::WorkspaceClose { .. }
            | Self::SessionsUpdate { .. }
            | Self::PlansUpdate { .. }
            | Self::JobsUpdate { .. }
            | Self::ActivePlanUpdate { .. }
            | Self::ActiveJobsUpdate { .. }
            | Self::WorkspaceUiUpdate { .. }
            | Self::WatchedDirectoryAdd { .. }
            | Self::WatchedDirectoryRemove { .. }
            | Self::DirectoryEntriesUpdate { .. }
            | Self::FileWatcherStatsUpdate { .. }
            | Self::DirectoryWatchError { .. } => None,
        }
    }

    /// The wire tag, for logging.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::WorkspaceCreate { .. } => "workspaceCreate",
            Self::WorkspaceClose { .. } => "workspaceClose",
            Self::SlotCreate { .. } => "slotCreate",
            Self::SlotDelete { .. } => "slotDelete",
            Self::SlotUpdate { .. } => "slotUpdate",
            Self::MessagesAppend { .. } => "messagesAppend",
            Self::ToolExecutionStart { .. } => "toolExecutionStart",
            Self::ToolExecutionEnd { .. } => "toolExecutionEnd",
            Self::SessionsUpdate { .. } => "sessionsUpdate",
            Self::PlansUpdate { .. } => "plansUpdate",
            Self::JobsUpdate { .. } => "jobsUpdate",
            Self::ActivePlanUpdate { .. } => "activePlanUpdate",
            Self::ActiveJobsUpdate { .. } => "activeJobsUpdate",
            Self::WorkspaceUiUpdate { .. } => "workspaceUIUpdate",
            Self::QueuedMessagesUpdate { .. } => "queuedMessagesUpdate",
            Self::PendingUiSet { .. } => "pendingUISet",
            Self::WatchedDirectoryAdd { .. } => "watchedDirectoryAdd",
            Self::WatchedDirectoryRemove { .. } => "watchedDirectoryRemove",
            Self::DirectoryEntriesUpdate { .. } => "directoryEntriesUpdate",
            Self::FileWatcherStatsUpdate { .. } => "fileWatcherStatsUpdate",
            Self::DirectoryWatchError { .. } => "directoryWatchError",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MutationError {
    #[error("unknown workspace: {0}")]
    UnknownWorkspace(String),

    #[error("unknown slot `{slot_id}` in workspace `{workspace_id}`")]
    UnknownSlot { workspace_id: String, slot_id: String },

    #[error("slot `{slot_id}` already exists in workspace `{workspace_id}`")]
    SlotExists { workspace_id: String, slot_id: String },
}

/// Apply `mutation` to `workspace`, where `None` means the workspace is not open.
///
/// Validation runs before anything is written, so on error `workspace` is
/// left exactly as it was.
pub fn apply_mutation(
    workspace: &mut Option<WorkspaceState>,
    mutation: &StateMutation,
) -> Result<(), MutationError> {
    match mutation {
        StateMutation::WorkspaceCreate { workspace_id, path } => {
            if let Some(state) = workspace.as_mut() {
                state.path.clone_from(path);
            } else {
                *workspace = Some(WorkspaceState::new(workspace_id.as_str(), path.as_str()));
            }
            return Ok(());
        }
        StateMutation::WorkspaceClose { workspace_id } => {
            if workspace.take().is_none() {
                return Err(MutationError::UnknownWorkspace(workspace_id.clone()));
            }
            return Ok(());
        }
        _ => {}
    }

    let Some(state) = workspace.as_mut() else {
        return Err(MutationError::UnknownWorkspace(mutation.workspace_id().to_string()));
    };

    match mutation {
        StateMutation::WorkspaceCreate { .. } | StateMutation::WorkspaceClose { .. } => {}
        StateMutation::SlotCreate { workspace_id, slot_id } => {
            if state.slots.contains_key(slot_id) {
                return Err(MutationError::SlotExists {
                    workspace_id: workspace_id.clone(),
                    slot_id: slot_id.clone(),
                });
            }
            state.slots.insert(slot_id.clone(), SlotState::new(slot_id.as_str()));
        }
        StateMutation::SlotDelete { workspace_id, slot_id } => {
            if state.slots.remove(slot_id).is_none() {
                return Err(unknown_slot(workspace_id, slot_id));
            }
        }
        StateMutation::SlotUpdate {
            workspace_id,
            slot_id,
            is_streaming,
            is_compacting,
            messages,
        } => {
            let slot = slot_mut(state, workspace_id, slot_id)?;
            if let Some(is_streaming) = is_streaming {
                slot.is_streaming = *is_streaming;
            }
            if let Some(is_compacting) = is_compacting {
                slot.is_compacting = *is_compacting;
            }
            if let Some(messages) = messages {
                slot.messages.clone_from(messages);
            }
        }
        StateMutation::MessagesAppend { workspace_id, slot_id, messages } => {
            let slot = slot_mut(state, workspace_id, slot_id)?;
            slot.messages.extend(messages.iter().cloned());
        }
        StateMutation::ToolExecutionStart { workspace_id, slot_id, execution } => {
            let slot = slot_mut(state, workspace_id, slot_id)?;
            slot.active_tool_executions.insert(execution.tool_call_id.clone(), execution.clone());
        }
        StateMutation::ToolExecutionEnd { workspace_id, slot_id, tool_call_id } => {
            let slot = slot_mut(state, workspace_id, slot_id)?;
            slot.active_tool_executions.remove(tool_call_id);
        }
        StateMutation::SessionsUpdate { sessions, .. } => state.sessions.clone_from(sessions),
        StateMutation::PlansUpdate { plans, .. } => state.plans.clone_from(plans),
        StateMutation::JobsUpdate { jobs, .. } => state.jobs.clone_from(jobs),
        StateMutation::ActivePlanUpdate { active_plan, .. } => {
            state.active_plan.clone_from(active_plan);
        }
        StateMutation::ActiveJobsUpdate { active_jobs, .. } => {
            state.active_jobs.clone_from(active_jobs);
        }
        StateMutation::WorkspaceUiUpdate { pane_tabs, .. } => {
            state.pane_tabs.clone_from(pane_tabs);
        }
        StateMutation::QueuedMessagesUpdate { workspace_id, slot_id, queued_messages } => {
            let slot = slot_mut(state, workspace_id, slot_id)?;
            slot.queued_messages.clone_from(queued_messages);
        }
        StateMutation::PendingUiSet { workspace_id, slot_id, pending_ui } => {
            let slot = slot_mut(state, workspace_id, slot_id)?;
            slot.pending_ui.clone_from(pending_ui);
        }
        StateMutation::WatchedDirectoryAdd { path, .. } => {
            state.watched_directories.entry(path.clone()).or_default();
        }
        StateMutation::WatchedDirectoryRemove { path, .. } => {
            state.watched_directories.remove(path);
        }
        StateMutation::DirectoryEntriesUpdate { path, entries, updated_at, .. } => {
            state.watched_directories.insert(
                path.clone(),
                DirectoryEntries { entries: entries.clone(), error: None, updated_at: *updated_at },
            );
        }
        StateMutation::FileWatcherStatsUpdate { stats, .. } => {
            state.file_watcher_stats = Some(stats.clone());
        }
        StateMutation::DirectoryWatchError { path, error, .. } => {
            state.watched_directories.entry(path.clone()).or_default().error = Some(error.clone());
        }
    }

    Ok(())
}

/// Apply `mutation` and stamp the resulting state with `version`.
///
/// The daemon, startup recovery and clients replaying deltas all go through
/// this, so replaying versions `1..=N` reproduces the live state exactly.
pub fn apply_versioned(
    workspace: &mut Option<WorkspaceState>,
    mutation: &StateMutation,
    version: u64,
) -> Result<(), MutationError> {
    apply_mutation(workspace, mutation)?;
    if let Some(state) = workspace.as_mut() {
        state.version = version;
    }
    Ok(())
}

fn slot_mut<'a>(
    state: &'a mut WorkspaceState,
    workspace_id: &str,
    slot_id: &str,
) -> Result<&'a mut SlotState, MutationError> {
    state.slots.get_mut(slot_id).ok_or_else(|| unknown_slot(workspace_id, slot_id))
}

fn unknown_slot(workspace_id: &str, slot_id: &str) -> MutationError {
    MutationError::UnknownSlot { workspace_id: workspace_id.to_string(), slot_id: slot_id.to_string() }
}
