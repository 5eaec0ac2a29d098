use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use slotsync_common::mutation::apply_versioned;
use slotsync_common::types::WorkspaceState;
use tracing::warn;

use super::PersistenceStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupRecoveryReport {
    pub recovered_workspaces: usize,
    pub replayed_deltas: usize,
    pub degraded_workspaces: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RecoveredWorkspace {
    pub workspace_id: String,
    pub version: u64,
    /// `None` when the last replayed delta closed the workspace.
    pub state: Option<WorkspaceState>,
    pub snapshot_version: u64,
    pub snapshot_at: Option<DateTime<Utc>>,
    pub replayed_deltas: usize,
    /// Replay stopped early at a broken link in the delta chain.
    pub degraded: bool,
}

/// Recover every persisted workspace.
pub fn recover_workspaces(
    store: &PersistenceStore,
) -> Result<(Vec<RecoveredWorkspace>, StartupRecoveryReport)> {
    let mut recovered = Vec::new();
    let mut degraded_workspaces = Vec::new();
    let mut replayed_deltas = 0;
    for workspace_id in store.workspace_ids()? {
        let workspace = recover_workspace(store, &workspace_id)
            .with_context(|| format!("failed to recover workspace {workspace_id}"))?;
        if workspace.degraded {
            degraded_workspaces.push(workspace_id);
        }
        replayed_deltas += workspace.replayed_deltas;
        recovered.push(workspace);
    }

    let report = StartupRecoveryReport {
        recovered_workspaces: recovered.len(),
        replayed_deltas,
        degraded_workspaces,
    };
    Ok((recovered, report))
}

/// Recover a single workspace from its latest snapshot plus later deltas.
///
/// Recovery order:
/// 1) Load the newest snapshot (if any).
/// 2) Replay deltas strictly after the snapshot version, in order.
/// 3) Stop at the first broken link in the chain and mark the workspace degraded.
pub fn recover_workspace(store: &PersistenceStore, workspace_id: &str) -> Result<RecoveredWorkspace> {
    let (mut state, snapshot_version, snapshot_at) = match store.latest_snapshot(workspace_id)? {
        Some(snapshot) => (Some(snapshot.decode_state()?), snapshot.version, Some(snapshot.timestamp)),
        None => (None, 0, None),
    };

    let mut version = snapshot_version;
    let mut replayed_deltas = 0;
    let mut degraded = false;
    for delta in store.deltas_since(workspace_id, snapshot_version)? {
        if delta.version != version + 1 || delta.base_version != version {
            warn!(
                workspace_id,
                expected = version + 1,
                found = delta.version,
                base_version = delta.base_version,
                "delta chain gap"
            );
            degraded = true;
            break;
        }
        let mutation = match delta.decode_changes() {
            Ok(mutation) => mutation,
            Err(error) => {
                warn!(workspace_id, version = delta.version, error = %error, "undecodable delta");
                degraded = true;
                break;
            }
        };
        if let Err(error) = apply_versioned(&mut state, &mutation, delta.version) {
            warn!(workspace_id, version = delta.version, error = %error, "delta failed to replay");
            degraded = true;
            break;
        }
        version = delta.version;
        replayed_deltas += 1;
    }

    Ok(RecoveredWorkspace {
        workspace_id: workspace_id.to_string(),
        version,
        state,
        snapshot_version,
        snapshot_at,
        replayed_deltas,
        degraded,
    })
}
