// Authoritative in-memory workspace state with a gap-free version per workspace.
//
// Every accepted mutation becomes exactly one version: it is applied to a copy
// of the committed state, persisted, and only then made visible. Listeners are
// notified in version order while the workspace's writer lock is held.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use chrono::{DateTime, Utc};
use slotsync_common::mutation::{apply_versioned, MutationError, StateMutation};
use slotsync_common::types::WorkspaceState;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::store::recovery::{recover_workspaces, StartupRecoveryReport};
use crate::store::{
    ClientRecord, DeltaRecord, PersistenceStore, SnapshotPolicy, SnapshotRecord, VacuumPolicy,
    VacuumReport,
};

#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("unknown workspace: {0}")]
    UnknownWorkspace(String),

    #[error("mutation targets workspace `{found}` but was submitted for `{expected}`")]
    WorkspaceMismatch { expected: String, found: String },

    #[error("mutation rejected: {0}")]
    Rejected(#[from] MutationError),

    #[error("persistence failure: {0:#}")]
    Persistence(#[from] anyhow::Error),
}

/// One committed version, as seen by listeners.
#[derive(Debug, Clone)]
pub struct StateChange {
    pub workspace_id: String,
    pub version: u64,
    pub mutation: StateMutation,
    /// State after the mutation; `None` once the workspace is closed.
    pub state: Option<Arc<WorkspaceState>>,
}

pub trait StateChangeListener: Send + Sync {
    fn state_changed(&self, change: &StateChange);
}

/// Where producers hand their mutations. Returns the assigned version.
pub trait MutationSink: Send + Sync {
    fn submit(&self, mutation: StateMutation) -> Result<u64, StateStoreError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeltaRange {
    /// Contiguous mutations `since + 1 ..= current`, ascending.
    Available(Vec<StateMutation>),
    /// Part of the range was removed by retention; the caller needs a snapshot.
    Unavailable,
}

#[derive(Default)]
struct Committed {
    version: u64,
    state: Option<Arc<WorkspaceState>>,
}

struct SnapshotMark {
    version: u64,
    at: DateTime<Utc>,
}

struct WorkspaceEntry {
    /// Single writer per workspace; also owns the snapshot bookkeeping.
    writer: Mutex<SnapshotMark>,
    committed: RwLock<Committed>,
}

impl WorkspaceEntry {
    fn new(version: u64, state: Option<WorkspaceState>, mark: SnapshotMark) -> Self {
        Self {
            writer: Mutex::new(mark),
            committed: RwLock::new(Committed { version, state: state.map(Arc::new) }),
        }
    }
}

pub struct VersionedStateStore {
    persistence: Arc<PersistenceStore>,
    snapshot_policy: SnapshotPolicy,
    workspaces: RwLock<HashMap<String, Arc<WorkspaceEntry>>>,
    listeners: RwLock<Vec<Weak<dyn StateChangeListener>>>,
}

impl VersionedStateStore {
    pub fn new(persistence: Arc<PersistenceStore>, snapshot_policy: SnapshotPolicy) -> Self {
        Self {
            persistence,
            snapshot_policy,
            workspaces: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Build the store from whatever `persistence` holds: latest snapshot plus
    /// replayed deltas for every workspace.
    pub fn recover(
        persistence: Arc<PersistenceStore>,
        snapshot_policy: SnapshotPolicy,
    ) -> anyhow::Result<(Self, StartupRecoveryReport)> {
        let (recovered, report) = recover_workspaces(&persistence)?;
        let store = Self::new(persistence, snapshot_policy);
        {
            let mut workspaces = write(&store.workspaces);
            for workspace in recovered {
                if workspace.degraded {
                    warn!(
                        workspace_id = %workspace.workspace_id,
                        version = workspace.version,
                        "workspace recovered up to a broken delta chain"
                    );
                }
                let mark = SnapshotMark {
                    version: workspace.snapshot_version,
                    at: workspace.snapshot_at.unwrap_or_else(Utc::now),
                };
                workspaces.insert(
                    workspace.workspace_id,
                    Arc::new(WorkspaceEntry::new(workspace.version, workspace.state, mark)),
                );
            }
        }
        info!(
            recovered_workspaces = report.recovered_workspaces,
            replayed_deltas = report.replayed_deltas,
            "state store recovered"
        );
        Ok((store, report))
    }

    pub fn persistence(&self) -> &Arc<PersistenceStore> {
        &self.persistence
    }

    /// Apply `mutation` as the next version of `workspace_id`.
    ///
    /// On any error the committed state and version are unchanged and no
    /// listener is notified.
    pub fn mutate(&self, workspace_id: &str, mutation: StateMutation) -> Result<u64, StateStoreError> {
        if mutation.workspace_id() != workspace_id {
            return Err(StateStoreError::WorkspaceMismatch {
                expected: workspace_id.to_string(),
                found: mutation.workspace_id().to_string(),
            });
        }

        let entry = match self.entry(workspace_id) {
            Some(entry) => entry,
            None if matches!(mutation, StateMutation::WorkspaceCreate { .. }) => {
                self.entry_or_insert(workspace_id)
            }
            None => return Err(MutationError::UnknownWorkspace(workspace_id.to_string()).into()),
        };

        let mut mark = lock(&entry.writer);
        let (version, mut next) = {
            let committed = read(&entry.committed);
            (committed.version, committed.state.as_deref().cloned())
        };
        let next_version = version + 1;
        apply_versioned(&mut next, &mutation, next_version)?;

        let now = Utc::now();
        let delta = DeltaRecord::new(workspace_id, next_version, &mutation, now)?;
        let snapshot = match &next {
            Some(state)
                if self.snapshot_policy.should_snapshot(mark.version, next_version, mark.at, now) =>
            {
                Some(SnapshotRecord::new(state, now)?)
            }
            _ => None,
        };
        self.persistence.commit_mutation(&delta, snapshot.as_ref())?;
        if snapshot.is_some() {
            *mark = SnapshotMark { version: next_version, at: now };
        }

        let next = next.map(Arc::new);
        {
            let mut committed = write(&entry.committed);
            committed.version = next_version;
            committed.state = next.clone();
        }
        debug!(
            workspace_id,
            version = next_version,
            kind = mutation.kind(),
            snapshot = snapshot.is_some(),
            "mutation committed"
        );

        self.notify(&StateChange {
            workspace_id: workspace_id.to_string(),
            version: next_version,
            mutation,
            state: next,
        });
        drop(mark);
        Ok(next_version)
    }

    /// Point-in-time state; `None` when the workspace is unknown or closed.
    pub fn get_workspace_state(&self, workspace_id: &str) -> Option<Arc<WorkspaceState>> {
        let entry = self.entry(workspace_id)?;
        let committed = read(&entry.committed);
        committed.state.clone()
    }

    /// Latest committed version, 0 for a workspace that was never mutated.
    pub fn current_version(&self, workspace_id: &str) -> u64 {
        self.entry(workspace_id).map(|entry| read(&entry.committed).version).unwrap_or(0)
    }

    /// Committed version and state read together.
    pub fn versioned_state(&self, workspace_id: &str) -> (u64, Option<Arc<WorkspaceState>>) {
        match self.entry(workspace_id) {
            Some(entry) => {
                let committed = read(&entry.committed);
                (committed.version, committed.state.clone())
            }
            None => (0, None),
        }
    }

    /// Mutations with `version > since_version` up to the current version.
    pub fn get_delta_since(
        &self,
        workspace_id: &str,
        since_version: u64,
    ) -> Result<DeltaRange, StateStoreError> {
        self.get_delta_between(workspace_id, since_version, self.current_version(workspace_id))
    }

    /// Mutations `since_version + 1 ..= until`. Callers pair this with a
    /// version read from [`Self::versioned_state`] to get a consistent view.
    pub fn get_delta_between(
        &self,
        workspace_id: &str,
        since_version: u64,
        until: u64,
    ) -> Result<DeltaRange, StateStoreError> {
        let current = until.min(self.current_version(workspace_id));
        if since_version >= current {
            return Ok(DeltaRange::Available(Vec::new()));
        }

        let records = self.persistence.deltas_since(workspace_id, since_version)?;
        let mut expected = since_version + 1;
        let mut mutations = Vec::new();
        for record in records.into_iter().take_while(|record| record.version <= current) {
            if record.version != expected {
                debug!(workspace_id, expected, found = record.version, "delta range has a hole");
                return Ok(DeltaRange::Unavailable);
            }
            mutations.push(record.decode_changes()?);
            expected += 1;
        }
        if expected != current + 1 {
            return Ok(DeltaRange::Unavailable);
        }
        Ok(DeltaRange::Available(mutations))
    }

    /// Write a snapshot at the current version regardless of policy.
    pub fn snapshot_now(&self, workspace_id: &str) -> Result<u64, StateStoreError> {
        let entry = self
            .entry(workspace_id)
            .ok_or_else(|| StateStoreError::UnknownWorkspace(workspace_id.to_string()))?;
        let mut mark = lock(&entry.writer);
        let (version, state) = {
            let committed = read(&entry.committed);
            (committed.version, committed.state.clone())
        };
        let state = state.ok_or_else(|| StateStoreError::UnknownWorkspace(workspace_id.to_string()))?;

        let now = Utc::now();
        self.persistence.store_snapshot(&SnapshotRecord::new(&state, now)?)?;
        *mark = SnapshotMark { version, at: now };
        debug!(workspace_id, version, "snapshot written");
        Ok(version)
    }

    /// Open workspaces, sorted.
    pub fn workspace_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = read(&self.workspaces)
            .iter()
            .filter(|(_, entry)| read(&entry.committed).state.is_some())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn register_client(
        &self,
        client_id: &str,
        workspace_id: &str,
    ) -> Result<ClientRecord, StateStoreError> {
        Ok(self.persistence.register_client(client_id, workspace_id, Utc::now())?)
    }

    /// Record that `client_id` has applied everything up to `version`.
    ///
    /// Acks beyond the current version are clamped; stale acks are a no-op.
    /// Returns whether the recorded ack advanced.
    pub fn client_ack(&self, client_id: &str, version: u64) -> Result<bool, StateStoreError> {
        let Some(client) = self.persistence.get_client(client_id)? else {
            return Ok(false);
        };
        let clamped = version.min(self.current_version(&client.workspace_id));
        Ok(self.persistence.update_client_ack(client_id, clamped, Utc::now())?)
    }

    pub fn remove_client(&self, client_id: &str) -> Result<bool, StateStoreError> {
        Ok(self.persistence.remove_client(client_id)?)
    }

    pub fn client_record(&self, client_id: &str) -> Result<Option<ClientRecord>, StateStoreError> {
        Ok(self.persistence.get_client(client_id)?)
    }

    /// Subscribe to committed versions. The store keeps only a weak
    /// reference; dropping the listener unsubscribes it.
    pub fn on_state_changed(&self, listener: Weak<dyn StateChangeListener>) {
        write(&self.listeners).push(listener);
    }

    /// Snapshot every open workspace whose latest snapshot is behind, then
    /// apply the retention policy to persistence.
    pub fn vacuum(&self, policy: &VacuumPolicy) -> Result<VacuumReport, StateStoreError> {
        let entries: Vec<(String, Arc<WorkspaceEntry>)> = read(&self.workspaces)
            .iter()
            .map(|(id, entry)| (id.clone(), Arc::clone(entry)))
            .collect();
        for (workspace_id, entry) in entries {
            let behind = {
                let mark = lock(&entry.writer);
                let committed = read(&entry.committed);
                committed.state.is_some() && committed.version > mark.version
            };
            if behind {
                self.snapshot_now(&workspace_id)?;
            }
        }
        Ok(self.persistence.vacuum(policy, Utc::now())?)
    }

    fn entry(&self, workspace_id: &str) -> Option<Arc<WorkspaceEntry>> {
        read(&self.workspaces).get(workspace_id).cloned()
    }

    fn entry_or_insert(&self, workspace_id: &str) -> Arc<WorkspaceEntry> {
        let mut workspaces = write(&self.workspaces);
        let entry = workspaces.entry(workspace_id.to_string()).or_insert_with(|| {
            Arc::new(WorkspaceEntry::new(0, None, SnapshotMark { version: 0, at: Utc::now() }))
        });
        Arc::clone(entry)
    }

    fn notify(&self, change: &StateChange) {
        let listeners: Vec<Arc<dyn StateChangeListener>> =
            read(&self.listeners).iter().filter_map(Weak::upgrade).collect();
        if listeners.len() != read(&self.listeners).len() {
            write(&self.listeners).retain(|listener| listener.strong_count() > 0);
        }
        for listener in listeners {
            listener.state_changed(change);
        }
    }
}

impl MutationSink for VersionedStateStore {
    fn submit(&self, mutation: StateMutation) -> Result<u64, StateStoreError> {
        let workspace_id = mutation.workspace_id().to_string();
        self.mutate(&workspace_id, mutation)
    }
}

// Committed state is only ever replaced whole, so a poisoned lock still
// guards a consistent value.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(std::sync::PoisonError::into_inner)
}
