// Per-client catch-up and live fan-out of committed versions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

use chrono::Utc;
use slotsync_common::mutation::StateMutation;
use slotsync_common::protocol::ws::{ClientMessage, ServerMessage};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::{
    DeltaRange, StateChange, StateChangeListener, StateStoreError, VersionedStateStore,
};

/// Largest version gap still served as deltas; anything wider gets a snapshot.
pub const GAP_THRESHOLD: u64 = 50;

pub const ERROR_REJECTED: &str = "rejected";
pub const ERROR_WORKSPACE_MISMATCH: &str = "workspace_mismatch";
pub const ERROR_UNKNOWN_WORKSPACE: &str = "unknown_workspace";
pub const ERROR_PERSISTENCE: &str = "persistence_error";

/// The receiving half of one registered connection.
#[derive(Debug)]
pub struct ClientSession {
    pub client_id: String,
    pub workspace_id: String,
    connection_id: u64,
    pub outbound: mpsc::UnboundedReceiver<ServerMessage>,
}

impl ClientSession {
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct ClientCursor {
    /// `None` until a snapshot or delta has been sent.
    last_sent: Option<u64>,
    last_ack: u64,
}

#[derive(Debug)]
struct ClientHandle {
    client_id: String,
    workspace_id: String,
    connection_id: u64,
    outbound: mpsc::UnboundedSender<ServerMessage>,
    cursor: Mutex<ClientCursor>,
}

impl ClientHandle {
    fn send(&self, message: ServerMessage) -> bool {
        self.outbound.send(message).is_ok()
    }
}

#[derive(Default)]
struct Registry {
    by_workspace: HashMap<String, HashMap<String, Arc<ClientHandle>>>,
    workspace_of: HashMap<String, String>,
}

impl Registry {
    fn insert(&mut self, handle: Arc<ClientHandle>) -> Option<Arc<ClientHandle>> {
        let previous = self.remove(&handle.client_id);
        self.workspace_of.insert(handle.client_id.clone(), handle.workspace_id.clone());
        self.by_workspace
            .entry(handle.workspace_id.clone())
            .or_default()
            .insert(handle.client_id.clone(), handle);
        previous
    }

    fn remove(&mut self, client_id: &str) -> Option<Arc<ClientHandle>> {
        let workspace_id = self.workspace_of.remove(client_id)?;
        let clients = self.by_workspace.get_mut(&workspace_id)?;
        let removed = clients.remove(client_id);
        if clients.is_empty() {
            self.by_workspace.remove(&workspace_id);
        }
        removed
    }

    fn get(&self, client_id: &str) -> Option<Arc<ClientHandle>> {
        let workspace_id = self.workspace_of.get(client_id)?;
        self.by_workspace.get(workspace_id)?.get(client_id).cloned()
    }
}

/// Fans committed versions out to connected clients and answers their
/// `sync`, `mutate` and `ack` requests.
pub struct SyncCoordinator {
    store: Arc<VersionedStateStore>,
    gap_threshold: u64,
    registry: RwLock<Registry>,
    next_connection_id: AtomicU64,
}

impl SyncCoordinator {
    /// Create a coordinator and subscribe it to `store`.
    pub fn new(store: Arc<VersionedStateStore>, gap_threshold: u64) -> Arc<Self> {
        let coordinator = Arc::new(Self {
            store: Arc::clone(&store),
            gap_threshold,
            registry: RwLock::new(Registry::default()),
            next_connection_id: AtomicU64::new(1),
        });
        let listener: Weak<Self> = Arc::downgrade(&coordinator);
        store.on_state_changed(listener);
        coordinator
    }

    pub fn store(&self) -> &Arc<VersionedStateStore> {
        &self.store
    }

    /// Attach a connection to `workspace_id`. A `requested_id` resumes a
    /// previously registered client (and replaces any live connection using
    /// it); otherwise a fresh id is allocated.
    pub fn register_client(
        &self,
        workspace_id: &str,
        requested_id: Option<&str>,
    ) -> Result<ClientSession, StateStoreError> {
        let client_id = requested_id
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let record = self.store.register_client(&client_id, workspace_id)?;

        let (outbound, receiver) = mpsc::unbounded_channel();
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let handle = Arc::new(ClientHandle {
            client_id: client_id.clone(),
            workspace_id: workspace_id.to_string(),
            connection_id,
            outbound,
            cursor: Mutex::new(ClientCursor { last_sent: None, last_ack: record.last_ack_version }),
        });
        if let Some(previous) = write(&self.registry).insert(handle) {
            debug!(client_id = %previous.client_id, "replaced live connection for resumed client");
        }
        info!(client_id = %client_id, workspace_id, last_ack = record.last_ack_version, "client registered");

        Ok(ClientSession {
            client_id,
            workspace_id: workspace_id.to_string(),
            connection_id,
            outbound: receiver,
        })
    }

    /// Detach a connection. The persisted client record is kept so the same
    /// id can resume later.
    pub fn unregister_client(&self, session: &ClientSession) {
        self.unregister_connection(&session.client_id, session.connection_id);
        if let Err(error) = self.store.persistence().touch_client(&session.client_id, Utc::now()) {
            warn!(client_id = %session.client_id, error = %error, "failed to record client last-seen time");
        }
    }

    /// Detach and delete the persisted client record.
    pub fn forget_client(&self, client_id: &str) -> Result<bool, StateStoreError> {
        write(&self.registry).remove(client_id);
        self.store.remove_client(client_id)
    }

    /// Connected client ids for `workspace_id`, sorted.
    pub fn connected_clients(&self, workspace_id: &str) -> Vec<String> {
        let registry = read(&self.registry);
        let mut ids: Vec<String> = registry
            .by_workspace
            .get(workspace_id)
            .map(|clients| clients.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub fn handle_message(
        &self,
        client_id: &str,
        message: ClientMessage,
    ) -> Result<(), StateStoreError> {
        let Some(handle) = read(&self.registry).get(client_id) else {
            debug!(client_id, "message from unregistered client dropped");
            return Ok(());
        };

        match message {
            ClientMessage::Sync { since_version } => self.initial_sync(&handle, since_version),
            ClientMessage::Mutate { mutation } => {
                self.client_mutation(&handle, mutation);
                Ok(())
            }
            ClientMessage::Ack { version } => {
                self.store.client_ack(client_id, version)?;
                let clamped = version.min(self.store.current_version(&handle.workspace_id));
                let mut cursor = lock(&handle.cursor);
                cursor.last_ack = cursor.last_ack.max(clamped);
                Ok(())
            }
        }
    }

    /// Bring a client from `since_version` to the current version, either as
    /// one contiguous delta or as a full snapshot.
    pub fn send_initial_sync(
        &self,
        client_id: &str,
        since_version: Option<u64>,
    ) -> Result<(), StateStoreError> {
        let handle = read(&self.registry).get(client_id);
        match handle {
            Some(handle) => self.initial_sync(&handle, since_version),
            None => Ok(()),
        }
    }

    fn initial_sync(
        &self,
        handle: &ClientHandle,
        since_version: Option<u64>,
    ) -> Result<(), StateStoreError> {
        // Held across the read so a concurrent broadcast cannot interleave.
        let mut cursor = lock(&handle.cursor);
        let forced = self.store.persistence().take_force_snapshot(&handle.client_id)?;
        let (version, message) = self.catch_up(&handle.workspace_id, since_version, forced)?;

        debug!(
            client_id = %handle.client_id,
            workspace_id = %handle.workspace_id,
            since_version,
            version,
            snapshot = matches!(message, ServerMessage::Snapshot { .. }),
            "initial sync"
        );
        if !handle.send(message) {
            drop(cursor);
            self.unregister_connection(&handle.client_id, handle.connection_id);
            return Ok(());
        }

        cursor.last_sent = Some(version);
        cursor.last_ack = cursor.last_ack.max(version);
        self.store.client_ack(&handle.client_id, version)?;
        Ok(())
    }

    fn client_mutation(&self, handle: &ClientHandle, mutation: StateMutation) {
        let kind = mutation.kind();
        let (code, error) = match self.store.mutate(&handle.workspace_id, mutation) {
            Ok(version) => {
                debug!(client_id = %handle.client_id, kind, version, "client mutation committed");
                return;
            }
            Err(error @ StateStoreError::Rejected(_)) => (ERROR_REJECTED, error),
            Err(error @ StateStoreError::WorkspaceMismatch { .. }) => (ERROR_WORKSPACE_MISMATCH, error),
            Err(error @ StateStoreError::UnknownWorkspace(_)) => (ERROR_UNKNOWN_WORKSPACE, error),
            Err(error @ StateStoreError::Persistence(_)) => {
                warn!(client_id = %handle.client_id, kind, error = %error, "client mutation not persisted");
                (ERROR_PERSISTENCE, error)
            }
        };
        debug!(client_id = %handle.client_id, kind, code, "client mutation rejected");
        handle.send(ServerMessage::error(code, error.to_string()));
    }

    /// The catch-up message for a client at `since_version`, and the version it
    /// brings the client to.
    fn catch_up(
        &self,
        workspace_id: &str,
        since_version: Option<u64>,
        forced: bool,
    ) -> Result<(u64, ServerMessage), StateStoreError> {
        let (current, state) = self.store.versioned_state(workspace_id);

        let deltas = match since_version {
            Some(since) if !forced && since <= current && current - since <= self.gap_threshold => {
                match self.store.get_delta_between(workspace_id, since, current)? {
                    DeltaRange::Available(deltas) => Some((since, deltas)),
                    DeltaRange::Unavailable => None,
                }
            }
            _ => None,
        };

        let message = match (deltas, state) {
            (Some((since, deltas)), _) => {
                ServerMessage::Delta { version: current, since_version: Some(since), deltas }
            }
            (None, Some(state)) => ServerMessage::Snapshot { version: current, state: (*state).clone() },
            (None, None) => ServerMessage::error(
                ERROR_UNKNOWN_WORKSPACE,
                format!("workspace {workspace_id} is not open at version {current}"),
            ),
        };
        Ok((current, message))
    }

    fn broadcast_to(&self, handle: &ClientHandle, change: &StateChange) -> Result<bool, StateStoreError> {
        let mut cursor = lock(&handle.cursor);
        if cursor.last_ack >= change.version {
            return Ok(true);
        }
        let message = match cursor.last_sent {
            // Registered but never synced: bring it up to date in full.
            None => self.catch_up(&change.workspace_id, None, false)?.1,
            Some(sent) if sent >= change.version => return Ok(true),
            Some(sent) if sent + 1 == change.version => {
                ServerMessage::single_delta(change.version, change.mutation.clone())
            }
            Some(sent) => self.catch_up(&change.workspace_id, Some(sent), false)?.1,
        };
        if !handle.send(message) {
            return Ok(false);
        }
        cursor.last_sent = Some(change.version);
        Ok(true)
    }

    fn unregister_connection(&self, client_id: &str, connection_id: u64) {
        let mut registry = write(&self.registry);
        let current = registry.get(client_id);
        if current.is_some_and(|handle| handle.connection_id == connection_id) {
            registry.remove(client_id);
            info!(client_id, "client unregistered");
        }
    }
}

impl StateChangeListener for SyncCoordinator {
    fn state_changed(&self, change: &StateChange) {
        let handles: Vec<Arc<ClientHandle>> = read(&self.registry)
            .by_workspace
            .get(&change.workspace_id)
            .map(|clients| clients.values().cloned().collect())
            .unwrap_or_default();

        for handle in handles {
            match self.broadcast_to(&handle, change) {
                Ok(true) => {}
                Ok(false) => self.unregister_connection(&handle.client_id, handle.connection_id),
                Err(error) => {
                    warn!(
                        client_id = %handle.client_id,
                        version = change.version,
                        error = %error,
                        "failed to build catch-up for client"
                    );
                    self.unregister_connection(&handle.client_id, handle.connection_id);
                }
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(std::sync::PoisonError::into_inner)
}
