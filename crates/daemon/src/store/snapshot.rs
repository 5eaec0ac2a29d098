use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use slotsync_common::types::WorkspaceState;

use super::{format_timestamp, parse_timestamp, version_from_sql, version_to_sql, PersistenceStore};

pub const SNAPSHOT_INTERVAL_MUTATIONS: u64 = 100;
pub const SNAPSHOT_INTERVAL_MINUTES: u64 = 10;

/// Full workspace state at exactly `version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRecord {
    pub workspace_id: String,
    pub version: u64,
    /// JSON-encoded [`WorkspaceState`].
    pub state: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

impl SnapshotRecord {
    pub fn new(state: &WorkspaceState, timestamp: DateTime<Utc>) -> Result<Self> {
        let encoded = serde_json::to_vec(state).context("failed to encode workspace snapshot")?;
        Ok(Self {
            workspace_id: state.id.clone(),
            version: state.version,
            state: encoded,
            timestamp,
        })
    }

    pub fn decode_state(&self) -> Result<WorkspaceState> {
        serde_json::from_slice(&self.state).with_context(|| {
            format!(
                "failed to decode snapshot v{} for workspace {}",
                self.version, self.workspace_id
            )
        })
    }
}

/// When to write a full snapshot alongside a delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotPolicy {
    /// Snapshot after this many versions since the last one (0 disables).
    pub interval_mutations: u64,
    pub interval: Duration,
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self {
            interval_mutations: SNAPSHOT_INTERVAL_MUTATIONS,
            interval: Duration::from_secs(SNAPSHOT_INTERVAL_MINUTES * 60),
        }
    }
}

impl SnapshotPolicy {
    pub fn should_snapshot(
        &self,
        last_snapshot_version: u64,
        current_version: u64,
        last_snapshot_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> bool {
        if current_version <= last_snapshot_version {
            return false;
        }

        let since_snapshot = current_version - last_snapshot_version;
        if self.interval_mutations > 0 && since_snapshot >= self.interval_mutations {
            return true;
        }

        let Ok(interval) = ChronoDuration::from_std(self.interval) else {
            return false;
        };
        if interval <= ChronoDuration::zero() {
            return false;
        }

        now.signed_duration_since(last_snapshot_at) >= interval
    }
}

impl PersistenceStore {
    /// Upsert by `(workspace_id, version)`.
    pub fn store_snapshot(&self, snapshot: &SnapshotRecord) -> Result<()> {
        self.with_conn(|conn| insert_snapshot(conn, snapshot))
    }

    pub fn latest_snapshot(&self, workspace_id: &str) -> Result<Option<SnapshotRecord>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT workspace_id, version, state, timestamp
                 FROM snapshots
                 WHERE workspace_id = ?1
                 ORDER BY version DESC
                 LIMIT 1",
                params![workspace_id],
                row_to_snapshot,
            )
            .optional()
            .context("failed to query latest snapshot")
        })
    }

    pub fn snapshot_at_version(
        &self,
        workspace_id: &str,
        version: u64,
    ) -> Result<Option<SnapshotRecord>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT workspace_id, version, state, timestamp
                 FROM snapshots
                 WHERE workspace_id = ?1 AND version = ?2",
                params![workspace_id, version_to_sql(version)?],
                row_to_snapshot,
            )
            .optional()
            .context("failed to query snapshot at version")
        })
    }

    pub fn snapshot_count(&self, workspace_id: &str) -> Result<u64> {
        self.with_conn(|conn| {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM snapshots WHERE workspace_id = ?1",
                    params![workspace_id],
                    |row| row.get(0),
                )
                .context("failed to count snapshots")?;
            Ok(version_from_sql(count))
        })
    }
}

pub(crate) fn insert_snapshot(conn: &Connection, snapshot: &SnapshotRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO snapshots (workspace_id, version, state, timestamp)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (workspace_id, version) DO UPDATE SET
             state = excluded.state,
             timestamp = excluded.timestamp",
        params![
            snapshot.workspace_id,
            version_to_sql(snapshot.version)?,
            snapshot.state,
            format_timestamp(snapshot.timestamp),
        ],
    )
    .with_context(|| {
        format!(
            "failed to store snapshot v{} for workspace {}",
            snapshot.version, snapshot.workspace_id
        )
    })?;
    Ok(())
}

fn row_to_snapshot(row: &rusqlite::Row<'_>) -> rusqlite::Result<SnapshotRecord> {
    let timestamp: String = row.get(3)?;
    Ok(SnapshotRecord {
        workspace_id: row.get(0)?,
        version: version_from_sql(row.get(1)?),
        state: row.get(2)?,
        timestamp: parse_timestamp(&timestamp),
    })
}
