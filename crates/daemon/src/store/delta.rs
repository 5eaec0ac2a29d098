use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use slotsync_common::mutation::StateMutation;

use super::{format_timestamp, parse_timestamp, version_from_sql, version_to_sql, PersistenceStore};

/// One persisted mutation. `base_version` is always `version - 1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaRecord {
    pub workspace_id: String,
    pub version: u64,
    pub base_version: u64,
    /// JSON-encoded [`StateMutation`].
    pub changes: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

impl DeltaRecord {
    pub fn new(
        workspace_id: impl Into<String>,
        version: u64,
        mutation: &StateMutation,
        timestamp: DateTime<Utc>,
    ) -> Result<Self> {
        let changes = serde_json::to_vec(mutation).context("failed to encode delta mutation")?;
        Ok(Self {
            workspace_id: workspace_id.into(),
            version,
            base_version: version.saturating_sub(1),
            changes,
            timestamp,
        })
    }

    pub fn decode_changes(&self) -> Result<StateMutation> {
        serde_json::from_slice(&self.changes).with_context(|| {
            format!("failed to decode delta v{} for workspace {}", self.version, self.workspace_id)
        })
    }
}

impl PersistenceStore {
    /// Upsert by `(workspace_id, version)`; retrying the same write never duplicates.
    pub fn store_delta(&self, delta: &DeltaRecord) -> Result<()> {
        self.with_conn(|conn| insert_delta(conn, delta))
    }

    /// Deltas with `version > since_version`, ascending.
    pub fn deltas_since(&self, workspace_id: &str, since_version: u64) -> Result<Vec<DeltaRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT workspace_id, version, base_version, changes, timestamp
                     FROM deltas
                     WHERE workspace_id = ?1 AND version > ?2
                     ORDER BY version ASC",
                )
                .context("failed to prepare deltas_since query")?;
            let rows = stmt
                .query_map(params![workspace_id, version_to_sql(since_version)?], row_to_delta)
                .context("failed to query deltas")?;
            rows.collect::<std::result::Result<Vec<_>, _>>().context("failed to collect deltas")
        })
    }
}

pub(crate) fn insert_delta(conn: &Connection, delta: &DeltaRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO deltas (workspace_id, version, base_version, changes, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (workspace_id, version) DO UPDATE SET
             base_version = excluded.base_version,
             changes = excluded.changes,
             timestamp = excluded.timestamp",
        params![
            delta.workspace_id,
            version_to_sql(delta.version)?,
            version_to_sql(delta.base_version)?,
            delta.changes,
            format_timestamp(delta.timestamp),
        ],
    )
    .with_context(|| {
        format!("failed to store delta v{} for workspace {}", delta.version, delta.workspace_id)
    })?;
    Ok(())
}

fn row_to_delta(row: &rusqlite::Row<'_>) -> rusqlite::Result<DeltaRecord> {
    let timestamp: String = row.get(4)?;
    Ok(DeltaRecord {
        workspace_id: row.get(0)?,
        version: version_from_sql(row.get(1)?),
        base_version: version_from_sql(row.get(2)?),
        changes: row.get(3)?,
        timestamp: parse_timestamp(&timestamp),
    })
}
