// Client registry: who has acknowledged which version of which workspace.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use super::{format_timestamp, parse_timestamp, version_from_sql, version_to_sql, PersistenceStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRecord {
    pub client_id: String,
    pub workspace_id: String,
    pub last_ack_version: u64,
    pub connected_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    /// Set by vacuum when the deltas this client needs were deleted.
    pub force_snapshot: bool,
}

impl PersistenceStore {
    /// Upsert by `client_id`. Re-registering for the same workspace keeps the
    /// recorded ack; moving to another workspace resets it.
    pub fn register_client(
        &self,
        client_id: &str,
        workspace_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ClientRecord> {
        self.with_conn(|conn| {
            let now_str = format_timestamp(now);
            conn.execute(
                "INSERT INTO clients
                    (client_id, workspace_id, last_ack_version, connected_at, last_seen_at)
                 VALUES (?1, ?2, 0, ?3, ?3)
                 ON CONFLICT (client_id) DO UPDATE SET
                    last_ack_version = CASE
                        WHEN clients.workspace_id = excluded.workspace_id
                        THEN clients.last_ack_version ELSE 0 END,
                    force_snapshot = CASE
                        WHEN clients.workspace_id = excluded.workspace_id
                        THEN clients.force_snapshot ELSE 0 END,
                    workspace_id = excluded.workspace_id,
                    connected_at = excluded.connected_at,
                    last_seen_at = excluded.last_seen_at",
                params![client_id, workspace_id, now_str],
            )
            .with_context(|| format!("failed to register client {client_id}"))?;

            conn.query_row(
                "SELECT client_id, workspace_id, last_ack_version, connected_at, last_seen_at,
                        force_snapshot
                 FROM clients WHERE client_id = ?1",
                params![client_id],
                row_to_client,
            )
            .with_context(|| format!("failed to read back client {client_id}"))
        })
    }

    /// Advance the recorded ack. Returns `false` (and only refreshes
    /// `last_seen_at`) when `version` is not newer than what is recorded.
    pub fn update_client_ack(
        &self,
        client_id: &str,
        version: u64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            let now_str = format_timestamp(now);
            let advanced = conn
                .execute(
                    "UPDATE clients SET last_ack_version = ?2, last_seen_at = ?3
                     WHERE client_id = ?1 AND last_ack_version < ?2",
                    params![client_id, version_to_sql(version)?, now_str],
                )
                .with_context(|| format!("failed to update ack for client {client_id}"))?;
            if advanced == 0 {
                conn.execute(
                    "UPDATE clients SET last_seen_at = ?2 WHERE client_id = ?1",
                    params![client_id, now_str],
                )
                .with_context(|| format!("failed to touch client {client_id}"))?;
            }
            Ok(advanced > 0)
        })
    }

    pub fn touch_client(&self, client_id: &str, now: DateTime<Utc>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE clients SET last_seen_at = ?2 WHERE client_id = ?1",
                params![client_id, format_timestamp(now)],
            )
            .with_context(|| format!("failed to touch client {client_id}"))?;
            Ok(())
        })
    }

    pub fn remove_client(&self, client_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let removed = conn
                .execute("DELETE FROM clients WHERE client_id = ?1", params![client_id])
                .with_context(|| format!("failed to remove client {client_id}"))?;
            Ok(removed > 0)
        })
    }

    pub fn get_client(&self, client_id: &str) -> Result<Option<ClientRecord>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT client_id, workspace_id, last_ack_version, connected_at, last_seen_at,
                        force_snapshot
                 FROM clients WHERE client_id = ?1",
                params![client_id],
                row_to_client,
            )
            .optional()
            .with_context(|| format!("failed to load client {client_id}"))
        })
    }

    pub fn workspace_clients(&self, workspace_id: &str) -> Result<Vec<ClientRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT client_id, workspace_id, last_ack_version, connected_at, last_seen_at,
                            force_snapshot
                     FROM clients WHERE workspace_id = ?1
                     ORDER BY client_id ASC",
                )
                .context("failed to prepare workspace clients query")?;
            let rows = stmt
                .query_map(params![workspace_id], row_to_client)
                .context("failed to query workspace clients")?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .context("failed to collect workspace clients")
        })
    }

    /// Read and clear the forced-snapshot flag in one step.
    pub fn take_force_snapshot(&self, client_id: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction().context("failed to start force_snapshot transaction")?;
            let flagged: Option<i64> = tx
                .query_row(
                    "SELECT force_snapshot FROM clients WHERE client_id = ?1",
                    params![client_id],
                    |row| row.get(0),
                )
                .optional()
                .context("failed to read force_snapshot flag")?;
            let flagged = flagged.unwrap_or(0) != 0;
            if flagged {
                tx.execute(
                    "UPDATE clients SET force_snapshot = 0 WHERE client_id = ?1",
                    params![client_id],
                )
                .context("failed to clear force_snapshot flag")?;
            }
            tx.commit().context("failed to commit force_snapshot transaction")?;
            Ok(flagged)
        })
    }
}

fn row_to_client(row: &rusqlite::Row<'_>) -> rusqlite::Result<ClientRecord> {
    let connected_at: String = row.get(3)?;
    let last_seen_at: String = row.get(4)?;
    let force_snapshot: i64 = row.get(5)?;
    Ok(ClientRecord {
        client_id: row.get(0)?,
        workspace_id: row.get(1)?,
        last_ack_version: version_from_sql(row.get(2)?),
        connected_at: parse_timestamp(&connected_at),
        last_seen_at: parse_timestamp(&last_seen_at),
        force_snapshot: force_snapshot != 0,
    })
}
