// Retention: bounded delta/snapshot history and stale client cleanup.
//
// Never deletes what is needed to rebuild the current version: the newest
// snapshot always survives, and deltas above it are never touched. Clients
// whose catch-up range gets deleted are flagged for a forced snapshot.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params, OptionalExtension, Transaction};
use tracing::{debug, info};

use super::{format_timestamp, version_from_sql, version_to_sql, PersistenceStore};

pub const DEFAULT_KEEP_DELTAS: u64 = 1_000;
pub const DEFAULT_KEEP_SNAPSHOTS: u64 = 2;
pub const DEFAULT_MAX_DELTA_AGE: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_CLIENT_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VacuumPolicy {
    pub keep_deltas: u64,
    /// Clamped to at least one.
    pub keep_snapshots: u64,
    pub max_delta_age: Duration,
    pub client_ttl: Duration,
}

impl Default for VacuumPolicy {
    fn default() -> Self {
        Self {
            keep_deltas: DEFAULT_KEEP_DELTAS,
            keep_snapshots: DEFAULT_KEEP_SNAPSHOTS,
            max_delta_age: DEFAULT_MAX_DELTA_AGE,
            client_ttl: DEFAULT_CLIENT_TTL,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VacuumReport {
    pub deleted_deltas: u64,
    pub deleted_snapshots: u64,
    pub deleted_clients: u64,
    pub forced_snapshot_clients: u64,
    /// Workspaces left untouched because no snapshot covers their history.
    pub skipped_workspaces: Vec<String>,
}

impl PersistenceStore {
    pub fn vacuum(&self, policy: &VacuumPolicy, now: DateTime<Utc>) -> Result<VacuumReport> {
        let mut report = VacuumReport::default();
        report.deleted_clients = self.delete_stale_clients(policy.client_ttl, now)?;

        let delta_cutoff = format_timestamp(cutoff(now, policy.max_delta_age));
        for workspace_id in self.workspace_ids()? {
            let outcome = self.with_conn_mut(|conn| {
                let tx = conn.transaction().context("failed to start vacuum transaction")?;
                let outcome = vacuum_workspace(&tx, &workspace_id, policy, &delta_cutoff)?;
                tx.commit().context("failed to commit vacuum transaction")?;
                Ok(outcome)
            })?;

            match outcome {
                None => report.skipped_workspaces.push(workspace_id),
                Some(outcome) => {
                    report.deleted_deltas += outcome.deleted_deltas;
                    report.deleted_snapshots += outcome.deleted_snapshots;
                    report.forced_snapshot_clients += outcome.forced_clients;
                }
            }
        }

        info!(
            deleted_deltas = report.deleted_deltas,
            deleted_snapshots = report.deleted_snapshots,
            deleted_clients = report.deleted_clients,
            forced_snapshot_clients = report.forced_snapshot_clients,
            "vacuum finished"
        );
        Ok(report)
    }

    fn delete_stale_clients(&self, ttl: Duration, now: DateTime<Utc>) -> Result<u64> {
        let seen_before = format_timestamp(cutoff(now, ttl));
        self.with_conn(|conn| {
            let deleted = conn
                .execute("DELETE FROM clients WHERE last_seen_at < ?1", params![seen_before])
                .context("failed to delete stale clients")?;
            Ok(deleted as u64)
        })
    }
}

struct WorkspaceVacuum {
    deleted_deltas: u64,
    deleted_snapshots: u64,
    forced_clients: u64,
}

fn vacuum_workspace(
    tx: &Transaction<'_>,
    workspace_id: &str,
    policy: &VacuumPolicy,
    delta_cutoff: &str,
) -> Result<Option<WorkspaceVacuum>> {
    let latest_snapshot: Option<i64> = tx
        .query_row(
            "SELECT MAX(version) FROM snapshots WHERE workspace_id = ?1",
            params![workspace_id],
            |row| row.get(0),
        )
        .context("failed to read latest snapshot version")?;
    let Some(latest_snapshot) = latest_snapshot else {
        debug!(workspace_id, "vacuum skipped: no snapshot covers delta history");
        return Ok(None);
    };

    let keep_snapshots = version_to_sql(policy.keep_snapshots.max(1))?;
    let deleted_snapshots = tx
        .execute(
            "DELETE FROM snapshots
             WHERE workspace_id = ?1
               AND version NOT IN (
                   SELECT version FROM snapshots
                   WHERE workspace_id = ?1
                   ORDER BY version DESC
                   LIMIT ?2
               )",
            params![workspace_id, keep_snapshots],
        )
        .context("failed to delete old snapshots")?;

    let head: Option<i64> = tx
        .query_row(
            "SELECT MAX(version) FROM deltas WHERE workspace_id = ?1",
            params![workspace_id],
            |row| row.get(0),
        )
        .context("failed to read head delta version")?;
    let head = head.unwrap_or(latest_snapshot).max(latest_snapshot);

    // Newest `keep_deltas` are protected by count; the rest go once they are
    // both old enough and covered by the latest snapshot.
    let keep_floor = if policy.keep_deltas == 0 {
        head.saturating_add(1)
    } else {
        tx.query_row(
            "SELECT version FROM deltas WHERE workspace_id = ?1
             ORDER BY version DESC LIMIT 1 OFFSET ?2",
            params![workspace_id, version_to_sql(policy.keep_deltas - 1)?],
            |row| row.get::<_, i64>(0),
        )
        .optional()
        .context("failed to read delta retention floor")?
        .unwrap_or(i64::MIN)
    };

    let deleted_deltas = tx
        .execute(
            "DELETE FROM deltas
             WHERE workspace_id = ?1
               AND version < ?2
               AND version <= ?3
               AND timestamp <= ?4",
            params![workspace_id, keep_floor, latest_snapshot, delta_cutoff],
        )
        .context("failed to delete old deltas")?;

    let earliest_remaining: Option<i64> = tx
        .query_row(
            "SELECT MIN(version) FROM deltas WHERE workspace_id = ?1",
            params![workspace_id],
            |row| row.get(0),
        )
        .context("failed to read earliest remaining delta")?;
    // A client acked at `v` needs deltas from `v + 1`.
    let needs_snapshot_below = match earliest_remaining {
        Some(earliest) => earliest - 1,
        None => head,
    };
    let forced_clients = tx
        .execute(
            "UPDATE clients SET force_snapshot = 1
             WHERE workspace_id = ?1 AND last_ack_version < ?2 AND force_snapshot = 0",
            params![workspace_id, needs_snapshot_below],
        )
        .context("failed to flag clients for forced snapshot")?;

    if deleted_deltas > 0 || deleted_snapshots > 0 {
        debug!(
            workspace_id,
            deleted_deltas,
            deleted_snapshots,
            forced_clients,
            retained_from = version_from_sql(needs_snapshot_below + 1),
            "vacuumed workspace"
        );
    }

    Ok(Some(WorkspaceVacuum {
        deleted_deltas: deleted_deltas as u64,
        deleted_snapshots: deleted_snapshots as u64,
        forced_clients: forced_clients as u64,
    }))
}

fn cutoff(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    ChronoDuration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
