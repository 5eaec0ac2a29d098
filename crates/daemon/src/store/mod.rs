// Persistence: SQLite-backed snapshots, deltas and the client registry.

pub mod clients;
pub mod delta;
pub mod meta_db;
pub mod recovery;
pub mod snapshot;
pub mod vacuum;

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use tracing::debug;

pub use clients::ClientRecord;
pub use delta::DeltaRecord;
pub use snapshot::{SnapshotPolicy, SnapshotRecord};
pub use vacuum::{VacuumPolicy, VacuumReport};

use self::meta_db::MetaDb;

/// Durable storage for the sync engine. Independent of in-memory state.
///
/// Every call takes the connection lock for the duration of one statement or
/// transaction, so callers may share one store across threads.
#[derive(Debug)]
pub struct PersistenceStore {
    db: Mutex<MetaDb>,
}

impl PersistenceStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = MetaDb::open(path)?;
        Ok(Self { db: Mutex::new(db) })
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    /// Persist one delta and, optionally, a snapshot taken at the same version,
    /// atomically. Either both rows land or neither does.
    pub fn commit_mutation(
        &self,
        delta: &DeltaRecord,
        snapshot: Option<&SnapshotRecord>,
    ) -> Result<()> {
        let mut db = self.lock()?;
        let tx = db
            .connection_mut()
            .transaction()
            .context("failed to start mutation transaction")?;
        delta::insert_delta(&tx, delta)?;
        if let Some(snapshot) = snapshot {
            snapshot::insert_snapshot(&tx, snapshot)?;
        }
        tx.commit().with_context(|| {
            format!(
                "failed to commit version {} for workspace {}",
                delta.version, delta.workspace_id
            )
        })?;
        Ok(())
    }

    /// All workspace ids with at least one persisted delta or snapshot.
    pub fn workspace_ids(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT workspace_id FROM deltas
                     UNION
                     SELECT workspace_id FROM snapshots
                     ORDER BY workspace_id ASC",
                )
                .context("failed to prepare workspace id query")?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .context("failed to query workspace ids")?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .context("failed to collect workspace ids")
        })
    }

    /// Checkpoint the SQLite WAL into the main database file. Called on shutdown.
    pub fn flush(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_row| Ok(()))
                .context("failed to checkpoint sync.db wal")?;
            debug!("persistence flushed");
            Ok(())
        })
    }

    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let db = self.lock()?;
        f(db.connection())
    }

    pub(crate) fn with_conn_mut<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T>,
    ) -> Result<T> {
        let mut db = self.lock()?;
        f(db.connection_mut())
    }

    fn lock(&self) -> Result<MutexGuard<'_, MetaDb>> {
        self.db.lock().map_err(|_| anyhow!("sync.db connection lock poisoned"))
    }
}

pub(crate) fn format_timestamp(ts: DateTime<Utc>) -> String {
    // Fixed-width millisecond form so TEXT comparison orders chronologically.
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    raw.parse::<DateTime<Utc>>().unwrap_or_else(|_| Utc::now())
}

pub(crate) fn version_to_sql(version: u64) -> Result<i64> {
    i64::try_from(version).with_context(|| format!("version {version} exceeds i64::MAX"))
}

pub(crate) fn version_from_sql(raw: i64) -> u64 {
    u64::try_from(raw).unwrap_or(0)
}
