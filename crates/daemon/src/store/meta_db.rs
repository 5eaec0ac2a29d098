use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{params, Connection};

const MIGRATION_V1_SQL: &str = r#"
CREATE TABLE snapshots (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    workspace_id    TEXT NOT NULL,
    version         INTEGER NOT NULL,
    state           BLOB NOT NULL,
    timestamp       TEXT NOT NULL,
    UNIQUE (workspace_id, version)
);

CREATE TABLE deltas (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    workspace_id    TEXT NOT NULL,
    version         INTEGER NOT NULL,
    base_version    INTEGER NOT NULL,
    changes         BLOB NOT NULL,
    timestamp       TEXT NOT NULL,
    UNIQUE (workspace_id, version)
);

CREATE TABLE clients (
    client_id           TEXT PRIMARY KEY,
    workspace_id        TEXT NOT NULL,
    last_ack_version    INTEGER NOT NULL DEFAULT 0,
    connected_at        TEXT NOT NULL,
    last_seen_at        TEXT NOT NULL
);

CREATE INDEX snapshots_workspace_version_idx
    ON snapshots (workspace_id, version);

CREATE INDEX deltas_workspace_version_idx
    ON deltas (workspace_id, version);

CREATE INDEX clients_workspace_idx
    ON clients (workspace_id);
"#;

const MIGRATION_V2_SQL: &str = r#"
ALTER TABLE clients ADD COLUMN force_snapshot INTEGER NOT NULL DEFAULT 0;
"#;

const MIGRATIONS: &[(i64, &str)] = &[(1, MIGRATION_V1_SQL), (2, MIGRATION_V2_SQL)];

/// SQLite database holding snapshots, deltas and the client registry.
#[derive(Debug)]
pub struct MetaDb {
    conn: Connection,
}

impl MetaDb {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create sync.db parent directory `{}`", parent.display())
            })?;
        }

        let mut conn = Connection::open(path)
            .with_context(|| format!("failed to open sync.db at `{}`", path.display()))?;

        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = FULL;
            ",
        )
        .context("failed to configure sqlite pragmas for sync.db")?;

        ensure_migration_table(&conn)?;
        apply_pending_migrations(&mut conn)?;

        Ok(Self { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    pub fn schema_version(&self) -> Result<i64> {
        current_schema_version(&self.conn)
    }
}

fn ensure_migration_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY,
            applied_at  TEXT NOT NULL
        );
        ",
    )
    .context("failed to ensure schema_migrations table exists")
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| row.get(0))
        .context("failed to read current schema version")
}

fn apply_pending_migrations(conn: &mut Connection) -> Result<()> {
    let mut current_version = current_schema_version(conn)?;

    for (version, sql) in MIGRATIONS {
        if *version <= current_version {
            continue;
        }

        let tx = conn.transaction().context("failed to start migration transaction")?;
        tx.execute_batch(sql)
            .with_context(|| format!("failed to apply sync.db migration v{version}"))?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, datetime('now'))",
            params![version],
        )
        .with_context(|| format!("failed to record migration v{version}"))?;
        tx.commit().with_context(|| format!("failed to commit migration v{version}"))?;
        current_version = *version;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use rusqlite::Connection;
    use tempfile::tempdir;

    use super::{MetaDb, MIGRATION_V1_SQL};

    const EXPECTED_TABLES: &[&str] = &["schema_migrations", "snapshots", "deltas", "clients"];

    #[test]
    fn open_creates_schema_and_records_latest_migration() {
        let tmp = tempdir().expect("tempdir should be created");
        let db = MetaDb::open(tmp.path().join("sync.db")).expect("sync db should open");

        for table in EXPECTED_TABLES {
            let exists: i64 = db
                .connection()
                .query_row(
                    "SELECT COUNT(1) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    [table],
                    |row| row.get(0),
                )
                .expect("table existence query should succeed");

            assert_eq!(exists, 1, "expected `{table}` table to exist");
        }

        assert_eq!(db.schema_version().expect("schema version should be readable"), 2);
    }

    #[test]
    fn opening_twice_is_idempotent_for_all_migrations() {
        let tmp = tempdir().expect("tempdir should be created");
        let db_path = tmp.path().join("sync.db");
        {
            let first = MetaDb::open(&db_path).expect("first open should succeed");
            assert_eq!(first.schema_version().expect("schema version should be readable"), 2);
        }

        let second = MetaDb::open(&db_path).expect("second open should succeed");
        let migration_rows: i64 = second
            .connection()
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |row| row.get(0))
            .expect("schema migration count query should succeed");
        assert_eq!(migration_rows, 2);
    }

    #[test]
    fn existing_v1_schema_gains_force_snapshot_column() {
        let tmp = tempdir().expect("tempdir should be created");
        let db_path = tmp.path().join("sync.db");
        {
            let conn = Connection::open(&db_path).expect("v1 seed db should open");
            conn.execute_batch(
                "
                CREATE TABLE schema_migrations (
                    version     INTEGER PRIMARY KEY,
                    applied_at  TEXT NOT NULL
                );
                ",
            )
            .expect("schema_migrations should be created");
            conn.execute_batch(MIGRATION_V1_SQL).expect("v1 schema should be applied");
            conn.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (1, datetime('now'))",
                [],
            )
            .expect("v1 migration row should be inserted");
            conn.execute(
                "INSERT INTO clients (client_id, workspace_id, last_ack_version, connected_at, last_seen_at)
                 VALUES ('c1', 'ws-1', 4, 'now', 'now')",
                [],
            )
            .expect("v1 client row should be inserted");
        }

        let db = MetaDb::open(&db_path).expect("sync db should upgrade from v1 to v2");
        assert_eq!(db.schema_version().expect("schema version should be readable"), 2);

        let force_snapshot: i64 = db
            .connection()
            .query_row("SELECT force_snapshot FROM clients WHERE client_id = 'c1'", [], |row| {
                row.get(0)
            })
            .expect("existing client should have default force_snapshot");
        assert_eq!(force_snapshot, 0);
    }
}
