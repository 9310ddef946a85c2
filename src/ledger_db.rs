use rusqlite::Connection;
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::error::LedgerResult;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const MIGRATIONS: &[(&str, &str)] = &[
    (
        "0001_init.sql",
        include_str!("../db/migrations/0001_init.sql"),
    ),
    (
        "0002_add_sync_runs.sql",
        include_str!("../db/migrations/0002_add_sync_runs.sql"),
    ),
];

#[derive(Debug, Serialize)]
pub struct LedgerDbStatus {
    pub db_path: String,
    pub exists: bool,
    pub migration_files: Vec<String>,
    pub applied_versions: Vec<String>,
    pub pending_versions: Vec<String>,
    pub schema_migrations_table_exists: bool,
    pub ready: bool,
}

#[derive(Debug, Serialize)]
pub struct LedgerDbMigrateResult {
    pub applied_now: Vec<String>,
    pub skipped: Vec<String>,
    pub applied_total: usize,
    pub pending_total: usize,
}

fn ensure_schema_migrations_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version TEXT PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        "#,
    )
}

fn has_schema_migrations_table(conn: &Connection) -> rusqlite::Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_migrations')",
            [],
            |row| row.get::<_, i64>(0),
        )
        .map(|v| v != 0)?;
    Ok(exists)
}

fn load_applied_versions(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT version FROM schema_migrations ORDER BY version ASC")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut versions = Vec::new();
    for row in rows {
        versions.push(row?);
    }
    Ok(versions)
}

/// Opens (creating parent directories) and configures a ledger connection.
pub fn open_ledger(db_path: &Path) -> LedgerResult<Connection> {
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(db_path)?;
    configure_connection(&conn)?;
    Ok(conn)
}

pub fn configure_connection(conn: &Connection) -> LedgerResult<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(())
}

/// Applies every embedded migration not yet recorded in `schema_migrations`, each
/// in its own transaction.
pub fn apply_migrations(conn: &mut Connection) -> LedgerResult<LedgerDbMigrateResult> {
    ensure_schema_migrations_table(conn)?;
    let already = load_applied_versions(conn)?
        .into_iter()
        .collect::<HashSet<_>>();

    let mut applied_now = Vec::new();
    let mut skipped = Vec::new();

    for (version, sql) in MIGRATIONS {
        if already.contains(*version) {
            skipped.push((*version).to_string());
            continue;
        }
        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.execute(
            "INSERT INTO schema_migrations(version) VALUES (?1)",
            [*version],
        )?;
        tx.commit()?;
        tracing::info!(version = *version, "applied ledger migration");
        applied_now.push((*version).to_string());
    }

    let applied_total = load_applied_versions(conn)?.len();
    Ok(LedgerDbMigrateResult {
        applied_now,
        skipped,
        applied_total,
        pending_total: MIGRATIONS.len().saturating_sub(applied_total),
    })
}

pub fn open_and_migrate(db_path: &Path) -> LedgerResult<Connection> {
    let mut conn = open_ledger(db_path)?;
    apply_migrations(&mut conn)?;
    Ok(conn)
}

pub fn inspect_status_at_path(db_path: &Path) -> LedgerResult<LedgerDbStatus> {
    let migration_files = MIGRATIONS
        .iter()
        .map(|(v, _)| (*v).to_string())
        .collect::<Vec<_>>();
    if !db_path.exists() {
        return Ok(LedgerDbStatus {
            db_path: db_path.to_string_lossy().to_string(),
            exists: false,
            migration_files: migration_files.clone(),
            applied_versions: Vec::new(),
            pending_versions: migration_files,
            schema_migrations_table_exists: false,
            ready: false,
        });
    }

    let conn = Connection::open(db_path)?;
    let schema_table_exists = has_schema_migrations_table(&conn)?;
    let applied_versions = if schema_table_exists {
        load_applied_versions(&conn)?
    } else {
        Vec::new()
    };
    let applied_set = applied_versions.iter().cloned().collect::<HashSet<_>>();
    let pending_versions = migration_files
        .iter()
        .filter(|v| !applied_set.contains(*v))
        .cloned()
        .collect::<Vec<_>>();

    Ok(LedgerDbStatus {
        db_path: db_path.to_string_lossy().to_string(),
        exists: true,
        migration_files,
        applied_versions,
        ready: pending_versions.is_empty(),
        pending_versions,
        schema_migrations_table_exists: schema_table_exists,
    })
}

#[cfg(test)]
pub(crate) fn memory_ledger() -> Connection {
    let mut conn = Connection::open_in_memory().expect("open in-memory ledger");
    configure_connection(&conn).expect("configure in-memory ledger");
    apply_migrations(&mut conn).expect("migrate in-memory ledger");
    conn
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrating_twice_only_applies_once() {
        let dir = tempfile::tempdir().expect("temp dir");
        let db_path = dir.path().join("nested/ledger.db");

        let before = inspect_status_at_path(&db_path).expect("status before");
        assert!(!before.exists);
        assert_eq!(before.pending_versions.len(), MIGRATIONS.len());

        let mut conn = open_ledger(&db_path).expect("open");
        let first = apply_migrations(&mut conn).expect("first migrate");
        assert_eq!(first.applied_now.len(), MIGRATIONS.len());
        let second = apply_migrations(&mut conn).expect("second migrate");
        assert!(second.applied_now.is_empty());
        assert_eq!(second.skipped.len(), MIGRATIONS.len());
        assert_eq!(second.pending_total, 0);

        let after = inspect_status_at_path(&db_path).expect("status after");
        assert!(after.ready);
        assert!(after.schema_migrations_table_exists);
    }

    #[test]
    fn memory_ledger_has_expected_tables() {
        let conn = memory_ledger();
        for table in ["transactions", "sync_info", "sync_runs"] {
            let exists: i64 = conn
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name=?1)",
                    [table],
                    |row| row.get(0),
                )
                .expect("table lookup");
            assert_eq!(exists, 1, "missing table {table}");
        }
    }
}
