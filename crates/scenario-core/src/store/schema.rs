//! SQLite schema DDL and migration framework for persisted studies.

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, warn};

use crate::errors::ScenarioResult;

/// Schema version written by this crate.
pub const SCHEMA_VERSION: i32 = 3;

/// Tables and indexes of a study database, all `IF NOT EXISTS` so they can
/// be replayed on an existing file.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS study_meta (
        key TEXT PRIMARY KEY,
        value TEXT
    );",
    "CREATE TABLE IF NOT EXISTS sources (
        source_id INTEGER PRIMARY KEY CHECK (source_id BETWEEN 1 AND 65535),
        record_type TEXT NOT NULL,
        is_locked BOOLEAN NOT NULL,
        ext_dataset_id INTEGER,
        ext_record_id TEXT,
        user_record_id INTEGER,
        original_source_id INTEGER REFERENCES sources(source_id),
        mod_count INTEGER NOT NULL DEFAULT 0,
        facility_json TEXT NOT NULL,
        CHECK (ext_record_id IS NULL OR user_record_id IS NULL)
    );",
    "CREATE TABLE IF NOT EXISTS scenarios (
        scenario_key INTEGER PRIMARY KEY,
        name TEXT NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS scenario_items (
        scenario_key INTEGER NOT NULL REFERENCES scenarios(scenario_key),
        source_id INTEGER NOT NULL REFERENCES sources(source_id),
        position INTEGER NOT NULL,
        is_desired BOOLEAN NOT NULL,
        is_undesired BOOLEAN NOT NULL,
        is_permanent BOOLEAN NOT NULL DEFAULT FALSE,
        PRIMARY KEY (scenario_key, source_id)
    );",
    "CREATE TABLE IF NOT EXISTS migration_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        from_version INTEGER NOT NULL,
        to_version INTEGER NOT NULL,
        status TEXT NOT NULL,
        error_message TEXT,
        applied_at TEXT DEFAULT CURRENT_TIMESTAMP
    );",
    "CREATE INDEX IF NOT EXISTS idx_sources_external
        ON sources(ext_dataset_id, ext_record_id);",
    "CREATE INDEX IF NOT EXISTS idx_sources_user ON sources(user_record_id);",
    "CREATE INDEX IF NOT EXISTS idx_items_position ON scenario_items(scenario_key, position);",
];

type MigrationStep = fn(&Connection) -> ScenarioResult<()>;

/// Migration steps in order; entry `i` takes the schema to version `i + 1`.
const MIGRATIONS: [MigrationStep; SCHEMA_VERSION as usize] =
    [baseline_v1, add_original_index_v2, add_mod_count_v3];

const STEP_SAVEPOINT: &str = "study_migrate_step";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StepStatus {
    Success,
    Failed,
}

impl StepStatus {
    fn as_str(self) -> &'static str {
        match self {
            StepStatus::Success => "success",
            StepStatus::Failed => "failed",
        }
    }
}

/// Bring `conn` up to [`SCHEMA_VERSION`]. Each step runs inside its own
/// savepoint and is logged to `migration_history`, failures included.
pub fn migrate_schema(conn: &Connection) -> ScenarioResult<()> {
    let from = get_schema_version(conn).max(0);
    for (index, step) in MIGRATIONS.iter().enumerate().skip(from as usize) {
        let to = index as i32 + 1;
        run_step(conn, to - 1, to, *step)?;
    }
    Ok(())
}

fn run_step(conn: &Connection, from: i32, to: i32, step: MigrationStep) -> ScenarioResult<()> {
    conn.execute_batch(&format!("SAVEPOINT {STEP_SAVEPOINT};"))?;
    let applied = step(conn)
        .and_then(|()| set_schema_version(conn, to))
        .and_then(|()| record_migration_step(conn, from, to, StepStatus::Success, None));
    match applied {
        Ok(()) => {
            conn.execute_batch(&format!("RELEASE SAVEPOINT {STEP_SAVEPOINT};"))?;
            debug!("Study schema migrated v{from} -> v{to}");
            Ok(())
        }
        Err(err) => {
            // The failure row is written after the rollback so it survives.
            let _ = conn.execute_batch(&format!(
                "ROLLBACK TO SAVEPOINT {STEP_SAVEPOINT}; RELEASE SAVEPOINT {STEP_SAVEPOINT};"
            ));
            let _ = record_migration_step(conn, from, to, StepStatus::Failed, Some(&err.to_string()));
            warn!("Study schema migration v{from} -> v{to} failed: {err}");
            Err(err)
        }
    }
}

/// Schema version recorded in `study_meta`; 0 for a database that has none.
pub fn get_schema_version(conn: &Connection) -> i32 {
    conn.query_row(
        "SELECT value FROM study_meta WHERE key = 'schema_version';",
        [],
        |row| row.get::<_, String>(0),
    )
    .optional()
    .ok()
    .flatten()
    .and_then(|raw| raw.parse().ok())
    .unwrap_or(0)
}

fn set_schema_version(conn: &Connection, version: i32) -> ScenarioResult<()> {
    conn.execute(
        "INSERT INTO study_meta(key, value) VALUES ('schema_version', ?1) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value;",
        params![version.to_string()],
    )?;
    Ok(())
}

fn record_migration_step(
    conn: &Connection,
    from: i32,
    to: i32,
    status: StepStatus,
    error: Option<&str>,
) -> ScenarioResult<()> {
    conn.execute(
        "INSERT INTO migration_history(from_version, to_version, status, error_message) \
         VALUES (?1, ?2, ?3, ?4);",
        params![from, to, status.as_str(), error],
    )?;
    Ok(())
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> ScenarioResult<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table});"))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names.iter().any(|name| name == column))
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

fn baseline_v1(_conn: &Connection) -> ScenarioResult<()> {
    Ok(())
}

/// Replication lookups by original.
fn add_original_index_v2(conn: &Connection) -> ScenarioResult<()> {
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_sources_original ON sources(original_source_id);",
    )?;
    Ok(())
}

/// Edit counter for sources written before it existed.
fn add_mod_count_v3(conn: &Connection) -> ScenarioResult<()> {
    if column_exists(conn, "sources", "mod_count")? {
        return Ok(());
    }
    conn.execute_batch("ALTER TABLE sources ADD COLUMN mod_count INTEGER NOT NULL DEFAULT 0;")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        for stmt in SCHEMA_STATEMENTS {
            conn.execute_batch(stmt).unwrap();
        }
        conn
    }

    #[test]
    fn schema_statement_counts() {
        assert_eq!(SCHEMA_STATEMENTS.len(), 8);
    }

    #[test]
    fn migrate_fresh_database() {
        let conn = fresh();
        migrate_schema(&conn).unwrap();
        assert_eq!(get_schema_version(&conn), SCHEMA_VERSION);

        let steps: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM migration_history WHERE status = 'success';",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(steps, i64::from(SCHEMA_VERSION));
    }

    #[test]
    fn migrate_idempotent() {
        let conn = fresh();
        migrate_schema(&conn).unwrap();
        migrate_schema(&conn).unwrap();
        assert_eq!(get_schema_version(&conn), SCHEMA_VERSION);
    }

    #[test]
    fn v3_adds_missing_edit_counter() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE study_meta (key TEXT PRIMARY KEY, value TEXT);
             CREATE TABLE migration_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                from_version INTEGER NOT NULL,
                to_version INTEGER NOT NULL,
                status TEXT NOT NULL,
                error_message TEXT,
                applied_at TEXT DEFAULT CURRENT_TIMESTAMP
             );
             CREATE TABLE sources (source_id INTEGER PRIMARY KEY, original_source_id INTEGER);
             INSERT INTO study_meta(key, value) VALUES ('schema_version', '2');",
        )
        .unwrap();
        assert!(!column_exists(&conn, "sources", "mod_count").unwrap());
        migrate_schema(&conn).unwrap();
        assert!(column_exists(&conn, "sources", "mod_count").unwrap());
        assert_eq!(get_schema_version(&conn), 3);
    }

    #[test]
    fn failed_step_is_rolled_back_and_recorded() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE study_meta (key TEXT PRIMARY KEY, value TEXT);
             CREATE TABLE migration_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                from_version INTEGER NOT NULL,
                to_version INTEGER NOT NULL,
                status TEXT NOT NULL,
                error_message TEXT,
                applied_at TEXT DEFAULT CURRENT_TIMESTAMP
             );
             INSERT INTO study_meta(key, value) VALUES ('schema_version', '2');",
        )
        .unwrap();
        // No sources table, so adding the edit counter fails.
        assert!(migrate_schema(&conn).is_err());
        assert_eq!(get_schema_version(&conn), 2);
        let (to, status): (i32, String) = conn
            .query_row(
                "SELECT to_version, status FROM migration_history ORDER BY id DESC LIMIT 1;",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!((to, status.as_str()), (3, "failed"));
    }
}
