//! SQLite persistence for study state.
//!
//! Every public method opens its own connection, so callers never manage
//! connection lifetime. A save replaces the whole study inside one
//! transaction; the ids it reports back are the ones the registry may keep.

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use crate::errors::{ScenarioError, ScenarioResult};
use crate::models::{
    ExternalKey, Facility, RecordType, Sharing, Source, SourceId, SourceListItem, StudyType,
};
use crate::store::schema;

// ---------------------------------------------------------------------------
// Snapshot types
// ---------------------------------------------------------------------------

/// Persisted form of one scenario. Items are in scenario order.
#[derive(Clone, Debug, PartialEq)]
pub struct ScenarioRecord {
    pub key: i32,
    pub name: String,
    pub items: Vec<SourceListItem>,
}

/// Everything a study persists.
#[derive(Clone, Debug, PartialEq)]
pub struct StudySnapshot {
    pub study_type: StudyType,
    pub sources: Vec<Source>,
    pub scenarios: Vec<ScenarioRecord>,
}

/// Durable storage for study snapshots.
pub trait StudyPersistence {
    /// Replace the stored study with `snapshot` and return the source ids
    /// that are live in storage afterwards.
    fn write_study(&self, snapshot: &StudySnapshot) -> ScenarioResult<Vec<SourceId>>;

    fn read_study(&self) -> ScenarioResult<StudySnapshot>;
}

// ---------------------------------------------------------------------------
// Helper: path resolution
// ---------------------------------------------------------------------------

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let text = path.to_string_lossy();
    if text == "~" || text.starts_with("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            let mut expanded = PathBuf::from(home);
            if text.len() > 2 {
                expanded.push(&text[2..]);
            }
            return expanded;
        }
    }
    path.to_path_buf()
}

fn resolve_path(path: &Path) -> ScenarioResult<PathBuf> {
    let expanded = expand_tilde(path);
    if expanded.is_absolute() {
        Ok(expanded)
    } else {
        Ok(std::env::current_dir()?.join(expanded))
    }
}

fn source_id_from_sql(raw: i64) -> ScenarioResult<SourceId> {
    u16::try_from(raw)
        .ok()
        .and_then(SourceId::new)
        .ok_or_else(|| ScenarioError::Database(format!("invalid source id {raw} in storage")))
}

// ---------------------------------------------------------------------------
// SqliteStudyStore
// ---------------------------------------------------------------------------

/// SQLite-backed [`StudyPersistence`].
pub struct SqliteStudyStore {
    db_path: PathBuf,
}

struct SourceRow {
    source_id: i64,
    record_type: String,
    is_locked: bool,
    ext_dataset_id: Option<i32>,
    ext_record_id: Option<String>,
    user_record_id: Option<i64>,
    original_source_id: Option<i64>,
    mod_count: i64,
    facility_json: String,
}

impl SourceRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            source_id: row.get(0)?,
            record_type: row.get(1)?,
            is_locked: row.get(2)?,
            ext_dataset_id: row.get(3)?,
            ext_record_id: row.get(4)?,
            user_record_id: row.get(5)?,
            original_source_id: row.get(6)?,
            mod_count: row.get(7)?,
            facility_json: row.get(8)?,
        })
    }

    fn into_source(self) -> ScenarioResult<Source> {
        let id = source_id_from_sql(self.source_id)?;
        let facility: Facility = serde_json::from_str(&self.facility_json)?;
        if RecordType::parse(&self.record_type) != Some(facility.record_type()) {
            return Err(ScenarioError::RecordTypeMismatch(format!(
                "source {id} is stored as '{}' but carries a {} facility",
                self.record_type,
                facility.record_type()
            )));
        }
        let sharing = match (self.ext_dataset_id, self.ext_record_id, self.user_record_id) {
            (Some(dataset_id), Some(record_id), None) => {
                Sharing::External(ExternalKey::new(dataset_id, record_id))
            }
            (None, None, Some(user_record_id)) => Sharing::User { user_record_id },
            (None, None, None) => Sharing::Private,
            _ => {
                return Err(ScenarioError::Database(format!(
                    "source {id} has an inconsistent sharing identity"
                )))
            }
        };
        Ok(Source {
            id,
            is_locked: self.is_locked,
            sharing,
            original_id: self.original_source_id.map(source_id_from_sql).transpose()?,
            facility,
            mod_count: u64::try_from(self.mod_count).unwrap_or(0),
        })
    }
}

impl SqliteStudyStore {
    /// Create a store for `db_path`. The path is expanded and parent
    /// directories are created if they do not already exist.
    pub fn new(db_path: impl AsRef<Path>) -> ScenarioResult<Self> {
        let resolved = resolve_path(db_path.as_ref())?;
        if let Some(parent) = resolved.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self { db_path: resolved })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn connect(&self) -> ScenarioResult<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(conn)
    }

    /// Create tables and indexes, then run pending migrations.
    pub fn init_schema(&self) -> ScenarioResult<()> {
        let conn = self.connect()?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        for stmt in schema::SCHEMA_STATEMENTS {
            conn.execute_batch(stmt)?;
        }
        schema::migrate_schema(&conn)?;
        Ok(())
    }

    pub fn get_study_meta(&self, key: &str) -> ScenarioResult<Option<String>> {
        let conn = self.connect()?;
        let value = conn
            .query_row(
                "SELECT value FROM study_meta WHERE key = ?1;",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set_study_meta(conn: &Connection, key: &str, value: &str) -> ScenarioResult<()> {
        conn.execute(
            "INSERT INTO study_meta(key, value) VALUES(?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value;",
            params![key, value],
        )?;
        Ok(())
    }

    /// Copy the database to `destination` using the SQLite backup API.
    pub fn backup_to(&self, destination: impl AsRef<Path>) -> ScenarioResult<PathBuf> {
        let resolved = resolve_path(destination.as_ref())?;
        if let Some(parent) = resolved.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let src_conn = self.connect()?;
        let mut dst_conn = Connection::open(&resolved)?;
        let backup = rusqlite::backup::Backup::new(&src_conn, &mut dst_conn)?;
        backup.run_to_completion(100, std::time::Duration::from_millis(10), None)?;
        info!("Backed up study database to {}", resolved.display());
        Ok(resolved)
    }

    fn insert_source(conn: &Connection, source: &Source) -> ScenarioResult<()> {
        let (ext_dataset_id, ext_record_id, user_record_id) = match &source.sharing {
            Sharing::External(key) => (Some(key.dataset_id), Some(key.record_id.as_str()), None),
            Sharing::User { user_record_id } => (None, None, Some(*user_record_id)),
            Sharing::Private => (None, None, None),
        };
        conn.execute(
            "INSERT INTO sources ( \
                 source_id, record_type, is_locked, ext_dataset_id, ext_record_id, \
                 user_record_id, original_source_id, mod_count, facility_json \
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9);",
            params![
                source.id.get(),
                source.record_type().as_str(),
                source.is_locked,
                ext_dataset_id,
                ext_record_id,
                user_record_id,
                source.original_id.map(SourceId::get),
                i64::try_from(source.mod_count).unwrap_or(i64::MAX),
                serde_json::to_string(&source.facility)?,
            ],
        )?;
        Ok(())
    }
}

impl StudyPersistence for SqliteStudyStore {
    fn write_study(&self, snapshot: &StudySnapshot) -> ScenarioResult<Vec<SourceId>> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        tx.execute_batch("PRAGMA defer_foreign_keys = ON;")?;
        tx.execute_batch(
            "DELETE FROM scenario_items; DELETE FROM scenarios; DELETE FROM sources;",
        )?;

        Self::set_study_meta(&tx, "study_type", &serde_json::to_string(&snapshot.study_type)?)?;
        for source in &snapshot.sources {
            Self::insert_source(&tx, source)?;
        }
        for scenario in &snapshot.scenarios {
            tx.execute(
                "INSERT INTO scenarios (scenario_key, name) VALUES (?1, ?2);",
                params![scenario.key, scenario.name],
            )?;
            for (position, item) in scenario.items.iter().enumerate() {
                tx.execute(
                    "INSERT INTO scenario_items ( \
                         scenario_key, source_id, position, is_desired, is_undesired, is_permanent \
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6);",
                    params![
                        scenario.key,
                        item.source_id.get(),
                        position as i64,
                        item.is_desired,
                        item.is_undesired,
                        item.is_permanent,
                    ],
                )?;
            }
        }
        tx.commit()?;

        let mut stmt = conn.prepare("SELECT source_id FROM sources ORDER BY source_id;")?;
        let raw: Vec<i64> = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        let live = raw
            .into_iter()
            .map(source_id_from_sql)
            .collect::<ScenarioResult<Vec<_>>>()?;
        debug!(
            "Wrote study: {} sources, {} scenarios",
            live.len(),
            snapshot.scenarios.len()
        );
        Ok(live)
    }

    fn read_study(&self) -> ScenarioResult<StudySnapshot> {
        let conn = self.connect()?;
        let study_type: Option<String> = conn
            .query_row(
                "SELECT value FROM study_meta WHERE key = 'study_type';",
                [],
                |row| row.get(0),
            )
            .optional()?;
        let study_type: StudyType = match study_type {
            Some(text) => serde_json::from_str(&text)?,
            None => {
                return Err(ScenarioError::Database(
                    "stored study has no study type".to_string(),
                ))
            }
        };

        let mut stmt = conn.prepare(
            "SELECT source_id, record_type, is_locked, ext_dataset_id, ext_record_id, \
                    user_record_id, original_source_id, mod_count, facility_json \
             FROM sources ORDER BY source_id;",
        )?;
        let rows: Vec<SourceRow> = stmt
            .query_map([], SourceRow::from_row)?
            .collect::<Result<_, _>>()?;
        let sources = rows
            .into_iter()
            .map(SourceRow::into_source)
            .collect::<ScenarioResult<Vec<_>>>()?;

        let mut scenario_stmt =
            conn.prepare("SELECT scenario_key, name FROM scenarios ORDER BY scenario_key;")?;
        let headers: Vec<(i32, String)> = scenario_stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<_, _>>()?;

        let mut item_stmt = conn.prepare(
            "SELECT source_id, is_desired, is_undesired, is_permanent \
             FROM scenario_items WHERE scenario_key = ?1 ORDER BY position;",
        )?;
        let mut scenarios = Vec::with_capacity(headers.len());
        for (key, name) in headers {
            let rows: Vec<(i64, bool, bool, bool)> = item_stmt
                .query_map(params![key], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                })?
                .collect::<Result<_, _>>()?;
            let items = rows
                .into_iter()
                .map(|(raw, is_desired, is_undesired, is_permanent)| {
                    Ok(SourceListItem {
                        source_id: source_id_from_sql(raw)?,
                        is_desired,
                        is_undesired,
                        is_permanent,
                    })
                })
                .collect::<ScenarioResult<Vec<_>>>()?;
            scenarios.push(ScenarioRecord { key, name, items });
        }

        Ok(StudySnapshot {
            study_type,
            sources,
            scenarios,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures::{fm_facility, id, record, tv_facility};
    use crate::models::GeoPoint;

    fn store() -> (tempfile::TempDir, SqliteStudyStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStudyStore::new(dir.path().join("nested").join("study.db")).unwrap();
        store.init_schema().unwrap();
        (dir, store)
    }

    fn snapshot() -> StudySnapshot {
        let here = GeoPoint::new(40.0, -75.0);
        let tv = Source::from_external(id(1), &record(3, "T1", tv_facility(6, here))).unwrap();
        let rep = tv.replicate(id(2), 9).unwrap();
        let user = Source::from_user_record(id(7), 55, fm_facility(4, 250, here)).unwrap();
        let private = Source::private(id(9), fm_facility(5, 260, here)).unwrap();
        let mut item = SourceListItem::new(id(7), false, true);
        item.is_permanent = true;
        StudySnapshot {
            study_type: StudyType::Tv6Fm,
            sources: vec![tv, rep, user, private],
            scenarios: vec![ScenarioRecord {
                key: 1,
                name: "Baseline".to_string(),
                items: vec![SourceListItem::new(id(2), true, false), item],
            }],
        }
    }

    #[test]
    fn write_then_read_restores_study() {
        let (_dir, store) = store();
        let snapshot = snapshot();
        let live = store.write_study(&snapshot).unwrap();
        assert_eq!(live, vec![id(1), id(2), id(7), id(9)]);
        assert_eq!(store.read_study().unwrap(), snapshot);
        assert_eq!(
            store.get_study_meta("schema_version").unwrap(),
            Some(schema::SCHEMA_VERSION.to_string())
        );
    }

    #[test]
    fn write_replaces_previous_contents() {
        let (_dir, store) = store();
        let mut snapshot = snapshot();
        store.write_study(&snapshot).unwrap();

        snapshot.sources.retain(|s| s.id != id(9));
        snapshot.scenarios[0].items.reverse();
        let live = store.write_study(&snapshot).unwrap();
        assert_eq!(live, vec![id(1), id(2), id(7)]);
        let restored = store.read_study().unwrap();
        assert_eq!(restored.scenarios[0].items[0].source_id, id(7));
    }

    #[test]
    fn reading_an_empty_database_fails() {
        let (_dir, store) = store();
        assert!(matches!(store.read_study(), Err(ScenarioError::Database(_))));
    }

    #[test]
    fn failed_write_leaves_previous_study() {
        let (_dir, store) = store();
        let good = snapshot();
        store.write_study(&good).unwrap();

        let mut bad = good.clone();
        bad.scenarios[0].items.push(SourceListItem::new(id(300), false, true));
        assert!(store.write_study(&bad).is_err());
        assert_eq!(store.read_study().unwrap(), good);
    }

    #[test]
    fn backup_copies_study() {
        let (dir, store) = store();
        store.write_study(&snapshot()).unwrap();
        let copy_path = store.backup_to(dir.path().join("copy.db")).unwrap();
        let copy = SqliteStudyStore::new(copy_path).unwrap();
        assert_eq!(copy.read_study().unwrap(), snapshot());
    }
}
