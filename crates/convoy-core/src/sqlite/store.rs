use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{Connection, params};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::models::call_request::CallRequestId;
use crate::models::error::DispatchError;
use crate::models::snapshot::{ArchivedCallSnapshot, QueuedCallSnapshot};
use crate::persistence::{DispatchStore, MigrationStore, PersistenceResult};
use crate::sqlite::migrations::{SqliteMigration, current_schema_version, migration, migrations};

const MIGRATIONS_TABLE: &str = "convoy_schema_migrations";

/// Durable persistence gateway over a local sqlite database.
///
/// Queued and archived calls carry their full snapshot as a JSON column;
/// the scalar columns exist for indexed lookups and pruning.
pub struct SqliteDispatchStore {
    database_path: PathBuf,
}

impl SqliteDispatchStore {
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: database_path.into(),
        }
    }

    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    pub fn migrate_to_latest(&self) -> PersistenceResult<()> {
        self.apply_migration(current_schema_version())
    }

    fn with_connection<T>(
        &self,
        operation_name: &str,
        operation: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> PersistenceResult<T> {
        let mut connection = open_connection(&self.database_path)
            .map_err(|error| storage_error(operation_name, error))?;
        operation(&mut connection).map_err(|error| storage_error(operation_name, error))
    }
}

impl MigrationStore for SqliteDispatchStore {
    fn current_version(&self) -> PersistenceResult<i64> {
        self.with_connection("current_version", |connection| {
            ensure_migrations_table(connection)?;
            read_current_version(connection)
        })
    }

    fn apply_migration(&self, target_version: i64) -> PersistenceResult<()> {
        if target_version < 0 || target_version > current_schema_version() {
            return Err(storage_error_text(
                "apply_migration",
                format!("invalid migration target version '{target_version}'"),
            ));
        }

        if target_version > 0 && migration(target_version).is_none() {
            return Err(storage_error_text(
                "apply_migration",
                format!("migration version '{target_version}' is not defined"),
            ));
        }

        self.with_connection("apply_migration", |connection| {
            ensure_migrations_table(connection)?;
            let current_version = read_current_version(connection)?;

            if target_version == current_version {
                // All DDL uses IF NOT EXISTS; re-applying repairs a database
                // whose version row survived but whose tables did not.
                for version in 1..=target_version {
                    if let Some(entry) = migration(version) {
                        connection.execute_batch(entry.up_sql)?;
                    }
                }
                return Ok(());
            }

            if target_version > current_version {
                for version in (current_version + 1)..=target_version {
                    if let Some(entry) = migration(version) {
                        apply_up_migration(connection, entry)?;
                    }
                }
            } else {
                for version in ((target_version + 1)..=current_version).rev() {
                    if let Some(entry) = migration(version) {
                        apply_down_migration(connection, entry)?;
                    }
                }
            }

            Ok(())
        })
    }
}

impl DispatchStore for SqliteDispatchStore {
    fn save_queued(&self, snapshot: &QueuedCallSnapshot) -> PersistenceResult<()> {
        self.with_connection("save_queued", |connection| {
            ensure_schema_ready(connection)?;
            connection.execute(
                "
INSERT OR REPLACE INTO queued_calls (
    call_request_id, group_id, callable_name, state, enqueue_time_unix, snapshot_json
) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
",
                params![
                    snapshot.id.to_string(),
                    snapshot.group_id.map(|group_id| group_id.to_string()),
                    snapshot.callable_name.as_str(),
                    snapshot.state.as_str(),
                    to_unix_seconds(snapshot.enqueue_time)?,
                    to_json(snapshot)?,
                ],
            )?;
            Ok(())
        })
    }

    fn remove_queued(&self, id: CallRequestId) -> PersistenceResult<()> {
        self.with_connection("remove_queued", |connection| {
            ensure_schema_ready(connection)?;
            connection.execute(
                "DELETE FROM queued_calls WHERE call_request_id = ?1",
                [id.to_string()],
            )?;
            Ok(())
        })
    }

    fn load_queued(&self) -> PersistenceResult<Vec<QueuedCallSnapshot>> {
        self.with_connection("load_queued", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(
                "
SELECT snapshot_json
FROM queued_calls
ORDER BY enqueue_time_unix ASC, call_request_id ASC
",
            )?;
            let rows = statement.query_map([], |row| {
                let raw: String = row.get(0)?;
                from_json::<QueuedCallSnapshot>(&raw)
            })?;
            rows.collect()
        })
    }

    fn save_archived(&self, snapshot: &ArchivedCallSnapshot) -> PersistenceResult<()> {
        self.with_connection("save_archived", |connection| {
            ensure_schema_ready(connection)?;
            connection.execute(
                "
INSERT INTO archived_calls (
    call_request_id, group_id, callable_name, state, start_time_unix, finish_time_unix, snapshot_json
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
",
                params![
                    snapshot.id.to_string(),
                    snapshot.group_id.map(|group_id| group_id.to_string()),
                    snapshot.callable_name.as_str(),
                    snapshot.state.as_str(),
                    snapshot.start_time.map(to_unix_seconds).transpose()?,
                    snapshot.finish_time.map(to_unix_seconds).transpose()?,
                    to_json(snapshot)?,
                ],
            )?;
            Ok(())
        })
    }

    fn list_archived(&self, limit: usize) -> PersistenceResult<Vec<ArchivedCallSnapshot>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        self.with_connection("list_archived", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(
                "
SELECT snapshot_json
FROM archived_calls
ORDER BY finish_time_unix DESC, archive_id DESC
LIMIT ?1
",
            )?;
            let rows = statement.query_map(params![to_i64(limit)?], |row| {
                let raw: String = row.get(0)?;
                from_json::<ArchivedCallSnapshot>(&raw)
            })?;
            rows.collect()
        })
    }
}

fn open_connection(database_path: &Path) -> rusqlite::Result<Connection> {
    if let Some(parent) = database_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|error| rusqlite::Error::ToSqlConversionFailure(Box::new(error)))?;
    }
    Connection::open(database_path)
}

fn ensure_migrations_table(connection: &Connection) -> rusqlite::Result<()> {
    connection.execute_batch(
        "
CREATE TABLE IF NOT EXISTS convoy_schema_migrations (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at_unix INTEGER NOT NULL
);
",
    )?;
    Ok(())
}

fn ensure_schema_ready(connection: &Connection) -> rusqlite::Result<()> {
    ensure_migrations_table(connection)?;
    let version = read_current_version(connection)?;
    if version <= 0 {
        return Err(storage_error_sqlite(
            "database schema is not initialized; apply migrations before dispatch operations",
        ));
    }
    Ok(())
}

fn read_current_version(connection: &Connection) -> rusqlite::Result<i64> {
    connection.query_row(
        &format!("SELECT COALESCE(MAX(version), 0) FROM {MIGRATIONS_TABLE}"),
        [],
        |row| row.get(0),
    )
}

fn apply_up_migration(
    connection: &mut Connection,
    migration: &SqliteMigration,
) -> rusqlite::Result<()> {
    let transaction = connection.transaction()?;
    transaction.execute_batch(migration.up_sql)?;
    transaction.execute(
        &format!(
            "INSERT INTO {MIGRATIONS_TABLE} (version, name, applied_at_unix)
             VALUES (?1, ?2, strftime('%s', 'now'))"
        ),
        (migration.version, migration.name),
    )?;
    transaction.commit()?;
    Ok(())
}

fn apply_down_migration(
    connection: &mut Connection,
    migration: &SqliteMigration,
) -> rusqlite::Result<()> {
    let transaction = connection.transaction()?;
    transaction.execute_batch(migration.down_sql)?;
    transaction.execute(
        &format!("DELETE FROM {MIGRATIONS_TABLE} WHERE version = ?1"),
        [migration.version],
    )?;
    transaction.commit()?;
    Ok(())
}

fn to_json<T: Serialize>(value: &T) -> rusqlite::Result<String> {
    serde_json::to_string(value).map_err(|error| {
        storage_error_sqlite(&format!("failed to encode snapshot json: {error}"))
    })
}

fn from_json<T: DeserializeOwned>(raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(|error| {
        storage_error_sqlite(&format!("malformed snapshot json in sqlite record: {error}"))
    })
}

fn to_unix_seconds(value: SystemTime) -> rusqlite::Result<i64> {
    let duration = value.duration_since(UNIX_EPOCH).map_err(|error| {
        storage_error_sqlite(&format!("time before unix epoch is not supported: {error}"))
    })?;
    i64::try_from(duration.as_secs())
        .map_err(|_| storage_error_sqlite("unix timestamp seconds exceed i64 range"))
}

fn to_i64(value: usize) -> rusqlite::Result<i64> {
    i64::try_from(value).map_err(|_| storage_error_sqlite("value exceeds i64 range"))
}

fn storage_error(operation: &str, error: rusqlite::Error) -> DispatchError {
    storage_error_text(operation, error.to_string())
}

fn storage_error_text(operation: &str, message: impl AsRef<str>) -> DispatchError {
    DispatchError::storage(format!(
        "sqlite store '{operation}' failed: {}",
        message.as_ref()
    ))
}

fn storage_error_sqlite(message: &str) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(Box::new(std::io::Error::other(message.to_string())))
}
