#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SqliteMigration {
    pub version: i64,
    pub name: &'static str,
    pub up_sql: &'static str,
    pub down_sql: &'static str,
}

const MIGRATION_0001: SqliteMigration = SqliteMigration {
    version: 1,
    name: "initial_dispatch_schema",
    up_sql: r#"
CREATE TABLE IF NOT EXISTS queued_calls (
    call_request_id TEXT PRIMARY KEY,
    group_id TEXT,
    callable_name TEXT NOT NULL,
    state TEXT NOT NULL,
    enqueue_time_unix INTEGER NOT NULL,
    snapshot_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_queued_calls_enqueue_time
    ON queued_calls (enqueue_time_unix ASC);

CREATE TABLE IF NOT EXISTS archived_calls (
    archive_id INTEGER PRIMARY KEY AUTOINCREMENT,
    call_request_id TEXT NOT NULL,
    group_id TEXT,
    callable_name TEXT NOT NULL,
    state TEXT NOT NULL,
    start_time_unix INTEGER,
    finish_time_unix INTEGER,
    snapshot_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_archived_calls_finish
    ON archived_calls (finish_time_unix DESC, archive_id DESC);
"#,
    down_sql: r#"
DROP INDEX IF EXISTS idx_archived_calls_finish;
DROP TABLE IF EXISTS archived_calls;
DROP INDEX IF EXISTS idx_queued_calls_enqueue_time;
DROP TABLE IF EXISTS queued_calls;
"#,
};

const MIGRATIONS: [SqliteMigration; 1] = [MIGRATION_0001];

pub fn migrations() -> &'static [SqliteMigration] {
    &MIGRATIONS
}

pub fn migration(version: i64) -> Option<&'static SqliteMigration> {
    MIGRATIONS.iter().find(|entry| entry.version == version)
}

pub fn current_schema_version() -> i64 {
    MIGRATIONS.last().map(|entry| entry.version).unwrap_or(0)
}
