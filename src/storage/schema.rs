//! Database schema.
//!
//! Every statement is `IF NOT EXISTS`, so applying the schema to an existing
//! database is a no-op. Times are stored as UTC milliseconds since the epoch.

use rusqlite::Connection;

pub const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS processes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    bundle_id TEXT NOT NULL DEFAULT '',
    created_at INTEGER NOT NULL,
    UNIQUE (name, bundle_id)
);

CREATE TABLE IF NOT EXISTS windows (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    process_id INTEGER NOT NULL REFERENCES processes(id),
    title TEXT NOT NULL,
    x INTEGER NOT NULL,
    y INTEGER NOT NULL,
    w INTEGER NOT NULL,
    h INTEGER NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS keys (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    process_id INTEGER NOT NULL REFERENCES processes(id),
    payload BLOB NOT NULL,
    count INTEGER NOT NULL,
    encrypted INTEGER NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS clicks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    process_id INTEGER NOT NULL REFERENCES processes(id),
    x INTEGER NOT NULL,
    y INTEGER NOT NULL,
    button INTEGER NOT NULL,
    event_type TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS terminal_sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    shell_type TEXT NOT NULL,
    working_directory TEXT,
    started_at INTEGER NOT NULL,
    ended_at INTEGER
);

CREATE TABLE IF NOT EXISTS terminal_commands (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id INTEGER REFERENCES terminal_sessions(id),
    command TEXT NOT NULL,
    command_type TEXT NOT NULL,
    is_dangerous INTEGER NOT NULL DEFAULT 0,
    working_directory TEXT,
    git_branch TEXT,
    project_type TEXT,
    exit_code INTEGER,
    duration_ms INTEGER,
    executed_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_windows_created ON windows(created_at);
CREATE INDEX IF NOT EXISTS idx_windows_process_created ON windows(process_id, created_at);
CREATE INDEX IF NOT EXISTS idx_keys_created ON keys(created_at);
CREATE INDEX IF NOT EXISTS idx_keys_process_created ON keys(process_id, created_at);
CREATE INDEX IF NOT EXISTS idx_clicks_created ON clicks(created_at);
CREATE INDEX IF NOT EXISTS idx_clicks_process_created ON clicks(process_id, created_at);
CREATE INDEX IF NOT EXISTS idx_terminal_sessions_started ON terminal_sessions(started_at);
CREATE INDEX IF NOT EXISTS idx_terminal_commands_executed ON terminal_commands(executed_at);
CREATE INDEX IF NOT EXISTS idx_terminal_commands_session ON terminal_commands(session_id, executed_at);
"#;

/// Create any missing tables and indexes.
pub fn apply(conn: &mut Connection) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;
    tx.execute_batch(SCHEMA)?;
    tx.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    tx.commit()
}
