//! SQLite persistence for captured events.
//!
//! A single connection behind a mutex: the flusher is the only writer and
//! stats queries take the same lock briefly. Each flushed batch is written in
//! one transaction.

pub mod queries;
pub mod schema;

use crate::model::{
    KeyRecord, MouseRecord, ProcessRef, TerminalCommandRecord, TerminalSession, WindowRecord,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Transaction};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

pub use queries::{ClickRow, CommandRow, ExportRows, KeyRow, RowCounts, WindowRow};

/// Errors from the database layer.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("database directory error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Where the monitor writes flushed batches.
///
/// Implemented by [`Storage`]; tests substitute failing or recording sinks.
pub trait EventSink: Send + Sync {
    fn insert_windows(&self, batch: &[WindowRecord]) -> Result<usize, StorageError>;
    fn insert_keys(&self, batch: &[KeyRecord]) -> Result<usize, StorageError>;
    fn insert_clicks(&self, batch: &[MouseRecord]) -> Result<usize, StorageError>;
    fn insert_terminal_commands(
        &self,
        batch: &[TerminalCommandRecord],
    ) -> Result<usize, StorageError>;
    fn open_terminal_session(&self, session: &TerminalSession) -> Result<i64, StorageError>;
    fn close_terminal_session(&self, id: i64, ended_at: DateTime<Utc>) -> Result<(), StorageError>;
}

/// The activity database.
pub struct Storage {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl Storage {
    /// Open (creating if needed) the database at `path` and apply the schema.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        if let Err(e) = conn.pragma_update(None, "journal_mode", "WAL") {
            tracing::warn!(error = %e, "failed to enable WAL mode");
        }
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let storage = Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        };
        storage.initialize()?;
        tracing::info!(path = %path.display(), "database opened");
        Ok(storage)
    }

    /// A private in-memory database.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let storage = Self {
            conn: Mutex::new(conn),
            path: None,
        };
        storage.initialize()?;
        Ok(storage)
    }

    /// Create missing tables and indexes. Safe to call repeatedly.
    pub fn initialize(&self) -> Result<(), StorageError> {
        let mut conn = self.lock();
        schema::apply(&mut conn)?;
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Id of the process row for `(name, bundle_id)`, inserting it if absent.
    pub fn get_or_create_process(
        &self,
        name: &str,
        bundle_id: Option<&str>,
    ) -> Result<i64, StorageError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let id = process_id(&tx, name, bundle_id)?;
        tx.commit()?;
        Ok(id)
    }

    /// Run `write` for each record inside one transaction.
    fn write_batch<T>(
        &self,
        batch: &[T],
        mut write: impl FnMut(&Transaction<'_>, &mut ProcessCache, &T) -> rusqlite::Result<()>,
    ) -> Result<usize, StorageError> {
        if batch.is_empty() {
            return Ok(0);
        }

        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let mut cache = ProcessCache::default();
        for record in batch {
            write(&tx, &mut cache, record)?;
        }
        tx.commit()?;
        Ok(batch.len())
    }
}

/// Process ids resolved within one transaction.
#[derive(Default)]
struct ProcessCache {
    ids: HashMap<ProcessRef, i64>,
}

impl ProcessCache {
    fn resolve(&mut self, tx: &Transaction<'_>, process: &ProcessRef) -> rusqlite::Result<i64> {
        if let Some(id) = self.ids.get(process) {
            return Ok(*id);
        }
        let id = process_id(tx, &process.name, process.bundle_id.as_deref())?;
        self.ids.insert(process.clone(), id);
        Ok(id)
    }
}

/// Insert-or-ignore then select, so concurrent creators converge on one row.
fn process_id(conn: &Connection, name: &str, bundle_id: Option<&str>) -> rusqlite::Result<i64> {
    let bundle_id = bundle_id.unwrap_or("");
    conn.execute(
        "INSERT OR IGNORE INTO processes (name, bundle_id, created_at) VALUES (?1, ?2, ?3)",
        params![name, bundle_id, Utc::now().timestamp_millis()],
    )?;
    conn.query_row(
        "SELECT id FROM processes WHERE name = ?1 AND bundle_id = ?2",
        params![name, bundle_id],
        |row| row.get(0),
    )
}

impl EventSink for Storage {
    fn insert_windows(&self, batch: &[WindowRecord]) -> Result<usize, StorageError> {
        self.write_batch(batch, |tx, cache, window| {
            let process_id = cache.resolve(tx, &window.process)?;
            tx.execute(
                "INSERT INTO windows (process_id, title, x, y, w, h, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    process_id,
                    window.title,
                    window.bounds.x,
                    window.bounds.y,
                    window.bounds.width,
                    window.bounds.height,
                    window.created_at.timestamp_millis(),
                ],
            )?;
            Ok(())
        })
    }

    fn insert_keys(&self, batch: &[KeyRecord]) -> Result<usize, StorageError> {
        self.write_batch(batch, |tx, cache, key| {
            let process_id = cache.resolve(tx, &key.process)?;
            tx.execute(
                "INSERT INTO keys (process_id, payload, count, encrypted, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    process_id,
                    key.payload,
                    key.count,
                    key.encrypted,
                    key.created_at.timestamp_millis(),
                ],
            )?;
            Ok(())
        })
    }

    fn insert_clicks(&self, batch: &[MouseRecord]) -> Result<usize, StorageError> {
        self.write_batch(batch, |tx, cache, click| {
            let process_id = cache.resolve(tx, &click.process)?;
            tx.execute(
                "INSERT INTO clicks (process_id, x, y, button, event_type, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    process_id,
                    click.x,
                    click.y,
                    click.button.code(),
                    click.kind.as_str(),
                    click.created_at.timestamp_millis(),
                ],
            )?;
            Ok(())
        })
    }

    fn insert_terminal_commands(
        &self,
        batch: &[TerminalCommandRecord],
    ) -> Result<usize, StorageError> {
        self.write_batch(batch, |tx, _cache, command| {
            tx.execute(
                "INSERT INTO terminal_commands (
                    session_id, command, command_type, is_dangerous, working_directory,
                    git_branch, project_type, exit_code, duration_ms, executed_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    command.session_id,
                    command.command,
                    command.command_type.as_str(),
                    command.is_dangerous,
                    command.working_directory,
                    command.git_branch,
                    command.project_type,
                    command.exit_code,
                    command.duration_ms,
                    command.executed_at.timestamp_millis(),
                ],
            )?;
            Ok(())
        })
    }

    fn open_terminal_session(&self, session: &TerminalSession) -> Result<i64, StorageError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO terminal_sessions (shell_type, working_directory, started_at)
             VALUES (?1, ?2, ?3)",
            params![
                session.shell_type,
                session.working_directory,
                session.started_at.timestamp_millis(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn close_terminal_session(&self, id: i64, ended_at: DateTime<Utc>) -> Result<(), StorageError> {
        let conn = self.lock();
        conn.execute(
            "UPDATE terminal_sessions SET ended_at = ?1 WHERE id = ?2",
            params![ended_at.timestamp_millis(), id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{Bounds, MouseButton, MouseEventKind};

    fn window(app: &str, title: &str) -> WindowRecord {
        WindowRecord {
            process: ProcessRef::new(app, None),
            pid: 42,
            title: title.to_string(),
            bounds: Bounds {
                x: 0,
                y: 0,
                width: 800,
                height: 600,
            },
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let storage = Storage::open_in_memory().unwrap();
        let a = storage.get_or_create_process("Terminal", None).unwrap();
        let b = storage.get_or_create_process("Terminal", None).unwrap();
        let c = storage
            .get_or_create_process("Terminal", Some("com.apple.Terminal"))
            .unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(storage.row_counts().unwrap().processes, 2);
    }

    #[test]
    fn test_batch_insert_counts() {
        let storage = Storage::open_in_memory().unwrap();
        let written = storage
            .insert_windows(&[window("Editor", "a.rs"), window("Editor", "b.rs")])
            .unwrap();
        assert_eq!(written, 2);

        let clicks = vec![MouseRecord {
            process: ProcessRef::new("Editor", None),
            pid: None,
            x: 10,
            y: 20,
            button: MouseButton::Left,
            kind: MouseEventKind::Click,
            created_at: Utc::now(),
        }];
        storage.insert_clicks(&clicks).unwrap();

        let counts = storage.row_counts().unwrap();
        assert_eq!(counts.windows, 2);
        assert_eq!(counts.clicks, 1);
        assert_eq!(counts.processes, 1);
        assert_eq!(storage.insert_keys(&[]).unwrap(), 0);
    }

    #[test]
    fn test_terminal_session_lifecycle() {
        let storage = Storage::open_in_memory().unwrap();
        let id = storage
            .open_terminal_session(&TerminalSession {
                shell_type: "zsh".into(),
                working_directory: Some("/tmp".into()),
                started_at: Utc::now(),
            })
            .unwrap();
        storage.close_terminal_session(id, Utc::now()).unwrap();

        let ended: Option<i64> = storage
            .lock()
            .query_row(
                "SELECT ended_at FROM terminal_sessions WHERE id = ?1",
                [id],
                |row| row.get(0),
            )
            .unwrap();
        assert!(ended.is_some());
    }

    #[test]
    fn test_open_on_disk_reinitializes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("footprint.db");

        let storage = Storage::open(&path).unwrap();
        storage.insert_windows(&[window("Editor", "a.rs")]).unwrap();
        drop(storage);

        let reopened = Storage::open(&path).unwrap();
        reopened.initialize().unwrap();
        assert_eq!(reopened.row_counts().unwrap().windows, 1);
    }
}
