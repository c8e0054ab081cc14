//! Records that travel from the monitor through the buffers into storage.

use crate::buffer::BufferKind;
use crate::capture::{Bounds, MouseButton, MouseEventKind};
use crate::storage::{EventSink, StorageError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The owning application of an event, resolved to a process row on write.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessRef {
    pub name: String,
    pub bundle_id: Option<String>,
}

impl ProcessRef {
    pub fn new(name: impl Into<String>, bundle_id: Option<String>) -> Self {
        Self {
            name: name.into(),
            bundle_id,
        }
    }

    /// Placeholder used when no window has been observed yet.
    pub fn unknown() -> Self {
        Self::new("unknown", None)
    }
}

/// A run of identical consecutive keys in one application.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyRecord {
    pub process: ProcessRef,
    pub pid: Option<i32>,
    /// Ciphertext when `encrypted`, otherwise the raw text (or empty in count-only mode)
    pub payload: Vec<u8>,
    pub count: u32,
    pub encrypted: bool,
    pub created_at: DateTime<Utc>,
}

impl fmt::Debug for KeyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Payloads never reach logs
        f.debug_struct("KeyRecord")
            .field("process", &self.process.name)
            .field("payload_len", &self.payload.len())
            .field("count", &self.count)
            .field("encrypted", &self.encrypted)
            .field("created_at", &self.created_at)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MouseRecord {
    pub process: ProcessRef,
    pub pid: Option<i32>,
    pub x: i32,
    pub y: i32,
    pub button: MouseButton,
    pub kind: MouseEventKind,
    pub created_at: DateTime<Utc>,
}

/// A focus change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowRecord {
    pub process: ProcessRef,
    pub pid: i32,
    pub title: String,
    pub bounds: Bounds,
    pub created_at: DateTime<Utc>,
}

/// Classification of a shell command by its first word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    Git,
    PackageManager,
    Python,
    Build,
    Editor,
    File,
    System,
    Network,
    Other,
}

impl CommandType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandType::Git => "git",
            CommandType::PackageManager => "package_manager",
            CommandType::Python => "python",
            CommandType::Build => "build",
            CommandType::Editor => "editor",
            CommandType::File => "file",
            CommandType::System => "system",
            CommandType::Network => "network",
            CommandType::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "git" => CommandType::Git,
            "package_manager" => CommandType::PackageManager,
            "python" => CommandType::Python,
            "build" => CommandType::Build,
            "editor" => CommandType::Editor,
            "file" => CommandType::File,
            "system" => CommandType::System,
            "network" => CommandType::Network,
            _ => CommandType::Other,
        }
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A command read from shell history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalCommandRecord {
    pub session_id: Option<i64>,
    pub command: String,
    pub command_type: CommandType,
    pub is_dangerous: bool,
    pub working_directory: Option<String>,
    pub git_branch: Option<String>,
    pub project_type: Option<String>,
    /// Unknown when read from history
    pub exit_code: Option<i32>,
    pub duration_ms: Option<i64>,
    pub executed_at: DateTime<Utc>,
}

/// One monitor run's terminal session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalSession {
    pub shell_type: String,
    pub working_directory: Option<String>,
    pub started_at: DateTime<Utc>,
}

/// A record kind that can be written to an [`EventSink`] as one batch.
pub trait Persist: Sized + Send + 'static {
    const KIND: BufferKind;

    /// Write the whole batch in one transaction, returning rows written.
    fn persist(sink: &dyn EventSink, batch: &[Self]) -> Result<usize, StorageError>;
}

impl Persist for KeyRecord {
    const KIND: BufferKind = BufferKind::Keys;

    fn persist(sink: &dyn EventSink, batch: &[Self]) -> Result<usize, StorageError> {
        sink.insert_keys(batch)
    }
}

impl Persist for MouseRecord {
    const KIND: BufferKind = BufferKind::Mouse;

    fn persist(sink: &dyn EventSink, batch: &[Self]) -> Result<usize, StorageError> {
        sink.insert_clicks(batch)
    }
}

impl Persist for WindowRecord {
    const KIND: BufferKind = BufferKind::Windows;

    fn persist(sink: &dyn EventSink, batch: &[Self]) -> Result<usize, StorageError> {
        sink.insert_windows(batch)
    }
}

impl Persist for TerminalCommandRecord {
    const KIND: BufferKind = BufferKind::Terminal;

    fn persist(sink: &dyn EventSink, batch: &[Self]) -> Result<usize, StorageError> {
        sink.insert_terminal_commands(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_type_names() {
        for kind in [
            CommandType::Git,
            CommandType::PackageManager,
            CommandType::Python,
            CommandType::Network,
        ] {
            assert_eq!(CommandType::parse(kind.as_str()), kind);
        }
        assert_eq!(CommandType::parse("weird"), CommandType::Other);
    }

    #[test]
    fn test_key_record_debug_hides_payload() {
        let record = KeyRecord {
            process: ProcessRef::new("Editor", None),
            pid: None,
            payload: b"hunter2".to_vec(),
            count: 1,
            encrypted: false,
            created_at: Utc::now(),
        };
        let debug = format!("{record:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("payload_len: 7"));
    }
}
