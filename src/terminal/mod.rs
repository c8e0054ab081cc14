//! Terminal command tracking by tailing shell history files.
//!
//! Only commands appended after the tracker starts are reported. Exit codes
//! are not recorded in history files and are left unknown.

pub mod context;
pub mod history;

use crate::config::TerminalConfig;
use crate::model::TerminalCommandRecord;
use chrono::Utc;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

pub use history::{classify, HistoryEntry, ShellKind};

/// Default history files, relative to the home directory.
const DEFAULT_HISTORY_FILES: &[&str] = &[
    ".bash_history",
    ".zsh_history",
    ".zhistory",
    ".local/share/fish/fish_history",
];

#[derive(Debug)]
struct WatchedFile {
    path: PathBuf,
    shell: ShellKind,
    offset: u64,
}

impl WatchedFile {
    fn new(path: PathBuf) -> Self {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        // Start at the current end so existing history is not imported
        let offset = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        Self {
            shell: ShellKind::from_file_name(&name),
            path,
            offset,
        }
    }

    /// Complete lines appended since the last read.
    fn read_new(&mut self) -> io::Result<Option<String>> {
        let len = match std::fs::metadata(&self.path) {
            Ok(metadata) => metadata.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.offset = 0;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        if len < self.offset {
            // Truncated or rewritten (e.g. history dedup): resume from the new end
            tracing::debug!(path = %self.path.display(), "history file shrank, resetting offset");
            self.offset = len;
            return Ok(None);
        }
        if len == self.offset {
            return Ok(None);
        }

        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(self.offset))?;
        let mut bytes = Vec::with_capacity((len - self.offset) as usize);
        file.take(len - self.offset).read_to_end(&mut bytes)?;

        // Leave a partially written last line for the next poll
        let Some(end) = bytes.iter().rposition(|b| *b == b'\n') else {
            return Ok(None);
        };
        bytes.truncate(end + 1);
        self.offset += bytes.len() as u64;

        Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
    }
}

/// Tails shell history files and turns new lines into command records.
#[derive(Debug)]
pub struct TerminalTracker {
    files: Vec<WatchedFile>,
    working_directory: Option<PathBuf>,
}

impl TerminalTracker {
    pub fn new(config: &TerminalConfig) -> Self {
        let paths = if config.history_files.is_empty() {
            default_history_files()
        } else {
            config.history_files.clone()
        };
        Self::with_files(paths, config.working_directory.clone())
    }

    pub fn with_files(paths: Vec<PathBuf>, working_directory: Option<PathBuf>) -> Self {
        let files: Vec<_> = paths.into_iter().map(WatchedFile::new).collect();
        tracing::debug!(files = files.len(), "terminal tracker watching history files");
        Self {
            files,
            working_directory,
        }
    }

    pub fn working_directory(&self) -> Option<PathBuf> {
        self.working_directory
            .clone()
            .or_else(|| std::env::current_dir().ok())
    }

    /// Read newly appended commands from every watched file.
    ///
    /// Errors on one file are logged and do not affect the others.
    pub fn poll(&mut self) -> Vec<TerminalCommandRecord> {
        let working_directory = self.working_directory();
        let git_branch = working_directory.as_deref().and_then(context::git_branch);
        let project_type = working_directory
            .as_deref()
            .and_then(context::project_type)
            .map(str::to_string);
        let working_directory = working_directory.map(|dir| dir.display().to_string());

        let mut records = Vec::new();
        for file in &mut self.files {
            let text = match file.read_new() {
                Ok(Some(text)) => text,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(path = %file.path.display(), error = %e, "failed to read history file");
                    continue;
                }
            };

            for entry in history::parse_lines(file.shell, &text) {
                if history::is_skipped(&entry.command) {
                    continue;
                }
                let (command_type, is_dangerous) = classify(&entry.command);
                records.push(TerminalCommandRecord {
                    session_id: None,
                    command: entry.command,
                    command_type,
                    is_dangerous,
                    working_directory: working_directory.clone(),
                    git_branch: git_branch.clone(),
                    project_type: project_type.clone(),
                    exit_code: None,
                    duration_ms: entry.duration_ms,
                    executed_at: entry.executed_at.unwrap_or_else(Utc::now),
                });
            }
        }
        records
    }
}

fn default_history_files() -> Vec<PathBuf> {
    let Some(home) = dirs::home_dir() else {
        return Vec::new();
    };
    DEFAULT_HISTORY_FILES
        .iter()
        .map(|relative| home.join(Path::new(relative)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CommandType;
    use std::fs::OpenOptions;
    use std::io::Write;

    fn append(path: &Path, text: &str) {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        file.write_all(text.as_bytes()).unwrap();
    }

    #[test]
    fn test_existing_history_is_not_imported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".bash_history");
        append(&path, "git log\nmake\n");

        let mut tracker = TerminalTracker::with_files(vec![path.clone()], Some(dir.path().into()));
        assert!(tracker.poll().is_empty());

        append(&path, "git push\nls\n");
        let records = tracker.poll();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].command, "git push");
        assert_eq!(records[0].command_type, CommandType::Git);
        assert_eq!(records[0].exit_code, None);
        assert!(tracker.poll().is_empty());
    }

    #[test]
    fn test_partial_line_waits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".zsh_history");
        let mut tracker = TerminalTracker::with_files(vec![path.clone()], Some(dir.path().into()));

        append(&path, ": 1700000000:2;cargo te");
        assert!(tracker.poll().is_empty());
        append(&path, "st\n");

        let records = tracker.poll();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].command, "cargo test");
        assert_eq!(records[0].duration_ms, Some(2000));
        assert_eq!(records[0].executed_at.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_shrunk_file_resets_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".bash_history");
        append(&path, "one\ntwo\nthree\n");
        let mut tracker = TerminalTracker::with_files(vec![path.clone()], Some(dir.path().into()));

        std::fs::write(&path, "x\n").unwrap();
        assert!(tracker.poll().is_empty());
        append(&path, "curl example.com\n");
        assert_eq!(tracker.poll()[0].command, "curl example.com");
    }

    #[test]
    fn test_context_is_attached() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("go.mod"), "module x\n").unwrap();
        let path = dir.path().join(".bash_history");
        let mut tracker = TerminalTracker::with_files(vec![path.clone()], Some(dir.path().into()));

        append(&path, "go build ./...\n");
        let records = tracker.poll();
        assert_eq!(records[0].project_type.as_deref(), Some("go"));
        assert_eq!(
            records[0].working_directory.as_deref(),
            Some(dir.path().display().to_string().as_str())
        );
    }
}
