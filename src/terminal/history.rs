//! Shell history line parsing and command classification.

use crate::model::CommandType;
use chrono::{DateTime, Utc};

/// Shell that wrote a history file, which decides its line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellKind {
    Bash,
    Zsh,
    Fish,
}

impl ShellKind {
    /// Guess the format from a history file name.
    pub fn from_file_name(name: &str) -> Self {
        if name.contains("fish") {
            ShellKind::Fish
        } else if name.contains("zsh") || name.contains("zhistory") {
            ShellKind::Zsh
        } else {
            ShellKind::Bash
        }
    }
}

/// One command recovered from history, before context is attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub command: String,
    pub executed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

const SKIPPED: &[&str] = &["ls", "cd", "pwd", "clear", "exit", "history"];

const DANGEROUS: &[&str] = &["rm", "sudo", "chmod", "chown", "kill", "dd", "fdisk"];

const CATEGORIES: &[(CommandType, &[&str])] = &[
    (CommandType::Git, &["git"]),
    (
        CommandType::PackageManager,
        &[
            "npm", "yarn", "pnpm", "pip", "pip3", "uv", "brew", "apt", "apt-get", "gem", "poetry",
        ],
    ),
    (
        CommandType::Python,
        &["python", "python3", "pytest", "black", "isort", "mypy"],
    ),
    (
        CommandType::Build,
        &["make", "cmake", "cargo", "mvn", "gradle", "go"],
    ),
    (CommandType::Editor, &["vim", "nvim", "nano", "emacs", "code"]),
    (
        CommandType::File,
        &[
            "mkdir", "rm", "cp", "mv", "find", "grep", "cat", "less", "head", "tail", "touch",
        ],
    ),
    (
        CommandType::System,
        &["sudo", "chmod", "chown", "ps", "kill", "top", "htop"],
    ),
    (CommandType::Network, &["curl", "wget", "ssh", "scp", "ping"]),
];

/// The program name of a command line, without any directory prefix.
fn program(command: &str) -> &str {
    let first = command.split_whitespace().next().unwrap_or("");
    first.rsplit('/').next().unwrap_or(first)
}

/// Whether a command is too trivial to record.
pub fn is_skipped(command: &str) -> bool {
    SKIPPED.contains(&program(command))
}

/// Classify a command and flag destructive ones.
pub fn classify(command: &str) -> (CommandType, bool) {
    let program = program(command);
    let command_type = CATEGORIES
        .iter()
        .find(|(_, programs)| programs.contains(&program))
        .map(|(kind, _)| *kind)
        .unwrap_or(CommandType::Other);
    let dangerous = DANGEROUS.contains(&program) || command.contains("rm -rf");
    (command_type, dangerous)
}

/// Parse a chunk of complete history lines.
pub fn parse_lines(shell: ShellKind, text: &str) -> Vec<HistoryEntry> {
    match shell {
        ShellKind::Fish => parse_fish(text),
        ShellKind::Zsh | ShellKind::Bash => parse_plain(text),
    }
}

/// bash (optionally with `#<epoch>` stamps) and zsh (optionally extended).
fn parse_plain(text: &str) -> Vec<HistoryEntry> {
    let mut entries = Vec::new();
    let mut stamp: Option<DateTime<Utc>> = None;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_prefix('#') {
            // HISTTIMEFORMAT writes a `#<epoch>` line before each command
            stamp = rest
                .parse::<i64>()
                .ok()
                .and_then(|secs| DateTime::from_timestamp(secs, 0));
            continue;
        }

        let entry = parse_zsh_extended(line).unwrap_or_else(|| HistoryEntry {
            command: line.to_string(),
            executed_at: stamp.take(),
            duration_ms: None,
        });
        if !entry.command.is_empty() {
            entries.push(entry);
        }
    }

    entries
}

/// `: <epoch>:<elapsed>;<command>`
fn parse_zsh_extended(line: &str) -> Option<HistoryEntry> {
    let rest = line.strip_prefix(':')?.trim_start();
    let (meta, command) = rest.split_once(';')?;
    let (epoch, elapsed) = meta.split_once(':')?;
    let epoch: i64 = epoch.trim().parse().ok()?;
    let elapsed: i64 = elapsed.trim().parse().ok()?;

    Some(HistoryEntry {
        command: command.trim().to_string(),
        executed_at: DateTime::from_timestamp(epoch, 0),
        duration_ms: Some(elapsed * 1000),
    })
}

/// fish: `- cmd: <command>` followed by `  when: <epoch>`.
fn parse_fish(text: &str) -> Vec<HistoryEntry> {
    let mut entries: Vec<HistoryEntry> = Vec::new();

    for line in text.lines() {
        let trimmed = line.trim();
        if let Some(command) = trimmed.strip_prefix("- cmd:") {
            entries.push(HistoryEntry {
                command: command.trim().replace("\\n", "\n"),
                executed_at: None,
                duration_ms: None,
            });
        } else if let Some(when) = trimmed.strip_prefix("when:") {
            if let Some(last) = entries.last_mut() {
                if last.executed_at.is_none() {
                    last.executed_at = when
                        .trim()
                        .parse::<i64>()
                        .ok()
                        .and_then(|secs| DateTime::from_timestamp(secs, 0));
                }
            }
        }
    }

    entries.retain(|entry| !entry.command.is_empty());
    entries
}
