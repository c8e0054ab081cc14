//! Read-side queries: statistics and raw export.

use super::{Storage, StorageError};
use crate::stats::{
    estimate_active_seconds, ActivityStats, AppUsage, TerminalSummary, TimelineEntry,
};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

/// Applications listed in [`ActivityStats::top_apps`].
const TOP_APPS: usize = 10;
const TOP_TERMINAL_ENTRIES: usize = 10;

/// Start of a `days`-long window ending now. Zero days means all time.
pub(crate) fn window_start(days: u32, now: DateTime<Utc>) -> DateTime<Utc> {
    if days == 0 {
        DateTime::<Utc>::UNIX_EPOCH
    } else {
        now - Duration::days(i64::from(days))
    }
}

fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

fn count(conn: &Connection, sql: &str, since: i64) -> rusqlite::Result<u64> {
    let value: i64 = conn.query_row(sql, params![since], |row| row.get(0))?;
    Ok(value.max(0) as u64)
}

/// Rows per table, for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowCounts {
    pub processes: u64,
    pub windows: u64,
    pub keys: u64,
    pub clicks: u64,
    pub terminal_sessions: u64,
    pub terminal_commands: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowRow {
    pub id: i64,
    pub application: String,
    pub bundle_id: String,
    pub title: String,
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRow {
    pub id: i64,
    pub application: String,
    pub bundle_id: String,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    /// Decrypted text, filled in only on request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    pub count: u32,
    pub encrypted: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClickRow {
    pub id: i64,
    pub application: String,
    pub x: i32,
    pub y: i32,
    pub button: i64,
    pub event_type: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRow {
    pub id: i64,
    pub session_id: Option<i64>,
    pub command: String,
    pub command_type: String,
    pub is_dangerous: bool,
    pub working_directory: Option<String>,
    pub git_branch: Option<String>,
    pub project_type: Option<String>,
    pub exit_code: Option<i32>,
    pub duration_ms: Option<i64>,
    pub executed_at: DateTime<Utc>,
}

/// Raw rows of every event table within a time window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExportRows {
    pub range_start: DateTime<Utc>,
    pub range_end: DateTime<Utc>,
    pub windows: Vec<WindowRow>,
    pub keys: Vec<KeyRow>,
    pub clicks: Vec<ClickRow>,
    pub terminal_commands: Vec<CommandRow>,
}

impl Storage {
    /// Aggregate activity over the last `days` days.
    pub fn get_stats(&self, days: u32) -> Result<ActivityStats, StorageError> {
        let now = Utc::now();
        let start = window_start(days, now);
        let since = start.timestamp_millis();
        let conn = self.lock();

        let keystrokes = count(
            &conn,
            "SELECT COALESCE(SUM(count), 0) FROM keys WHERE created_at >= ?1",
            since,
        )?;
        let clicks = count(
            &conn,
            "SELECT COUNT(*) FROM clicks WHERE created_at >= ?1",
            since,
        )?;
        let window_changes = count(
            &conn,
            "SELECT COUNT(*) FROM windows WHERE created_at >= ?1",
            since,
        )?;

        let mut stmt = conn.prepare(
            "SELECT p.name, COALESCE(SUM(k.count), 0) AS total
             FROM keys k JOIN processes p ON p.id = k.process_id
             WHERE k.created_at >= ?1
             GROUP BY p.name
             ORDER BY total DESC, p.name ASC
             LIMIT ?2",
        )?;
        let top_apps = stmt
            .query_map(params![since, TOP_APPS as i64], |row| {
                let name: String = row.get(0)?;
                let total: i64 = row.get(1)?;
                Ok((name, total.max(0) as u64))
            })?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|(name, keys)| AppUsage {
                percentage: if keystrokes == 0 {
                    0.0
                } else {
                    keys as f64 * 100.0 / keystrokes as f64
                },
                name,
                keystrokes: keys,
            })
            .collect();

        Ok(ActivityStats {
            keystrokes,
            clicks,
            window_changes,
            active_seconds: estimate_active_seconds(keystrokes, clicks, window_changes, days),
            top_apps,
            range_start: start,
            range_end: now,
        })
    }

    /// Key and click activity per local hour of day.
    pub(crate) fn hourly_activity_since(&self, since: i64) -> Result<[u64; 24], StorageError> {
        let conn = self.lock();
        let mut buckets = [0u64; 24];

        for sql in [
            "SELECT CAST(strftime('%H', created_at / 1000, 'unixepoch', 'localtime') AS INTEGER),
                    COALESCE(SUM(count), 0)
             FROM keys WHERE created_at >= ?1 GROUP BY 1",
            "SELECT CAST(strftime('%H', created_at / 1000, 'unixepoch', 'localtime') AS INTEGER),
                    COUNT(*)
             FROM clicks WHERE created_at >= ?1 GROUP BY 1",
        ] {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map(params![since], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (hour, total) = row?;
                if let Some(bucket) = buckets.get_mut(hour as usize) {
                    *bucket += total.max(0) as u64;
                }
            }
        }

        Ok(buckets)
    }

    /// Most recent window changes, newest first.
    ///
    /// Each entry carries the keystrokes typed into that application until
    /// the next window change.
    pub(crate) fn timeline_since(
        &self,
        since: i64,
        limit: usize,
    ) -> Result<Vec<TimelineEntry>, StorageError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT p.name, w.title, w.created_at,
                    (SELECT COALESCE(SUM(k.count), 0) FROM keys k
                     WHERE k.process_id = w.process_id
                       AND k.created_at >= w.created_at
                       AND k.created_at < COALESCE(
                           (SELECT MIN(n.created_at) FROM windows n WHERE n.created_at > w.created_at),
                           ?3))
             FROM windows w JOIN processes p ON p.id = w.process_id
             WHERE w.created_at >= ?1
             ORDER BY w.created_at DESC, w.id DESC
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![since, limit as i64, i64::MAX], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows
            .into_iter()
            .map(|(application, title, at, keys)| TimelineEntry {
                application,
                title,
                started_at: from_millis(at),
                keystrokes: keys.max(0) as u64,
            })
            .collect())
    }

    pub(crate) fn terminal_summary_since(&self, since: i64) -> Result<TerminalSummary, StorageError> {
        let conn = self.lock();

        let total_commands = count(
            &conn,
            "SELECT COUNT(*) FROM terminal_commands WHERE executed_at >= ?1",
            since,
        )?;
        let dangerous_commands = count(
            &conn,
            "SELECT COUNT(*) FROM terminal_commands WHERE is_dangerous = 1 AND executed_at >= ?1",
            since,
        )?;

        let grouped = |sql: &str| -> rusqlite::Result<Vec<(String, u64)>> {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map(params![since, TOP_TERMINAL_ENTRIES as i64], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?.max(0) as u64))
            })?;
            rows.collect()
        };

        Ok(TerminalSummary {
            total_commands,
            dangerous_commands,
            by_type: grouped(
                "SELECT command_type, COUNT(*) AS n FROM terminal_commands
                 WHERE executed_at >= ?1 GROUP BY command_type ORDER BY n DESC, command_type LIMIT ?2",
            )?,
            top_commands: grouped(
                "SELECT command, COUNT(*) AS n FROM terminal_commands
                 WHERE executed_at >= ?1 GROUP BY command ORDER BY n DESC, command LIMIT ?2",
            )?,
            top_projects: grouped(
                "SELECT project_type, COUNT(*) AS n FROM terminal_commands
                 WHERE executed_at >= ?1 AND project_type IS NOT NULL
                 GROUP BY project_type ORDER BY n DESC, project_type LIMIT ?2",
            )?,
        })
    }

    /// Every event row from the last `days` days, oldest first.
    pub fn export_rows(&self, days: u32) -> Result<ExportRows, StorageError> {
        let now = Utc::now();
        let start = window_start(days, now);
        let since = start.timestamp_millis();
        let conn = self.lock();

        let mut stmt = conn.prepare(
            "SELECT w.id, p.name, p.bundle_id, w.title, w.x, w.y, w.w, w.h, w.created_at
             FROM windows w JOIN processes p ON p.id = w.process_id
             WHERE w.created_at >= ?1 ORDER BY w.created_at, w.id",
        )?;
        let windows = stmt
            .query_map(params![since], |row| {
                Ok(WindowRow {
                    id: row.get(0)?,
                    application: row.get(1)?,
                    bundle_id: row.get(2)?,
                    title: row.get(3)?,
                    x: row.get(4)?,
                    y: row.get(5)?,
                    width: row.get(6)?,
                    height: row.get(7)?,
                    created_at: from_millis(row.get(8)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(
            "SELECT k.id, p.name, p.bundle_id, k.payload, k.count, k.encrypted, k.created_at
             FROM keys k JOIN processes p ON p.id = k.process_id
             WHERE k.created_at >= ?1 ORDER BY k.created_at, k.id",
        )?;
        let keys = stmt
            .query_map(params![since], |row| {
                Ok(KeyRow {
                    id: row.get(0)?,
                    application: row.get(1)?,
                    bundle_id: row.get(2)?,
                    payload: row.get(3)?,
                    text: None,
                    count: row.get(4)?,
                    encrypted: row.get(5)?,
                    created_at: from_millis(row.get(6)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(
            "SELECT c.id, p.name, c.x, c.y, c.button, c.event_type, c.created_at
             FROM clicks c JOIN processes p ON p.id = c.process_id
             WHERE c.created_at >= ?1 ORDER BY c.created_at, c.id",
        )?;
        let clicks = stmt
            .query_map(params![since], |row| {
                Ok(ClickRow {
                    id: row.get(0)?,
                    application: row.get(1)?,
                    x: row.get(2)?,
                    y: row.get(3)?,
                    button: row.get(4)?,
                    event_type: row.get(5)?,
                    created_at: from_millis(row.get(6)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(
            "SELECT id, session_id, command, command_type, is_dangerous, working_directory,
                    git_branch, project_type, exit_code, duration_ms, executed_at
             FROM terminal_commands WHERE executed_at >= ?1 ORDER BY executed_at, id",
        )?;
        let terminal_commands = stmt
            .query_map(params![since], |row| {
                Ok(CommandRow {
                    id: row.get(0)?,
                    session_id: row.get(1)?,
                    command: row.get(2)?,
                    command_type: row.get(3)?,
                    is_dangerous: row.get(4)?,
                    working_directory: row.get(5)?,
                    git_branch: row.get(6)?,
                    project_type: row.get(7)?,
                    exit_code: row.get(8)?,
                    duration_ms: row.get(9)?,
                    executed_at: from_millis(row.get(10)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ExportRows {
            range_start: start,
            range_end: now,
            windows,
            keys,
            clicks,
            terminal_commands,
        })
    }

    pub fn row_counts(&self) -> Result<RowCounts, StorageError> {
        let conn = self.lock();
        let table = |name: &str| -> rusqlite::Result<u64> {
            let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {name}"), [], |row| {
                row.get(0)
            })?;
            Ok(n.max(0) as u64)
        };

        Ok(RowCounts {
            processes: table("processes")?,
            windows: table("windows")?,
            keys: table("keys")?,
            clicks: table("clicks")?,
            terminal_sessions: table("terminal_sessions")?,
            terminal_commands: table("terminal_commands")?,
        })
    }
}

/// Serde support for byte payloads as standard base64.
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{MouseButton, MouseEventKind};
    use crate::model::{KeyRecord, MouseRecord, ProcessRef};
    use crate::storage::EventSink;

    fn key(app: &str, count: u32, at: DateTime<Utc>) -> KeyRecord {
        KeyRecord {
            process: ProcessRef::new(app, None),
            pid: None,
            payload: vec![1, 2, 3],
            count,
            encrypted: true,
            created_at: at,
        }
    }

    #[test]
    fn test_stats_window_excludes_old_rows() {
        let storage = Storage::open_in_memory().unwrap();
        let now = Utc::now();
        storage
            .insert_keys(&[
                key("Editor", 30, now),
                key("Browser", 10, now),
                key("Editor", 500, now - Duration::days(30)),
            ])
            .unwrap();

        let stats = storage.get_stats(7).unwrap();
        assert_eq!(stats.keystrokes, 40);
        assert_eq!(stats.top_apps[0].name, "Editor");
        assert!((stats.top_apps[0].percentage - 75.0).abs() < 1e-9);
        assert!((stats.top_apps[1].percentage - 25.0).abs() < 1e-9);

        // Zero days covers everything
        assert_eq!(storage.get_stats(0).unwrap().keystrokes, 540);
    }

    #[test]
    fn test_clicks_count_every_mouse_row() {
        let storage = Storage::open_in_memory().unwrap();
        let mouse = |kind| MouseRecord {
            process: ProcessRef::new("Browser", None),
            pid: None,
            x: 0,
            y: 0,
            button: MouseButton::Left,
            kind,
            created_at: Utc::now(),
        };
        storage
            .insert_clicks(&[
                mouse(MouseEventKind::Click),
                mouse(MouseEventKind::Scroll),
                mouse(MouseEventKind::Scroll),
            ])
            .unwrap();

        assert_eq!(storage.get_stats(1).unwrap().clicks, 3);
        assert_eq!(storage.row_counts().unwrap().clicks, 3);
    }

    #[test]
    fn test_export_rows_payload_is_base64() {
        let storage = Storage::open_in_memory().unwrap();
        storage.insert_keys(&[key("Editor", 1, Utc::now())]).unwrap();

        let rows = storage.export_rows(1).unwrap();
        assert_eq!(rows.keys.len(), 1);
        assert_eq!(rows.keys[0].application, "Editor");

        let json = serde_json::to_value(&rows).unwrap();
        assert_eq!(json["keys"][0]["payload"], "AQID");
        assert!(json["keys"][0].get("text").is_none());
    }
}
