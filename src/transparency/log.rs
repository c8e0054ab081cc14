//! Session transparency log.
//!
//! Counts what the monitor captured, wrote and lost, without holding any
//! captured content. Totals can be persisted across sessions as JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// The things the log counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    KeysCaptured,
    MouseCaptured,
    WindowsCaptured,
    CommandsCaptured,
    RowsWritten,
    FlushFailures,
    EncryptionFailures,
    OverflowDrops,
    ShutdownLosses,
    PlatformErrors,
    ExcludedEvents,
}

const COUNTERS: usize = 11;

impl Counter {
    fn index(self) -> usize {
        self as usize
    }
}

/// Transparency statistics for the current session.
#[derive(Debug)]
pub struct TransparencyLog {
    counters: [AtomicU64; COUNTERS],
    session_start: DateTime<Utc>,
    persist_path: Option<PathBuf>,
}

impl TransparencyLog {
    pub fn new() -> Self {
        Self {
            counters: Default::default(),
            session_start: Utc::now(),
            persist_path: None,
        }
    }

    /// Create a log that continues from, and saves to, `path`.
    pub fn with_persistence(path: PathBuf) -> Self {
        let mut log = Self::new();
        log.persist_path = Some(path);

        if let Err(e) = log.load() {
            tracing::warn!(error = %e, "could not load previous transparency stats");
        }

        log
    }

    pub fn record(&self, counter: Counter, count: u64) {
        self.counters[counter.index()].fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment(&self, counter: Counter) {
        self.record(counter, 1);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.counters[counter.index()].load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> TransparencyStats {
        use Counter::*;
        TransparencyStats {
            keys_captured: self.get(KeysCaptured),
            mouse_captured: self.get(MouseCaptured),
            windows_captured: self.get(WindowsCaptured),
            commands_captured: self.get(CommandsCaptured),
            rows_written: self.get(RowsWritten),
            flush_failures: self.get(FlushFailures),
            encryption_failures: self.get(EncryptionFailures),
            overflow_drops: self.get(OverflowDrops),
            shutdown_losses: self.get(ShutdownLosses),
            platform_errors: self.get(PlatformErrors),
            excluded_events: self.get(ExcludedEvents),
            session_start: self.session_start,
            session_duration_secs: (Utc::now() - self.session_start).num_seconds().max(0) as u64,
        }
    }

    /// Human-readable summary printed when the daemon stops.
    pub fn summary(&self) -> String {
        let stats = self.stats();
        let lost = stats.encryption_failures + stats.overflow_drops + stats.shutdown_losses;
        format!(
            "Session Statistics:\n\
             - Key events captured: {}\n\
             - Mouse events captured: {}\n\
             - Window changes captured: {}\n\
             - Terminal commands captured: {}\n\
             - Rows written: {}\n\
             - Excluded events: {}\n\
             - Flush failures: {}\n\
             - Platform errors: {}\n\
             - Events lost: {} (encryption {}, overflow {}, shutdown {})\n\
             - Session duration: {} seconds\n\
             \n\
             All data stays in the local database.",
            stats.keys_captured,
            stats.mouse_captured,
            stats.windows_captured,
            stats.commands_captured,
            stats.rows_written,
            stats.excluded_events,
            stats.flush_failures,
            stats.platform_errors,
            lost,
            stats.encryption_failures,
            stats.overflow_drops,
            stats.shutdown_losses,
            stats.session_duration_secs
        )
    }

    /// Save totals to disk, if persistence is configured.
    pub fn save(&self) -> Result<(), std::io::Error> {
        let Some(path) = &self.persist_path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let persisted = PersistedStats {
            counters: self.stats(),
            last_updated: Utc::now(),
        };
        let json = serde_json::to_string_pretty(&persisted).map_err(std::io::Error::other)?;
        std::fs::write(path, json)
    }

    fn load(&mut self) -> Result<(), std::io::Error> {
        let Some(path) = &self.persist_path else {
            return Ok(());
        };
        if !path.exists() {
            return Ok(());
        }

        let content = std::fs::read_to_string(path)?;
        let persisted: PersistedStats =
            serde_json::from_str(&content).map_err(std::io::Error::other)?;
        let previous = persisted.counters;

        use Counter::*;
        for (counter, value) in [
            (KeysCaptured, previous.keys_captured),
            (MouseCaptured, previous.mouse_captured),
            (WindowsCaptured, previous.windows_captured),
            (CommandsCaptured, previous.commands_captured),
            (RowsWritten, previous.rows_written),
            (FlushFailures, previous.flush_failures),
            (EncryptionFailures, previous.encryption_failures),
            (OverflowDrops, previous.overflow_drops),
            (ShutdownLosses, previous.shutdown_losses),
            (PlatformErrors, previous.platform_errors),
            (ExcludedEvents, previous.excluded_events),
        ] {
            self.counters[counter.index()].store(value, Ordering::Relaxed);
        }
        Ok(())
    }

    pub fn reset(&self) {
        for counter in &self.counters {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for TransparencyLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of transparency statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransparencyStats {
    pub keys_captured: u64,
    pub mouse_captured: u64,
    pub windows_captured: u64,
    pub commands_captured: u64,
    pub rows_written: u64,
    pub flush_failures: u64,
    pub encryption_failures: u64,
    pub overflow_drops: u64,
    pub shutdown_losses: u64,
    pub platform_errors: u64,
    pub excluded_events: u64,
    pub session_start: DateTime<Utc>,
    pub session_duration_secs: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedStats {
    #[serde(flatten)]
    counters: TransparencyStats,
    last_updated: DateTime<Utc>,
}

/// Thread-safe shared transparency log.
pub type SharedTransparencyLog = Arc<TransparencyLog>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counting_and_reset() {
        let log = TransparencyLog::new();

        log.increment(Counter::KeysCaptured);
        log.increment(Counter::KeysCaptured);
        log.record(Counter::RowsWritten, 40);
        assert_eq!(log.stats().keys_captured, 2);
        assert_eq!(log.get(Counter::RowsWritten), 40);

        log.reset();
        assert_eq!(log.stats().keys_captured, 0);
    }

    #[test]
    fn test_summary_mentions_losses() {
        let log = TransparencyLog::new();
        log.record(Counter::OverflowDrops, 3);
        log.record(Counter::ShutdownLosses, 2);

        let summary = log.summary();
        assert!(summary.contains("Key events captured"));
        assert!(summary.contains("Events lost: 5"));
    }

    #[test]
    fn test_persistence_accumulates_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transparency.json");

        let first = TransparencyLog::with_persistence(path.clone());
        first.record(Counter::MouseCaptured, 7);
        first.save().unwrap();

        let second = TransparencyLog::with_persistence(path);
        second.increment(Counter::MouseCaptured);
        assert_eq!(second.get(Counter::MouseCaptured), 8);
    }
}
