//! Read-only activity statistics over the database.

use crate::storage::queries::window_start;
use crate::storage::{Storage, StorageError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Seconds of activity credited per event kind.
///
/// An approximation: roughly four keys per second of typing, one second per
/// click or scroll, and a few seconds of reading after each focus change.
const SECONDS_PER_KEY: f64 = 0.25;
const SECONDS_PER_CLICK: f64 = 1.0;
const SECONDS_PER_WINDOW_CHANGE: f64 = 5.0;

/// Share of typing attributed to one application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppUsage {
    pub name: String,
    pub keystrokes: u64,
    pub percentage: f64,
}

/// Aggregate activity over a day window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityStats {
    pub keystrokes: u64,
    pub clicks: u64,
    pub window_changes: u64,
    /// Estimated, not measured
    pub active_seconds: u64,
    /// Applications ranked by keystrokes
    pub top_apps: Vec<AppUsage>,
    pub range_start: DateTime<Utc>,
    pub range_end: DateTime<Utc>,
}

/// Terminal usage over a day window.
/// One focus change in the recent-activity timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub application: String,
    pub title: String,
    pub started_at: DateTime<Utc>,
    /// Keys typed into `application` before the next focus change
    pub keystrokes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSummary {
    pub total_commands: u64,
    pub dangerous_commands: u64,
    pub by_type: Vec<(String, u64)>,
    pub top_commands: Vec<(String, u64)>,
    pub top_projects: Vec<(String, u64)>,
}

/// Estimate active time from event counts, capped at the window length.
pub fn estimate_active_seconds(keystrokes: u64, clicks: u64, window_changes: u64, days: u32) -> u64 {
    let estimate = keystrokes as f64 * SECONDS_PER_KEY
        + clicks as f64 * SECONDS_PER_CLICK
        + window_changes as f64 * SECONDS_PER_WINDOW_CHANGE;
    let estimate = estimate.round() as u64;
    if days == 0 {
        estimate
    } else {
        estimate.min(u64::from(days) * 86_400)
    }
}

/// Issues time-windowed queries against [`Storage`].
///
/// Safe to use while the monitor is writing; every query takes the
/// connection lock only for its own duration.
#[derive(Clone)]
pub struct StatsAggregator {
    storage: Arc<Storage>,
}

impl StatsAggregator {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Totals and top applications for the last `days` days.
    pub fn summary(&self, days: u32) -> Result<ActivityStats, StorageError> {
        self.storage.get_stats(days)
    }

    /// Key and click events per local hour of day.
    pub fn hourly_activity(&self, days: u32) -> Result<[u64; 24], StorageError> {
        let since = window_start(days, Utc::now()).timestamp_millis();
        self.storage.hourly_activity_since(since)
    }

    /// The `limit` most recent window changes, newest first.
    pub fn timeline(&self, days: u32, limit: usize) -> Result<Vec<TimelineEntry>, StorageError> {
        let since = window_start(days, Utc::now()).timestamp_millis();
        self.storage.timeline_since(since, limit)
    }

    pub fn terminal_summary(&self, days: u32) -> Result<TerminalSummary, StorageError> {
        let since = window_start(days, Utc::now()).timestamp_millis();
        self.storage.terminal_summary_since(since)
    }
}

/// Format seconds as `1h 05m`.
pub fn format_duration(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    if hours > 0 {
        format!("{hours}h {minutes:02}m")
    } else {
        format!("{minutes}m")
    }
}
