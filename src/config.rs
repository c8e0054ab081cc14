//! Configuration for the Footprint agent.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Name of the directory used under the platform config/data dirs.
const APP_DIR: &str = "footprint";

/// Main configuration for the monitoring daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Store the typed key text (encrypted) instead of counts only
    pub capture_text: bool,

    /// Capture mouse clicks and scrolls
    pub capture_mouse: bool,

    /// Also persist pointer movement (high volume)
    pub capture_mouse_moves: bool,

    /// Poll the focused window and record focus changes
    pub capture_windows: bool,

    /// Tail shell history files for executed commands
    pub capture_terminal: bool,

    /// Window poll interval in milliseconds
    pub update_interval_ms: u64,

    /// Period of the unconditional buffer flush
    #[serde(with = "duration_ms")]
    pub flush_interval: Duration,

    /// Encrypt key payloads before they are buffered
    pub encryption_enabled: bool,

    /// SQLite database file. Key material and logs live next to it.
    pub database_path: PathBuf,

    /// Application names or bundle ids that are never recorded
    pub exclude_applications: Vec<String>,

    pub buffers: BufferConfig,

    pub retry: RetryConfig,

    /// Upper bound on the final flush during stop
    #[serde(with = "duration_ms")]
    pub shutdown_timeout: Duration,

    /// Consecutive failures after which a capture source counts as down
    pub max_source_failures: u32,

    pub terminal: TerminalConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capture_text: true,
            capture_mouse: true,
            capture_mouse_moves: false,
            capture_windows: true,
            capture_terminal: true,
            update_interval_ms: 1000,
            flush_interval: Duration::from_secs(10),
            encryption_enabled: true,
            database_path: Self::default_data_dir().join("footprint.db"),
            exclude_applications: Vec::new(),
            buffers: BufferConfig::default(),
            retry: RetryConfig::default(),
            shutdown_timeout: Duration::from_secs(5),
            max_source_failures: 10,
            terminal: TerminalConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from `path`, falling back to defaults if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join("config.json")
    }

    /// Platform-conventional data directory.
    pub fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
    }

    /// Directory holding the database, key material and transparency log.
    pub fn data_dir(&self) -> PathBuf {
        match self.database_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    /// Ensure all required directories exist.
    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(self.data_dir())?;
        Ok(())
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }

    /// Whether events from `application` (or its bundle id) must be skipped.
    pub fn is_excluded(&self, application: &str, bundle_id: Option<&str>) -> bool {
        self.exclude_applications.iter().any(|excluded| {
            excluded.eq_ignore_ascii_case(application)
                || bundle_id.is_some_and(|id| excluded.eq_ignore_ascii_case(id))
        })
    }

    /// Reject settings the monitor cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.update_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "update_interval_ms must be positive".into(),
            ));
        }
        if self.flush_interval.is_zero() {
            return Err(ConfigError::Invalid("flush_interval must be positive".into()));
        }
        if self.terminal.poll_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "terminal.poll_interval must be positive".into(),
            ));
        }
        if self.retry.initial_backoff.is_zero() || self.retry.max_backoff < self.retry.initial_backoff
        {
            return Err(ConfigError::Invalid(
                "retry backoff must satisfy 0 < initial_backoff <= max_backoff".into(),
            ));
        }

        let b = &self.buffers;
        for (name, threshold) in [
            ("keys", b.keys),
            ("mouse", b.mouse),
            ("windows", b.windows),
            ("terminal", b.terminal),
        ] {
            if threshold == 0 {
                return Err(ConfigError::Invalid(format!(
                    "buffers.{name} threshold must be positive"
                )));
            }
            if threshold > b.max_buffered_events {
                return Err(ConfigError::Invalid(format!(
                    "buffers.{name} threshold {threshold} exceeds max_buffered_events {}",
                    b.max_buffered_events
                )));
            }
        }

        if self.max_source_failures == 0 {
            return Err(ConfigError::Invalid(
                "max_source_failures must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Flush thresholds per buffer kind and the shared capacity bound.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub keys: usize,
    pub mouse: usize,
    pub windows: usize,
    pub terminal: usize,
    /// Per-buffer capacity; the oldest events are dropped beyond it
    pub max_buffered_events: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            keys: 100,
            mouse: 50,
            windows: 20,
            terminal: 20,
            max_buffered_events: 10_000,
        }
    }
}

/// Backoff applied to a buffer after a failed flush.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    #[serde(with = "duration_ms")]
    pub initial_backoff: Duration,
    #[serde(with = "duration_ms")]
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

/// Shell history tailing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    /// History files to watch; empty means the usual bash, zsh and fish files
    pub history_files: Vec<PathBuf>,
    /// Directory used for git branch and project detection
    pub working_directory: Option<PathBuf>,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            history_files: Vec::new(),
            working_directory: None,
        }
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Serde support for Duration as whole milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.flush_interval, Duration::from_secs(10));
        assert_eq!(config.buffers.keys, 100);
        assert_eq!(config.buffers.mouse, 50);
        assert_eq!(config.retry.max_backoff, Duration::from_secs(60));
        assert!(config.encryption_enabled);
        assert!(config.database_path.ends_with("footprint.db"));
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"capture_text": false, "flush_interval": 2500, "exclude_applications": ["1Password"]}"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert!(!config.capture_text);
        assert_eq!(config.flush_interval, Duration::from_millis(2500));
        assert_eq!(config.update_interval_ms, 1000);
        assert!(config.is_excluded("1password", None));
        assert!(!config.is_excluded("Terminal", None));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut config = Config::default();
        config.exclude_applications = vec!["com.example.vault".into()];
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert!(loaded.is_excluded("Vault", Some("com.example.vault")));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.buffers.keys = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.buffers.max_buffered_events = 10;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.update_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_data_dir_follows_database() {
        let mut config = Config::default();
        config.database_path = PathBuf::from("/tmp/fp/activity.db");
        assert_eq!(config.data_dir(), PathBuf::from("/tmp/fp"));
    }
}
