//! Integration tests for the monitor driven by the scripted platform

use chrono::{DateTime, Utc};
use footprint_agent::capture::{KeyInput, MouseButton, MouseInput, WindowInfo};
use footprint_agent::model::{
    KeyRecord, MouseRecord, TerminalCommandRecord, TerminalSession, WindowRecord,
};
use footprint_agent::{
    Config, Counter, EncryptionError, Encryptor, EventSink, Monitor, MonitorError, MonitorState,
    PayloadCipher, Permissions, ScriptedPlatform, Storage, StorageError, TransparencyLog,
};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn test_config() -> Config {
    let mut config = Config::default();
    config.encryption_enabled = false;
    config.capture_terminal = false;
    config.update_interval_ms = 10;
    config.flush_interval = Duration::from_secs(60);
    config.shutdown_timeout = Duration::from_millis(500);
    config.retry.initial_backoff = Duration::from_millis(10);
    config.retry.max_backoff = Duration::from_millis(100);
    config
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Alternating keys so that no two consecutive presses coalesce.
fn type_keys(platform: &ScriptedPlatform, count: usize) {
    for i in 0..count {
        let key = if i % 2 == 0 { "a" } else { "b" };
        assert!(platform.emit_key(KeyInput::new(key).in_application("Editor", 100)));
    }
}

struct Fixture {
    platform: Arc<ScriptedPlatform>,
    storage: Arc<Storage>,
    monitor: Monitor,
}

fn fixture(config: Config) -> Fixture {
    fixture_with(config, ScriptedPlatform::new(), None)
}

fn fixture_with(
    config: Config,
    platform: ScriptedPlatform,
    cipher: Option<Arc<dyn PayloadCipher>>,
) -> Fixture {
    let platform = Arc::new(platform);
    let storage = Arc::new(Storage::open_in_memory().unwrap());
    let monitor = Monitor::new(config, platform.clone(), storage.clone(), cipher);
    Fixture {
        platform,
        storage,
        monitor,
    }
}

/// Storage that can be switched into failing mode.
struct FlakySink {
    inner: Storage,
    failing: AtomicBool,
}

impl FlakySink {
    fn new(failing: bool) -> Arc<Self> {
        Arc::new(Self {
            inner: Storage::open_in_memory().unwrap(),
            failing: AtomicBool::new(failing),
        })
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(StorageError::Unavailable("database locked".into()))
        } else {
            Ok(())
        }
    }
}

impl EventSink for FlakySink {
    fn insert_windows(&self, batch: &[WindowRecord]) -> Result<usize, StorageError> {
        self.check()?;
        self.inner.insert_windows(batch)
    }
    fn insert_keys(&self, batch: &[KeyRecord]) -> Result<usize, StorageError> {
        self.check()?;
        self.inner.insert_keys(batch)
    }
    fn insert_clicks(&self, batch: &[MouseRecord]) -> Result<usize, StorageError> {
        self.check()?;
        self.inner.insert_clicks(batch)
    }
    fn insert_terminal_commands(
        &self,
        batch: &[TerminalCommandRecord],
    ) -> Result<usize, StorageError> {
        self.check()?;
        self.inner.insert_terminal_commands(batch)
    }
    fn open_terminal_session(&self, session: &TerminalSession) -> Result<i64, StorageError> {
        self.inner.open_terminal_session(session)
    }
    fn close_terminal_session(&self, id: i64, ended_at: DateTime<Utc>) -> Result<(), StorageError> {
        self.inner.close_terminal_session(id, ended_at)
    }
}

struct FailingCipher;

impl PayloadCipher for FailingCipher {
    fn encrypt(&self, _plaintext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        Err(EncryptionError::Encrypt)
    }
}

#[test]
fn test_permission_denied_creates_no_subscriptions() {
    let platform = ScriptedPlatform::with_permissions(Permissions {
        accessibility: false,
        input_monitoring: false,
        screen_recording: false,
    });
    let mut f = fixture_with(test_config(), platform, None);

    match f.monitor.start() {
        Err(MonitorError::Permission(e)) => {
            assert_eq!(e.missing, vec!["Accessibility", "Input Monitoring"]);
        }
        other => panic!("expected permission error, got {other:?}"),
    }
    assert_eq!(f.monitor.state(), MonitorState::Stopped);
    assert_eq!(f.platform.permission_requests(), 1);
    assert_eq!(f.platform.keyboard_subscriptions(), 0);
    assert_eq!(f.platform.mouse_subscriptions(), 0);
    assert!(!f.platform.has_keyboard_subscriber());
}

#[test]
fn test_permissions_granted_on_request() {
    let platform = ScriptedPlatform::with_permissions(Permissions {
        accessibility: false,
        input_monitoring: true,
        screen_recording: false,
    });
    platform.grant_on_request(true);
    let mut f = fixture_with(test_config(), platform, None);

    f.monitor.start().unwrap();
    assert_eq!(f.monitor.state(), MonitorState::Running);
    assert_eq!(f.platform.permission_requests(), 1);
    assert!(f.platform.has_keyboard_subscriber());
    assert!(f.platform.has_mouse_subscriber());
    f.monitor.stop().unwrap();
}

#[test]
fn test_stop_persists_everything_buffered() {
    let mut f = fixture(test_config());
    f.monitor.start().unwrap();

    type_keys(&f.platform, 40);
    for i in 0..5 {
        f.platform.emit_mouse(MouseInput::click(i, i, MouseButton::Left));
    }
    assert_eq!(f.storage.row_counts().unwrap().keys, 0);
    assert_eq!(f.monitor.buffered().keys, 40);

    let report = f.monitor.stop().unwrap();
    assert_eq!(report.lost, 0);
    assert!(!report.timed_out);
    assert_eq!(report.flushed, 45);

    let counts = f.storage.row_counts().unwrap();
    assert_eq!(counts.keys, 40);
    assert_eq!(counts.clicks, 5);
    assert!(!f.platform.has_keyboard_subscriber());
    assert!(!f.platform.has_mouse_subscriber());
}

#[test]
fn test_events_after_stop_are_not_delivered() {
    let mut f = fixture(test_config());
    f.monitor.start().unwrap();
    f.monitor.stop().unwrap();

    assert!(!f.platform.emit_key(KeyInput::new("x")));
    assert_eq!(f.storage.row_counts().unwrap().keys, 0);
}

#[test]
fn test_threshold_flush_leaves_remainder_buffered() {
    let mut config = test_config();
    config.buffers.keys = 100;
    let mut f = fixture(config);
    f.monitor.start().unwrap();

    type_keys(&f.platform, 150);

    // The threshold flush runs on the producer before emit returns
    assert_eq!(f.storage.row_counts().unwrap().keys, 100);
    assert_eq!(f.monitor.buffered().keys, 50);

    f.monitor.stop().unwrap();
    assert_eq!(f.storage.row_counts().unwrap().keys, 150);
}

#[test]
fn test_repeated_keys_are_coalesced() {
    let mut f = fixture(test_config());
    f.monitor.start().unwrap();

    for _ in 0..5 {
        f.platform.emit_key(KeyInput::new("j").in_application("Editor", 100));
    }
    f.platform.emit_key(KeyInput::new("k").in_application("Editor", 100));
    f.monitor.stop().unwrap();

    let rows = f.storage.export_rows(0).unwrap();
    let counts: Vec<_> = rows.keys.iter().map(|k| (k.payload.clone(), k.count)).collect();
    assert_eq!(counts, vec![(b"j".to_vec(), 5), (b"k".to_vec(), 1)]);
    assert_eq!(f.storage.get_stats(0).unwrap().keystrokes, 6);
}

#[test]
fn test_count_only_mode_stores_no_text() {
    let mut config = test_config();
    config.capture_text = false;
    config.encryption_enabled = true;
    let mut f = fixture(config);
    f.monitor.start().unwrap();

    type_keys(&f.platform, 12);
    f.monitor.stop().unwrap();

    let rows = f.storage.export_rows(0).unwrap();
    assert_eq!(rows.keys.len(), 1);
    assert_eq!(rows.keys[0].count, 12);
    assert!(rows.keys[0].payload.is_empty());
    assert!(!rows.keys[0].encrypted);
}

#[test]
fn test_window_changes_are_deduplicated() {
    let mut f = fixture(test_config());
    f.platform.script_windows([
        WindowInfo::new("Editor", "main.rs"),
        WindowInfo::new("Editor", "main.rs"),
        WindowInfo::new("Browser", "docs"),
        WindowInfo::new("Browser", "docs"),
        WindowInfo::new("Editor", "main.rs"),
    ]);
    f.monitor.start().unwrap();

    assert!(wait_until(Duration::from_secs(5), || f.platform.window_polls() >= 8));
    f.monitor.stop().unwrap();

    let rows = f.storage.export_rows(0).unwrap();
    let apps: Vec<_> = rows.windows.iter().map(|w| w.application.as_str()).collect();
    assert_eq!(apps, vec!["Editor", "Browser", "Editor"]);
}

#[test]
fn test_window_poll_errors_are_retried() {
    let mut f = fixture(test_config());
    f.platform.fail_next_polls(2);
    f.platform.script_windows([WindowInfo::new("Terminal", "zsh")]);
    f.monitor.start().unwrap();

    assert!(wait_until(Duration::from_secs(5), || f.platform.window_polls() >= 4));
    let transparency = f.monitor.transparency();
    f.monitor.stop().unwrap();

    assert_eq!(f.storage.row_counts().unwrap().windows, 1);
    assert_eq!(transparency.get(Counter::PlatformErrors), 2);
}

#[test]
fn test_keys_are_encrypted_before_storage() {
    let mut config = test_config();
    config.encryption_enabled = true;
    let encryptor = Arc::new(Encryptor::from_key([7u8; 32]));
    let mut f = fixture_with(config, ScriptedPlatform::new(), Some(encryptor.clone()));
    f.monitor.start().unwrap();

    f.platform.emit_key(KeyInput::new("h").in_application("Chat", 7));
    f.platform.emit_key(KeyInput::new("i").in_application("Chat", 7));
    f.monitor.stop().unwrap();

    let rows = f.storage.export_rows(0).unwrap();
    assert_eq!(rows.keys.len(), 2);
    let mut texts = Vec::new();
    for row in &rows.keys {
        assert!(row.encrypted);
        assert_ne!(row.payload, b"h".to_vec());
        texts.push(encryptor.decrypt(&row.payload).unwrap());
    }
    texts.sort();
    assert_eq!(texts, vec![b"h".to_vec(), b"i".to_vec()]);
}

#[test]
fn test_encryption_failure_drops_key_events() {
    let mut config = test_config();
    config.encryption_enabled = true;
    let mut f = fixture_with(config, ScriptedPlatform::new(), Some(Arc::new(FailingCipher)));
    f.monitor.start().unwrap();

    type_keys(&f.platform, 10);
    f.platform.emit_mouse(MouseInput::click(1, 2, MouseButton::Right));
    let transparency = f.monitor.transparency();
    f.monitor.stop().unwrap();

    let counts = f.storage.row_counts().unwrap();
    assert_eq!(counts.keys, 0);
    assert_eq!(counts.clicks, 1);
    assert_eq!(transparency.get(Counter::EncryptionFailures), 10);
}

#[test]
fn test_excluded_applications_are_not_recorded() {
    let mut config = test_config();
    config.exclude_applications = vec!["1password".to_string()];
    let mut f = fixture(config);
    f.platform
        .script_windows([WindowInfo::new("1Password", "Vault").with_bundle_id("com.1password.1password")]);
    f.monitor.start().unwrap();
    assert!(wait_until(Duration::from_secs(5), || f.platform.window_polls() >= 2));

    f.platform.emit_key(KeyInput::new("s").in_application("1Password", 42));
    f.platform.emit_key(KeyInput::new("e").in_application("1Password", 42));
    f.platform.emit_mouse(MouseInput::click(5, 5, MouseButton::Left));
    f.platform.emit_key(KeyInput::new("x").in_application("Editor", 100));
    let transparency = f.monitor.transparency();
    f.monitor.stop().unwrap();

    let rows = f.storage.export_rows(0).unwrap();
    assert!(rows.windows.is_empty());
    assert!(rows.clicks.is_empty());
    assert_eq!(rows.keys.len(), 1);
    assert_eq!(rows.keys[0].application, "Editor");
    assert!(transparency.get(Counter::ExcludedEvents) >= 4);
}

#[test]
fn test_timer_flush_writes_and_seals_pending_keys() {
    let mut config = test_config();
    config.flush_interval = Duration::from_millis(50);
    let mut f = fixture(config);
    f.monitor.start().unwrap();

    type_keys(&f.platform, 3);
    assert!(wait_until(Duration::from_secs(5), || {
        f.storage.row_counts().unwrap().keys == 3
    }));
    assert_eq!(f.monitor.buffered().total(), 0);
    assert_eq!(f.monitor.state(), MonitorState::Running);
    f.monitor.stop().unwrap();
}

#[test]
fn test_dead_keyboard_stream_is_resubscribed() {
    let mut f = fixture(test_config());
    f.monitor.start().unwrap();
    assert_eq!(f.platform.keyboard_subscriptions(), 1);

    f.platform.kill_keyboard();
    assert!(!f.platform.emit_key(KeyInput::new("a")));

    assert!(wait_until(Duration::from_secs(5), || {
        f.platform.keyboard_subscriptions() == 2 && f.platform.has_keyboard_subscriber()
    }));
    assert!(f.platform.emit_key(KeyInput::new("a").in_application("Editor", 100)));
    f.monitor.stop().unwrap();
    assert_eq!(f.storage.row_counts().unwrap().keys, 1);
}

#[test]
fn test_failed_subscribe_is_retried() {
    let platform = ScriptedPlatform::new();
    platform.fail_next_keyboard_subscribes(2);
    let mut f = fixture_with(test_config(), platform, None);
    f.monitor.start().unwrap();
    assert!(!f.platform.has_keyboard_subscriber());

    assert!(wait_until(Duration::from_secs(5), || f.platform.has_keyboard_subscriber()));
    f.monitor.stop().unwrap();
}

#[test]
fn test_all_sources_failed_is_signalled() {
    let mut config = test_config();
    config.capture_mouse = false;
    config.capture_windows = false;
    config.max_source_failures = 3;
    config.retry.initial_backoff = Duration::from_millis(1);
    config.retry.max_backoff = Duration::from_millis(1);
    let platform = ScriptedPlatform::new();
    platform.fail_next_keyboard_subscribes(1000);
    let mut f = fixture_with(config, platform, None);
    f.monitor.start().unwrap();

    let failure = f
        .monitor
        .failures()
        .recv_timeout(Duration::from_secs(5))
        .unwrap();
    assert_eq!(failure.sources, vec!["keyboard"]);

    // The monitor keeps running until its owner stops it
    assert_eq!(f.monitor.state(), MonitorState::Running);
    f.monitor.stop().unwrap();
}

#[test]
fn test_failed_flush_keeps_events_until_storage_recovers() {
    let mut config = test_config();
    config.buffers.keys = 5;
    let sink = FlakySink::new(true);
    let platform = Arc::new(ScriptedPlatform::new());
    let transparency = Arc::new(TransparencyLog::new());
    let mut monitor = Monitor::new(config, platform.clone(), sink.clone(), None)
        .with_transparency(transparency.clone());
    monitor.start().unwrap();

    type_keys(&platform, 20);
    assert_eq!(sink.inner.row_counts().unwrap().keys, 0);
    assert_eq!(monitor.buffered().keys, 20);
    assert!(transparency.get(Counter::FlushFailures) >= 1);

    sink.failing.store(false, Ordering::SeqCst);
    let report = monitor.stop().unwrap();
    assert_eq!(report.lost, 0);
    assert_eq!(sink.inner.row_counts().unwrap().keys, 20);
}

#[test]
fn test_shutdown_timeout_reports_lost_events() {
    let mut config = test_config();
    config.shutdown_timeout = Duration::from_millis(200);
    let sink = FlakySink::new(true);
    let platform = Arc::new(ScriptedPlatform::new());
    let transparency = Arc::new(TransparencyLog::new());
    let mut monitor = Monitor::new(config, platform.clone(), sink.clone(), None)
        .with_transparency(transparency.clone());
    monitor.start().unwrap();

    type_keys(&platform, 6);
    platform.emit_mouse(MouseInput::click(0, 0, MouseButton::Left));

    let started = Instant::now();
    let report = monitor.stop().unwrap();
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(report.timed_out);
    assert_eq!(report.lost, 7);
    assert_eq!(transparency.get(Counter::ShutdownLosses), 7);
    assert_eq!(monitor.state(), MonitorState::Stopped);
}

#[test]
fn test_restart_keeps_writing_to_the_same_storage() {
    let mut f = fixture(test_config());

    f.monitor.start().unwrap();
    type_keys(&f.platform, 4);
    f.monitor.stop().unwrap();

    f.monitor.start().unwrap();
    type_keys(&f.platform, 6);
    f.monitor.stop().unwrap();

    assert_eq!(f.storage.row_counts().unwrap().keys, 10);
    assert_eq!(f.platform.keyboard_subscriptions(), 2);
}

#[test]
fn test_terminal_commands_are_recorded_in_a_session() {
    let dir = tempfile::tempdir().unwrap();
    let history = dir.path().join(".zsh_history");
    std::fs::write(&history, ": 1700000000:0;cargo build\n").unwrap();

    let mut config = test_config();
    config.capture_terminal = true;
    config.terminal.history_files = vec![history.clone()];
    config.terminal.poll_interval = Duration::from_millis(20);
    config.terminal.working_directory = Some(dir.path().to_path_buf());
    let mut f = fixture(config);
    f.monitor.start().unwrap();

    let mut file = std::fs::OpenOptions::new().append(true).open(&history).unwrap();
    writeln!(file, ": 1700000100:3;git status").unwrap();
    writeln!(file, ": 1700000101:0;ls").unwrap();
    writeln!(file, ": 1700000102:1;rm -rf target").unwrap();
    drop(file);

    assert!(wait_until(Duration::from_secs(5), || f.monitor.buffered().terminal == 2));
    f.monitor.stop().unwrap();

    let counts = f.storage.row_counts().unwrap();
    assert_eq!(counts.terminal_sessions, 1);
    assert_eq!(counts.terminal_commands, 2);

    let rows = f.storage.export_rows(0).unwrap();
    let commands: Vec<_> = rows
        .terminal_commands
        .iter()
        .map(|c| (c.command.as_str(), c.command_type.as_str(), c.is_dangerous))
        .collect();
    assert_eq!(
        commands,
        vec![("git status", "git", false), ("rm -rf target", "file", true)]
    );
    assert!(rows.terminal_commands.iter().all(|c| c.session_id.is_some()));
}
