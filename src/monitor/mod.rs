//! Monitoring orchestrator.
//!
//! A [`Monitor`] owns the lifecycle `Stopped -> Starting -> Running ->
//! Stopping -> Stopped`. While running it routes platform events through the
//! optional payload cipher into per-kind buffers and flushes those into the
//! event sink on a timer or when a buffer reaches its threshold.

pub mod flusher;
pub mod router;
pub mod workers;

use crate::buffer::{BufferKind, BufferedCounts, Buffers};
use crate::capture::{PlatformCapability, PlatformError};
use crate::config::{Config, ConfigError};
use crate::crypto::{EncryptionError, PayloadCipher};
use crate::model::TerminalSession;
use crate::permissions::{PermissionError, PermissionGate};
use crate::storage::{EventSink, StorageError};
use crate::terminal::{context, TerminalTracker};
use crate::transparency::{Counter, SharedTransparencyLog, TransparencyLog};
use chrono::Utc;
use crossbeam_channel::{bounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

pub use flusher::{FlushOutcome, Flusher};
pub use router::Router;
pub use workers::{AllSourcesFailed, Source};

use workers::{SourceHealth, Subscriptions};

/// Pause between final-flush attempts while storage keeps failing.
const FINAL_FLUSH_RETRY: Duration = Duration::from_millis(50);

/// Lifecycle state of a [`Monitor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for MonitorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MonitorState::Stopped => "stopped",
            MonitorState::Starting => "starting",
            MonitorState::Running => "running",
            MonitorState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Errors surfaced by the monitor.
///
/// Only permission and configuration errors stop a start; the rest are
/// reported and retried internally.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error(transparent)]
    Permission(#[from] PermissionError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Platform(#[from] PlatformError),
    #[error(transparent)]
    Encryption(#[from] EncryptionError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("cannot {action} a monitor that is {state}")]
    InvalidState {
        action: &'static str,
        state: MonitorState,
    },
}

/// What the final flush of a stop achieved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopReport {
    /// Rows written by the final flush
    pub flushed: usize,
    /// Events discarded because storage did not recover before the timeout
    pub lost: usize,
    pub timed_out: bool,
}

/// Handles of one running session.
struct Run {
    id: Uuid,
    shutdown: Option<Sender<()>>,
    threads: Vec<JoinHandle<()>>,
    router: Arc<Router>,
    flusher: Arc<Flusher>,
    subscriptions: Arc<Mutex<Subscriptions>>,
    session_id: Option<i64>,
}

/// The monitoring orchestrator.
pub struct Monitor {
    config: Arc<Config>,
    platform: Arc<dyn PlatformCapability>,
    sink: Arc<dyn EventSink>,
    cipher: Option<Arc<dyn PayloadCipher>>,
    transparency: SharedTransparencyLog,
    state: Mutex<MonitorState>,
    buffers: Arc<Buffers>,
    alarm_tx: Sender<AllSourcesFailed>,
    alarm_rx: Receiver<AllSourcesFailed>,
    run: Option<Run>,
}

impl Monitor {
    pub fn new(
        config: Config,
        platform: Arc<dyn PlatformCapability>,
        sink: Arc<dyn EventSink>,
        cipher: Option<Arc<dyn PayloadCipher>>,
    ) -> Self {
        let (alarm_tx, alarm_rx) = bounded(1);
        let buffers = Arc::new(Buffers::new(&config.buffers));
        Self {
            config: Arc::new(config),
            platform,
            sink,
            cipher,
            transparency: Arc::new(TransparencyLog::new()),
            state: Mutex::new(MonitorState::Stopped),
            buffers,
            alarm_tx,
            alarm_rx,
            run: None,
        }
    }

    /// Use `log` instead of a fresh in-memory transparency log.
    pub fn with_transparency(mut self, log: SharedTransparencyLog) -> Self {
        self.transparency = log;
        self
    }

    fn state_guard(&self) -> MutexGuard<'_, MonitorState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn set_state(&self, state: MonitorState) {
        let mut current = self.state_guard();
        tracing::debug!(from = %*current, to = %state, "monitor state change");
        *current = state;
    }

    pub fn state(&self) -> MonitorState {
        *self.state_guard()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn transparency(&self) -> SharedTransparencyLog {
        self.transparency.clone()
    }

    /// Receives a message when every capture source has failed.
    pub fn failures(&self) -> Receiver<AllSourcesFailed> {
        self.alarm_rx.clone()
    }

    /// Identifier of the current run, used to correlate its log lines.
    pub fn run_id(&self) -> Option<Uuid> {
        self.run.as_ref().map(|run| run.id)
    }

    /// Events currently held in memory, including a pending key run.
    pub fn buffered(&self) -> BufferedCounts {
        let mut counts = self.buffers.counts();
        if self.run.as_ref().is_some_and(|run| run.router.has_pending_key()) {
            counts.keys += 1;
        }
        counts
    }

    /// Flush every buffer now, ignoring backoff.
    pub fn flush_now(&self) -> Result<Vec<(BufferKind, FlushOutcome)>, MonitorError> {
        let run = self.run.as_ref().ok_or(MonitorError::InvalidState {
            action: "flush",
            state: self.state(),
        })?;
        run.router.seal_pending_key();
        Ok(run.flusher.flush_all(true))
    }

    /// Check permissions, subscribe to the platform and start the workers.
    ///
    /// On a permission or configuration error the monitor returns to
    /// `Stopped` without subscribing to anything.
    pub fn start(&mut self) -> Result<(), MonitorError> {
        {
            let mut state = self.state_guard();
            if *state != MonitorState::Stopped {
                return Err(MonitorError::InvalidState {
                    action: "start",
                    state: *state,
                });
            }
            *state = MonitorState::Starting;
        }

        match self.launch() {
            Ok(run) => {
                tracing::info!(run_id = %run.id, platform = self.platform.name(), "monitor running");
                self.run = Some(run);
                self.set_state(MonitorState::Running);
                Ok(())
            }
            Err(e) => {
                self.set_state(MonitorState::Stopped);
                tracing::error!(error = %e, "monitor failed to start");
                Err(e)
            }
        }
    }

    fn launch(&mut self) -> Result<Run, MonitorError> {
        self.config.validate()?;
        if self.config.encryption_enabled && self.config.capture_text && self.cipher.is_none() {
            return Err(ConfigError::Invalid(
                "encryption is enabled but no payload cipher was provided".into(),
            )
            .into());
        }

        let permissions = PermissionGate::new(self.platform.as_ref()).ensure()?;
        tracing::info!(
            accessibility = permissions.accessibility,
            input_monitoring = permissions.input_monitoring,
            screen_recording = permissions.screen_recording,
            "permissions granted"
        );

        // Stale signals from a previous run must not stop this one
        while self.alarm_rx.try_recv().is_ok() {}

        let buffers = Arc::new(Buffers::new(&self.config.buffers));
        self.buffers = buffers.clone();

        let session_id = if self.config.capture_terminal {
            self.open_session()
        } else {
            None
        };

        let flusher = Arc::new(Flusher::new(
            self.sink.clone(),
            buffers.clone(),
            self.config.retry.clone(),
            self.transparency.clone(),
        ));
        let router = Arc::new(Router::new(
            self.config.clone(),
            self.cipher.clone(),
            buffers,
            flusher.clone(),
            self.transparency.clone(),
            session_id,
        ));
        let health = Arc::new(SourceHealth::new(
            &self.config,
            self.alarm_tx.clone(),
            self.transparency.clone(),
        ));

        let mut subscriptions = Subscriptions::default();
        subscriptions.keyboard =
            workers::subscribe(self.platform.as_ref(), &router, &health, Source::Keyboard);
        if self.config.capture_mouse {
            subscriptions.mouse =
                workers::subscribe(self.platform.as_ref(), &router, &health, Source::Mouse);
        }
        let subscriptions = Arc::new(Mutex::new(subscriptions));

        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let mut threads = Vec::new();

        if self.config.capture_windows {
            let platform = self.platform.clone();
            let router = router.clone();
            let health = health.clone();
            let interval = self.config.update_interval();
            let shutdown = shutdown_rx.clone();
            threads.push(spawn("window-poll", move || {
                workers::window_poll_loop(platform, router, health, interval, shutdown)
            })?);
        }

        {
            let router = router.clone();
            let flusher = flusher.clone();
            let interval = self.config.flush_interval;
            let shutdown = shutdown_rx.clone();
            threads.push(spawn("flush-timer", move || {
                workers::flush_timer_loop(router, flusher, interval, shutdown)
            })?);
        }

        {
            let platform = self.platform.clone();
            let router = router.clone();
            let subscriptions = subscriptions.clone();
            let capture_mouse = self.config.capture_mouse;
            let shutdown = shutdown_rx.clone();
            threads.push(spawn("supervisor", move || {
                workers::supervisor_loop(platform, router, health, subscriptions, capture_mouse, shutdown)
            })?);
        }

        if self.config.capture_terminal {
            let tracker = TerminalTracker::new(&self.config.terminal);
            let router = router.clone();
            let interval = self.config.terminal.poll_interval;
            let shutdown = shutdown_rx;
            threads.push(spawn("terminal", move || {
                workers::terminal_loop(tracker, router, interval, shutdown)
            })?);
        }

        Ok(Run {
            id: Uuid::new_v4(),
            shutdown: Some(shutdown_tx),
            threads,
            router,
            flusher,
            subscriptions,
            session_id,
        })
    }

    fn open_session(&self) -> Option<i64> {
        let working_directory = self
            .config
            .terminal
            .working_directory
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .map(|dir| dir.display().to_string());
        let session = TerminalSession {
            shell_type: context::shell_type(),
            working_directory,
            started_at: Utc::now(),
        };
        match self.sink.open_terminal_session(&session) {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!(error = %e, "could not open terminal session, commands will be unlinked");
                None
            }
        }
    }

    /// Unsubscribe, flush everything still buffered and return to `Stopped`.
    ///
    /// The final flush retries until `shutdown_timeout`; whatever is still
    /// buffered after that is logged as lost. The event sink stays open until
    /// the `Monitor` is dropped so the monitor can be started again.
    pub fn stop(&mut self) -> Result<StopReport, MonitorError> {
        {
            let mut state = self.state_guard();
            if *state != MonitorState::Running {
                return Err(MonitorError::InvalidState {
                    action: "stop",
                    state: *state,
                });
            }
            *state = MonitorState::Stopping;
        }

        let Some(mut run) = self.run.take() else {
            self.set_state(MonitorState::Stopped);
            return Ok(StopReport::default());
        };

        run.router.stop_accepting();
        drop(run.shutdown.take());
        for handle in run.threads.drain(..) {
            if handle.join().is_err() {
                tracing::error!("monitor worker panicked");
            }
        }
        match run.subscriptions.lock() {
            Ok(mut subs) => subs.cancel_all(),
            Err(poisoned) => poisoned.into_inner().cancel_all(),
        }

        run.router.seal_pending_key();
        let report = self.final_flush(&run.flusher);

        if let Some(id) = run.session_id {
            if let Err(e) = self.sink.close_terminal_session(id, Utc::now()) {
                tracing::warn!(error = %e, "could not close terminal session");
            }
        }

        self.transparency
            .record(Counter::OverflowDrops, self.buffers.dropped());
        if let Err(e) = self.transparency.save() {
            tracing::warn!(error = %e, "could not save transparency stats");
        }

        self.set_state(MonitorState::Stopped);
        tracing::info!(
            run_id = %run.id,
            flushed = report.flushed,
            lost = report.lost,
            "monitor stopped"
        );
        Ok(report)
    }

    fn final_flush(&self, flusher: &Flusher) -> StopReport {
        let deadline = Instant::now() + self.config.shutdown_timeout;
        let mut report = StopReport::default();

        loop {
            let mut failed = false;
            for (_, outcome) in flusher.flush_all(true) {
                match outcome {
                    FlushOutcome::Written(n) => report.flushed += n,
                    FlushOutcome::Failed => failed = true,
                    FlushOutcome::Empty | FlushOutcome::Deferred => {}
                }
            }
            if !failed {
                break;
            }

            let now = Instant::now();
            if now >= deadline {
                report.timed_out = true;
                report.lost = self.buffers.discard();
                self.transparency
                    .record(Counter::ShutdownLosses, report.lost as u64);
                tracing::error!(
                    lost = report.lost,
                    timeout_ms = self.config.shutdown_timeout.as_millis() as u64,
                    "storage did not recover before shutdown timeout, buffered events lost"
                );
                break;
            }
            thread::sleep(FINAL_FLUSH_RETRY.min(deadline - now));
        }

        report
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        if self.state() == MonitorState::Running {
            if let Err(e) = self.stop() {
                tracing::error!(error = %e, "failed to stop monitor on drop");
            }
        }
    }
}

fn spawn<F>(name: &str, body: F) -> Result<JoinHandle<()>, MonitorError>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(format!("footprint-{name}"))
        .spawn(body)
        .map_err(|e| {
            MonitorError::Platform(PlatformError::Query(format!(
                "failed to spawn {name} thread: {e}"
            )))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{Permissions, ScriptedPlatform};
    use crate::storage::Storage;

    fn config() -> Config {
        let mut config = Config::default();
        config.encryption_enabled = false;
        config.capture_terminal = false;
        config.update_interval_ms = 10;
        config.flush_interval = Duration::from_secs(60);
        config
    }

    #[test]
    fn test_lifecycle_states() {
        let platform = Arc::new(ScriptedPlatform::new());
        let mut monitor = Monitor::new(
            config(),
            platform,
            Arc::new(Storage::open_in_memory().unwrap()),
            None,
        );
        assert_eq!(monitor.state(), MonitorState::Stopped);
        assert!(matches!(
            monitor.stop(),
            Err(MonitorError::InvalidState { .. })
        ));

        monitor.start().unwrap();
        assert_eq!(monitor.state(), MonitorState::Running);
        assert!(matches!(
            monitor.start(),
            Err(MonitorError::InvalidState { .. })
        ));

        let first = monitor.run_id().unwrap();
        monitor.stop().unwrap();
        assert_eq!(monitor.state(), MonitorState::Stopped);
        assert!(monitor.run_id().is_none());

        // A stopped monitor can run again
        monitor.start().unwrap();
        assert_ne!(monitor.run_id(), Some(first));
        monitor.stop().unwrap();
    }

    #[test]
    fn test_flush_now_writes_pending_keys() {
        use crate::capture::KeyInput;

        let platform = Arc::new(ScriptedPlatform::new());
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        let mut monitor = Monitor::new(config(), platform.clone(), storage.clone(), None);
        assert!(monitor.flush_now().is_err());

        monitor.start().unwrap();
        platform.emit_key(KeyInput::new("q"));
        platform.emit_key(KeyInput::new("w"));
        assert_eq!(monitor.buffered().keys, 2);

        let outcomes = monitor.flush_now().unwrap();
        assert!(outcomes.contains(&(BufferKind::Keys, FlushOutcome::Written(2))));
        assert_eq!(storage.row_counts().unwrap().keys, 2);
        assert_eq!(monitor.buffered().total(), 0);
        monitor.stop().unwrap();
    }

    #[test]
    fn test_sink_is_released_on_drop_not_on_stop() {
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        let mut monitor = Monitor::new(
            config(),
            Arc::new(ScriptedPlatform::new()),
            storage.clone(),
            None,
        );

        monitor.start().unwrap();
        monitor.stop().unwrap();
        assert!(Arc::strong_count(&storage) > 1);

        drop(monitor);
        assert_eq!(Arc::strong_count(&storage), 1);
    }

    #[test]
    fn test_encryption_without_cipher_is_config_error() {
        let mut config = config();
        config.encryption_enabled = true;
        let platform = Arc::new(ScriptedPlatform::new());
        let mut monitor = Monitor::new(
            config,
            platform.clone(),
            Arc::new(Storage::open_in_memory().unwrap()),
            None,
        );

        assert!(matches!(monitor.start(), Err(MonitorError::Config(_))));
        assert_eq!(monitor.state(), MonitorState::Stopped);
        assert_eq!(platform.keyboard_subscriptions(), 0);
    }

    #[test]
    fn test_permission_denied_returns_to_stopped() {
        let platform = Arc::new(ScriptedPlatform::with_permissions(Permissions {
            accessibility: true,
            input_monitoring: false,
            screen_recording: false,
        }));
        let mut monitor = Monitor::new(
            config(),
            platform.clone(),
            Arc::new(Storage::open_in_memory().unwrap()),
            None,
        );

        match monitor.start() {
            Err(MonitorError::Permission(e)) => assert_eq!(e.missing, vec!["Input Monitoring"]),
            other => panic!("expected permission error, got {other:?}"),
        }
        assert_eq!(monitor.state(), MonitorState::Stopped);
        assert_eq!(platform.mouse_subscriptions(), 0);
    }
}
