//! Turns raw platform observations into buffered records.

use crate::buffer::{BufferKind, Buffers};
use crate::capture::{KeyInput, MonotonicClock, MouseEventKind, MouseInput, WindowInfo};
use crate::config::Config;
use crate::crypto::PayloadCipher;
use crate::model::{KeyRecord, MouseRecord, ProcessRef, TerminalCommandRecord, WindowRecord};
use crate::monitor::flusher::Flusher;
use crate::transparency::{Counter, SharedTransparencyLog};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use zeroize::Zeroizing;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Consecutive identical keys not yet sealed into a record.
struct KeyRun {
    process: ProcessRef,
    pid: Option<i32>,
    text: Zeroizing<String>,
    count: u32,
    started_at: DateTime<Utc>,
}

/// Routes events from every producer into the buffers.
///
/// Called concurrently from the platform's callback threads and the monitor's
/// worker threads. A producer that pushes a buffer over its threshold flushes
/// that buffer itself before returning.
pub struct Router {
    config: Arc<Config>,
    cipher: Option<Arc<dyn PayloadCipher>>,
    buffers: Arc<Buffers>,
    flusher: Arc<Flusher>,
    transparency: SharedTransparencyLog,
    session_id: Option<i64>,
    accepting: AtomicBool,
    /// Most recent poll result, used to attribute keys and clicks
    focus: Mutex<Option<WindowInfo>>,
    key_run: Mutex<Option<KeyRun>>,
    key_clock: MonotonicClock,
    mouse_clock: MonotonicClock,
    window_clock: MonotonicClock,
    terminal_clock: MonotonicClock,
}

impl Router {
    pub fn new(
        config: Arc<Config>,
        cipher: Option<Arc<dyn PayloadCipher>>,
        buffers: Arc<Buffers>,
        flusher: Arc<Flusher>,
        transparency: SharedTransparencyLog,
        session_id: Option<i64>,
    ) -> Self {
        Self {
            config,
            cipher,
            buffers,
            flusher,
            transparency,
            session_id,
            accepting: AtomicBool::new(true),
            focus: Mutex::new(None),
            key_run: Mutex::new(None),
            key_clock: MonotonicClock::new(),
            mouse_clock: MonotonicClock::new(),
            window_clock: MonotonicClock::new(),
            terminal_clock: MonotonicClock::new(),
        }
    }

    /// Drop every event delivered from now on.
    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    fn accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Whether a coalesced key run is waiting to be sealed.
    pub fn has_pending_key(&self) -> bool {
        lock(&self.key_run).is_some()
    }

    /// Resolve the application an input belongs to.
    fn attribute(&self, application: Option<&str>, pid: Option<i32>) -> (ProcessRef, Option<i32>) {
        let focus = lock(&self.focus);
        match (application, focus.as_ref()) {
            (Some(app), Some(window)) if window.application == app => (
                ProcessRef::new(app, window.bundle_id.clone()),
                pid.or(Some(window.pid)),
            ),
            (Some(app), _) => (ProcessRef::new(app, None), pid),
            (None, Some(window)) => (
                ProcessRef::new(window.application.clone(), window.bundle_id.clone()),
                pid.or(Some(window.pid)),
            ),
            (None, None) => (ProcessRef::unknown(), pid),
        }
    }

    fn excluded(&self, process: &ProcessRef) -> bool {
        self.config
            .is_excluded(&process.name, process.bundle_id.as_deref())
    }

    pub fn on_key(&self, input: KeyInput) {
        if !self.accepting() {
            return;
        }

        let (process, pid) = self.attribute(input.application.as_deref(), input.pid);
        if self.excluded(&process) {
            self.transparency.increment(Counter::ExcludedEvents);
            return;
        }
        self.transparency.increment(Counter::KeysCaptured);
        let timestamp = self.key_clock.stamp(input.timestamp);

        let mut pending = lock(&self.key_run);
        let continues = pending.as_ref().is_some_and(|run| {
            run.process == process
                && run.count < u32::MAX
                && (!self.config.capture_text || run.text.as_str() == input.key)
        });

        let full = if continues {
            if let Some(run) = pending.as_mut() {
                run.count += 1;
            }
            false
        } else {
            let sealed = pending.replace(KeyRun {
                process,
                pid,
                text: Zeroizing::new(input.key),
                count: 1,
                started_at: timestamp,
            });
            sealed.is_some_and(|run| self.buffer_key(run))
        };
        drop(pending);

        if full {
            self.flusher.flush_kind(BufferKind::Keys, false);
        }
    }

    /// Seal the pending key run, if any, into the key buffer.
    pub fn seal_pending_key(&self) {
        let mut pending = lock(&self.key_run);
        let full = pending.take().is_some_and(|run| self.buffer_key(run));
        drop(pending);

        if full {
            self.flusher.flush_kind(BufferKind::Keys, false);
        }
    }

    /// Encrypt a sealed run and push it to the key buffer.
    ///
    /// Callers hold the `key_run` lock so runs reach the buffer in capture
    /// order. Returns whether the buffer reached its threshold.
    fn buffer_key(&self, run: KeyRun) -> bool {
        let (payload, encrypted) = if !self.config.capture_text {
            (Vec::new(), false)
        } else if self.config.encryption_enabled {
            let Some(cipher) = &self.cipher else {
                // Never store text unencrypted when encryption is on
                self.transparency
                    .record(Counter::EncryptionFailures, u64::from(run.count));
                tracing::error!("no cipher configured, dropping key event");
                return false;
            };
            match cipher.encrypt(run.text.as_bytes()) {
                Ok(ciphertext) => (ciphertext, true),
                Err(e) => {
                    self.transparency
                        .record(Counter::EncryptionFailures, u64::from(run.count));
                    tracing::error!(error = %e, count = run.count, "encryption failed, dropping key event");
                    return false;
                }
            }
        } else {
            (run.text.as_bytes().to_vec(), false)
        };

        let record = KeyRecord {
            process: run.process.clone(),
            pid: run.pid,
            payload,
            count: run.count,
            encrypted,
            created_at: run.started_at,
        };
        self.buffers.keys.push(record)
    }

    pub fn on_mouse(&self, input: MouseInput) {
        if !self.accepting() || !self.config.capture_mouse {
            return;
        }
        if input.kind == MouseEventKind::Move && !self.config.capture_mouse_moves {
            return;
        }

        let (process, pid) = self.attribute(None, input.pid);
        if self.excluded(&process) {
            self.transparency.increment(Counter::ExcludedEvents);
            return;
        }
        self.transparency.increment(Counter::MouseCaptured);

        let record = MouseRecord {
            process,
            pid,
            x: input.x,
            y: input.y,
            button: input.button,
            kind: input.kind,
            created_at: self.mouse_clock.stamp(input.timestamp),
        };
        if self.buffers.mouse.push(record) {
            self.flusher.flush_kind(BufferKind::Mouse, false);
        }
    }

    /// Record a window poll result. Only focus changes are buffered.
    pub fn on_window(&self, window: WindowInfo) {
        if !self.accepting() {
            return;
        }

        {
            let mut focus = lock(&self.focus);
            if focus.as_ref().is_some_and(|last| last.same_focus(&window)) {
                // Keep geometry and pid current without recording a change
                *focus = Some(window);
                return;
            }
            *focus = Some(window.clone());
        }

        let process = ProcessRef::new(window.application.clone(), window.bundle_id.clone());
        if self.excluded(&process) {
            self.transparency.increment(Counter::ExcludedEvents);
            return;
        }
        self.transparency.increment(Counter::WindowsCaptured);
        tracing::debug!(application = %window.application, "focus changed");

        let record = WindowRecord {
            process,
            pid: window.pid,
            title: window.title,
            bounds: window.bounds,
            created_at: self.window_clock.stamp(window.observed_at),
        };
        if self.buffers.windows.push(record) {
            self.flusher.flush_kind(BufferKind::Windows, false);
        }
    }

    pub fn on_terminal(&self, commands: Vec<TerminalCommandRecord>) {
        if !self.accepting() {
            return;
        }

        let mut flush = false;
        for mut command in commands {
            command.session_id = self.session_id;
            command.executed_at = self.terminal_clock.stamp(command.executed_at);
            self.transparency.increment(Counter::CommandsCaptured);
            flush |= self.buffers.terminal.push(command);
        }
        if flush {
            self.flusher.flush_kind(BufferKind::Terminal, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BufferConfig;
    use crate::crypto::{EncryptionError, Encryptor};
    use crate::storage::Storage;
    use crate::transparency::TransparencyLog;

    struct Harness {
        router: Router,
        buffers: Arc<Buffers>,
        transparency: SharedTransparencyLog,
    }

    fn harness(config: Config, cipher: Option<Arc<dyn PayloadCipher>>) -> Harness {
        let config = Arc::new(config);
        let buffers = Arc::new(Buffers::new(&BufferConfig {
            keys: 1000,
            mouse: 1000,
            windows: 1000,
            terminal: 1000,
            max_buffered_events: 10_000,
        }));
        let transparency: SharedTransparencyLog = Arc::new(TransparencyLog::new());
        let flusher = Arc::new(Flusher::new(
            Arc::new(Storage::open_in_memory().unwrap()),
            buffers.clone(),
            config.retry.clone(),
            transparency.clone(),
        ));
        let router = Router::new(
            config,
            cipher,
            buffers.clone(),
            flusher,
            transparency.clone(),
            None,
        );
        Harness {
            router,
            buffers,
            transparency,
        }
    }

    struct BrokenCipher;

    impl PayloadCipher for BrokenCipher {
        fn encrypt(&self, _plaintext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
            Err(EncryptionError::Encrypt)
        }
    }

    #[test]
    fn test_identical_keys_coalesce() {
        let mut config = Config::default();
        config.encryption_enabled = false;
        let h = harness(config, None);
        h.router.on_window(WindowInfo::new("Editor", "main.rs"));

        for key in ["a", "a", "a", "b"] {
            h.router.on_key(KeyInput::new(key));
        }
        h.router.seal_pending_key();

        let keys = h.buffers.keys.drain();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].payload, b"a");
        assert_eq!(keys[0].count, 3);
        assert_eq!(keys[0].process.name, "Editor");
        assert_eq!(keys[1].count, 1);
    }

    #[test]
    fn test_encrypted_payload_round_trips() {
        let encryptor = Arc::new(Encryptor::from_key([9u8; 32]));
        let h = harness(Config::default(), Some(encryptor.clone()));

        h.router.on_key(KeyInput::new("x"));
        h.router.seal_pending_key();

        let keys = h.buffers.keys.drain();
        assert!(keys[0].encrypted);
        assert_ne!(keys[0].payload, b"x");
        assert_eq!(encryptor.decrypt(&keys[0].payload).unwrap(), b"x");
    }

    #[test]
    fn test_cipher_failure_drops_event() {
        let h = harness(Config::default(), Some(Arc::new(BrokenCipher)));

        h.router.on_key(KeyInput::new("p"));
        h.router.on_key(KeyInput::new("w"));
        h.router.seal_pending_key();

        assert!(h.buffers.keys.is_empty());
        assert_eq!(h.transparency.get(Counter::EncryptionFailures), 2);
    }

    /// Sleeps on its first call, otherwise passes the text through.
    struct SlowCipher {
        first: AtomicBool,
    }

    impl PayloadCipher for SlowCipher {
        fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
            if self.first.swap(false, Ordering::SeqCst) {
                std::thread::sleep(std::time::Duration::from_millis(200));
            }
            Ok(plaintext.to_vec())
        }
    }

    #[test]
    fn test_seal_racing_new_keys_keeps_capture_order() {
        let cipher = Arc::new(SlowCipher {
            first: AtomicBool::new(true),
        });
        let h = harness(Config::default(), Some(cipher));

        h.router.on_key(KeyInput::new("a"));
        std::thread::scope(|scope| {
            let sealer = scope.spawn(|| h.router.seal_pending_key());
            std::thread::sleep(std::time::Duration::from_millis(50));
            h.router.on_key(KeyInput::new("b"));
            h.router.on_key(KeyInput::new("c"));
            sealer.join().unwrap();
        });
        h.router.seal_pending_key();

        let keys = h.buffers.keys.drain();
        let order: Vec<&[u8]> = keys.iter().map(|k| k.payload.as_slice()).collect();
        assert_eq!(order, vec![&b"a"[..], &b"b"[..], &b"c"[..]]);
        assert!(keys.windows(2).all(|w| w[0].created_at <= w[1].created_at));
    }

    #[test]
    fn test_count_only_mode() {
        let mut config = Config::default();
        config.capture_text = false;
        let h = harness(config, None);

        for key in ["s", "e", "c", "r", "e", "t"] {
            h.router.on_key(KeyInput::new(key));
        }
        h.router.seal_pending_key();

        let keys = h.buffers.keys.drain();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].count, 6);
        assert!(keys[0].payload.is_empty());
    }

    #[test]
    fn test_window_dedup_and_exclusion() {
        let mut config = Config::default();
        config.exclude_applications = vec!["Vault".into()];
        let h = harness(config, None);

        h.router.on_window(WindowInfo::new("Editor", "main.rs"));
        h.router.on_window(WindowInfo::new("Editor", "main.rs").with_pid(7));
        h.router.on_window(WindowInfo::new("Vault", "secrets"));
        h.router.on_key(KeyInput::new("z"));
        h.router.on_window(WindowInfo::new("Editor", "main.rs"));

        let windows = h.buffers.windows.drain();
        assert_eq!(
            windows.iter().map(|w| w.process.name.as_str()).collect::<Vec<_>>(),
            vec!["Editor", "Editor"]
        );
        assert!(!h.router.has_pending_key());
        assert_eq!(h.transparency.get(Counter::ExcludedEvents), 2);
    }

    #[test]
    fn test_mouse_moves_are_optional() {
        let h = harness(Config::default(), None);
        h.router.on_mouse(MouseInput::movement(1, 1));
        h.router.on_mouse(MouseInput::click(1, 1, crate::capture::MouseButton::Left));
        assert_eq!(h.buffers.mouse.len(), 1);
    }

    #[test]
    fn test_stopped_router_ignores_events() {
        let h = harness(Config::default(), None);
        h.router.stop_accepting();
        h.router.on_mouse(MouseInput::click(1, 1, crate::capture::MouseButton::Left));
        h.router.on_window(WindowInfo::new("Editor", "main.rs"));
        assert_eq!(h.buffers.counts().total(), 0);
    }
}
