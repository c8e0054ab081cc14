//! Background threads run by the monitor while it is running.
//!
//! Every loop selects on a shutdown channel that is never sent on; dropping
//! the sender disconnects it and the loops exit.

use crate::capture::{PlatformCapability, PlatformError, Subscription};
use crate::config::{Config, RetryConfig};
use crate::monitor::flusher::{backoff_delay, Flusher};
use crate::monitor::router::Router;
use crate::terminal::TerminalTracker;
use crate::transparency::{Counter, SharedTransparencyLog};
use crossbeam_channel::{select, tick, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// How often the supervisor checks subscription health.
pub(crate) const SUPERVISE_INTERVAL: Duration = Duration::from_millis(100);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Capture sources whose failures are tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Keyboard,
    Mouse,
    Window,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Keyboard => "keyboard",
            Source::Mouse => "mouse",
            Source::Window => "window",
        }
    }
}

/// Raised when every enabled capture source is down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllSourcesFailed {
    pub sources: Vec<&'static str>,
}

#[derive(Debug, Clone)]
struct SourceStatus {
    source: Source,
    failures: u32,
    permanent: bool,
    retry_at: Option<Instant>,
}

/// Consecutive-failure bookkeeping for the capture sources.
pub struct SourceHealth {
    statuses: Mutex<Vec<SourceStatus>>,
    max_failures: u32,
    retry: RetryConfig,
    alarm: Sender<AllSourcesFailed>,
    transparency: SharedTransparencyLog,
    reported: Mutex<bool>,
}

impl SourceHealth {
    pub fn new(
        config: &Config,
        alarm: Sender<AllSourcesFailed>,
        transparency: SharedTransparencyLog,
    ) -> Self {
        let mut sources = vec![Source::Keyboard];
        if config.capture_mouse {
            sources.push(Source::Mouse);
        }
        if config.capture_windows {
            sources.push(Source::Window);
        }

        Self {
            statuses: Mutex::new(
                sources
                    .into_iter()
                    .map(|source| SourceStatus {
                        source,
                        failures: 0,
                        permanent: false,
                        retry_at: None,
                    })
                    .collect(),
            ),
            max_failures: config.max_source_failures,
            retry: config.retry.clone(),
            alarm,
            transparency,
            reported: Mutex::new(false),
        }
    }

    pub fn record_success(&self, source: Source) {
        let mut statuses = lock(&self.statuses);
        if let Some(status) = statuses.iter_mut().find(|s| s.source == source) {
            if status.failures > 0 {
                tracing::info!(source = source.as_str(), "capture source recovered");
            }
            status.failures = 0;
            status.retry_at = None;
        }
        drop(statuses);
        *lock(&self.reported) = false;
    }

    /// Count a failure and schedule the next attempt.
    pub fn record_failure(&self, source: Source, error: &PlatformError) {
        self.transparency.increment(Counter::PlatformErrors);

        let all_down = {
            let mut statuses = lock(&self.statuses);
            let Some(status) = statuses.iter_mut().find(|s| s.source == source) else {
                return;
            };
            status.failures = status.failures.saturating_add(1);
            status.permanent |= error.is_permanent();
            let delay = backoff_delay(&self.retry, status.failures);
            status.retry_at = Some(Instant::now() + delay);
            tracing::warn!(
                source = source.as_str(),
                failures = status.failures,
                retry_in_ms = delay.as_millis() as u64,
                error = %error,
                "capture source failed"
            );

            let max = self.max_failures;
            statuses
                .iter()
                .all(|s| s.permanent || s.failures >= max)
                .then(|| statuses.iter().map(|s| s.source.as_str()).collect::<Vec<_>>())
        };

        if let Some(sources) = all_down {
            let mut reported = lock(&self.reported);
            if !*reported {
                *reported = true;
                tracing::error!(sources = ?sources, "all capture sources failed");
                let _ = self.alarm.try_send(AllSourcesFailed { sources });
            }
        }
    }

    /// Whether `source` may be retried now.
    pub fn ready(&self, source: Source) -> bool {
        let statuses = lock(&self.statuses);
        statuses
            .iter()
            .find(|s| s.source == source)
            .map_or(false, |s| {
                !s.permanent && s.retry_at.map_or(true, |at| Instant::now() >= at)
            })
    }

    pub fn is_permanent(&self, source: Source) -> bool {
        lock(&self.statuses)
            .iter()
            .any(|s| s.source == source && s.permanent)
    }
}

/// Live platform subscriptions, replaced by the supervisor when they die.
#[derive(Debug, Default)]
pub struct Subscriptions {
    pub keyboard: Option<Subscription>,
    pub mouse: Option<Subscription>,
}

impl Subscriptions {
    /// Cancel every subscription and wait for the platform to release it.
    pub fn cancel_all(&mut self) {
        if let Some(subscription) = self.keyboard.take() {
            subscription.cancel();
        }
        if let Some(subscription) = self.mouse.take() {
            subscription.cancel();
        }
    }
}

/// Subscribe `source` to the router, recording the outcome.
pub fn subscribe(
    platform: &dyn PlatformCapability,
    router: &Arc<Router>,
    health: &SourceHealth,
    source: Source,
) -> Option<Subscription> {
    let result = match source {
        Source::Keyboard => {
            let router = router.clone();
            platform.subscribe_keyboard(Box::new(move |input| router.on_key(input)))
        }
        Source::Mouse => {
            let router = router.clone();
            platform.subscribe_mouse(Box::new(move |input| router.on_mouse(input)))
        }
        Source::Window => return None,
    };

    match result {
        Ok(subscription) => {
            health.record_success(source);
            tracing::debug!(source = source.as_str(), "subscribed");
            Some(subscription)
        }
        Err(e) => {
            health.record_failure(source, &e);
            None
        }
    }
}

/// Poll the focused window every `interval`.
pub fn window_poll_loop(
    platform: Arc<dyn PlatformCapability>,
    router: Arc<Router>,
    health: Arc<SourceHealth>,
    interval: Duration,
    shutdown: Receiver<()>,
) {
    let ticker = tick(interval);
    loop {
        select! {
            recv(shutdown) -> _ => break,
            recv(ticker) -> _ => {
                if !health.ready(Source::Window) {
                    if health.is_permanent(Source::Window) {
                        tracing::info!("window capture unavailable, stopping window poll");
                        break;
                    }
                    continue;
                }
                match platform.current_window() {
                    Ok(window) => {
                        health.record_success(Source::Window);
                        router.on_window(window);
                    }
                    // Desktop focused or a transition in progress
                    Err(PlatformError::NoFocusedWindow) => {}
                    Err(e) => health.record_failure(Source::Window, &e),
                }
            }
        }
    }
}

/// Seal pending keys and flush every buffer on a fixed period.
pub fn flush_timer_loop(
    router: Arc<Router>,
    flusher: Arc<Flusher>,
    interval: Duration,
    shutdown: Receiver<()>,
) {
    let ticker = tick(interval);
    loop {
        select! {
            recv(shutdown) -> _ => break,
            recv(ticker) -> _ => {
                router.seal_pending_key();
                flusher.flush_all(false);
            }
        }
    }
}

/// Read new shell history on a fixed period.
pub fn terminal_loop(
    mut tracker: TerminalTracker,
    router: Arc<Router>,
    interval: Duration,
    shutdown: Receiver<()>,
) {
    let ticker = tick(interval);
    loop {
        select! {
            recv(shutdown) -> _ => break,
            recv(ticker) -> _ => {
                let commands = tracker.poll();
                if !commands.is_empty() {
                    router.on_terminal(commands);
                }
            }
        }
    }
}

/// Resubscribe dead or missing input streams, with backoff.
pub fn supervisor_loop(
    platform: Arc<dyn PlatformCapability>,
    router: Arc<Router>,
    health: Arc<SourceHealth>,
    subscriptions: Arc<Mutex<Subscriptions>>,
    capture_mouse: bool,
    shutdown: Receiver<()>,
) {
    let ticker = tick(SUPERVISE_INTERVAL);
    loop {
        select! {
            recv(shutdown) -> _ => break,
            recv(ticker) -> _ => {
                let mut subs = lock(&subscriptions);
                supervise(platform.as_ref(), &router, &health, &mut subs.keyboard, Source::Keyboard);
                if capture_mouse {
                    supervise(platform.as_ref(), &router, &health, &mut subs.mouse, Source::Mouse);
                }
            }
        }
    }
}

fn supervise(
    platform: &dyn PlatformCapability,
    router: &Arc<Router>,
    health: &SourceHealth,
    slot: &mut Option<Subscription>,
    source: Source,
) {
    if slot.as_ref().is_some_and(|s| s.is_alive()) {
        return;
    }
    if let Some(dead) = slot.take() {
        health.record_failure(
            source,
            &PlatformError::HookFailed {
                source_name: source.as_str(),
                reason: "event stream stopped".to_string(),
            },
        );
        dead.cancel();
    }
    if health.ready(source) {
        *slot = subscribe(platform, router, health, source);
    }
}
