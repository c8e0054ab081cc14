//! Scripted platform used as a test double.
//!
//! Events are injected by the caller instead of being read from the host, so
//! tests can drive the monitor deterministically. It is the only event
//! generator in the crate; production builds use the host platform from
//! [`crate::capture::create_platform`].

use crate::capture::{
    KeyCallback, KeyInput, MouseCallback, MouseInput, PlatformCapability, PlatformError,
    Permissions, Subscription, WindowInfo,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

type Slot<C> = Arc<Mutex<Option<(Arc<C>, Arc<AtomicBool>)>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// A platform whose observations are supplied by the caller.
pub struct ScriptedPlatform {
    permissions: Mutex<Permissions>,
    grant_on_request: AtomicBool,
    permission_requests: AtomicUsize,
    windows: Mutex<VecDeque<WindowInfo>>,
    window_polls: AtomicUsize,
    failing_polls: AtomicUsize,
    keyboard: Slot<KeyCallback>,
    mouse: Slot<MouseCallback>,
    keyboard_subscriptions: AtomicUsize,
    mouse_subscriptions: AtomicUsize,
    failing_keyboard_subscribes: AtomicUsize,
}

impl ScriptedPlatform {
    /// A platform with every permission granted and no window script.
    pub fn new() -> Self {
        Self::with_permissions(Permissions::all_granted())
    }

    pub fn with_permissions(permissions: Permissions) -> Self {
        Self {
            permissions: Mutex::new(permissions),
            grant_on_request: AtomicBool::new(false),
            permission_requests: AtomicUsize::new(0),
            windows: Mutex::new(VecDeque::new()),
            window_polls: AtomicUsize::new(0),
            failing_polls: AtomicUsize::new(0),
            keyboard: Arc::new(Mutex::new(None)),
            mouse: Arc::new(Mutex::new(None)),
            keyboard_subscriptions: AtomicUsize::new(0),
            mouse_subscriptions: AtomicUsize::new(0),
            failing_keyboard_subscribes: AtomicUsize::new(0),
        }
    }

    /// Grant every permission when the monitor asks for them.
    pub fn grant_on_request(&self, grant: bool) {
        self.grant_on_request.store(grant, Ordering::SeqCst);
    }

    /// Append windows to the poll script.
    ///
    /// Each poll consumes one window; the last one keeps being reported.
    pub fn script_windows(&self, windows: impl IntoIterator<Item = WindowInfo>) {
        lock(&self.windows).extend(windows);
    }

    /// Make the next `count` window polls fail.
    pub fn fail_next_polls(&self, count: usize) {
        self.failing_polls.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` keyboard subscription attempts fail.
    pub fn fail_next_keyboard_subscribes(&self, count: usize) {
        self.failing_keyboard_subscribes.store(count, Ordering::SeqCst);
    }

    /// Deliver a key press to the keyboard subscriber, if any.
    pub fn emit_key(&self, input: KeyInput) -> bool {
        let callback = lock(&self.keyboard)
            .as_ref()
            .filter(|(_, alive)| alive.load(Ordering::SeqCst))
            .map(|(callback, _)| callback.clone());
        match callback {
            Some(callback) => {
                callback(input);
                true
            }
            None => false,
        }
    }

    /// Deliver a mouse event to the mouse subscriber, if any.
    pub fn emit_mouse(&self, input: MouseInput) -> bool {
        let callback = lock(&self.mouse)
            .as_ref()
            .filter(|(_, alive)| alive.load(Ordering::SeqCst))
            .map(|(callback, _)| callback.clone());
        match callback {
            Some(callback) => {
                callback(input);
                true
            }
            None => false,
        }
    }

    /// Simulate the keyboard hook dying underneath its subscription.
    pub fn kill_keyboard(&self) {
        if let Some((_, alive)) = lock(&self.keyboard).take() {
            alive.store(false, Ordering::SeqCst);
        }
    }

    pub fn has_keyboard_subscriber(&self) -> bool {
        lock(&self.keyboard).is_some()
    }

    pub fn has_mouse_subscriber(&self) -> bool {
        lock(&self.mouse).is_some()
    }

    /// Total successful keyboard subscriptions.
    pub fn keyboard_subscriptions(&self) -> usize {
        self.keyboard_subscriptions.load(Ordering::SeqCst)
    }

    /// Total successful mouse subscriptions.
    pub fn mouse_subscriptions(&self) -> usize {
        self.mouse_subscriptions.load(Ordering::SeqCst)
    }

    pub fn window_polls(&self) -> usize {
        self.window_polls.load(Ordering::SeqCst)
    }

    pub fn permission_requests(&self) -> usize {
        self.permission_requests.load(Ordering::SeqCst)
    }

    fn install<C: ?Sized>(slot: &Slot<C>, callback: Arc<C>) -> Subscription
    where
        C: Send + Sync + 'static,
    {
        let alive = Arc::new(AtomicBool::new(true));
        *lock(slot) = Some((callback, alive.clone()));

        let slot = slot.clone();
        let flag = alive.clone();
        Subscription::new(alive, move || {
            flag.store(false, Ordering::SeqCst);
            let mut current = lock(&slot);
            // Only clear the slot if it still holds this subscription
            if current
                .as_ref()
                .is_some_and(|(_, installed)| Arc::ptr_eq(installed, &flag))
            {
                *current = None;
            }
        })
    }
}

impl Default for ScriptedPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl PlatformCapability for ScriptedPlatform {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn current_window(&self) -> Result<WindowInfo, PlatformError> {
        self.window_polls.fetch_add(1, Ordering::SeqCst);

        let failing = self
            .failing_polls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(PlatformError::Query("scripted poll failure".to_string()));
        }

        let mut windows = lock(&self.windows);
        let window = if windows.len() > 1 {
            windows.pop_front()
        } else {
            windows.front().cloned()
        };
        window.ok_or(PlatformError::NoFocusedWindow)
    }

    fn subscribe_keyboard(&self, callback: KeyCallback) -> Result<Subscription, PlatformError> {
        let failing = self
            .failing_keyboard_subscribes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(PlatformError::HookFailed {
                source_name: "keyboard",
                reason: "scripted failure".to_string(),
            });
        }

        self.keyboard_subscriptions.fetch_add(1, Ordering::SeqCst);
        Ok(Self::install(&self.keyboard, Arc::new(callback)))
    }

    fn subscribe_mouse(&self, callback: MouseCallback) -> Result<Subscription, PlatformError> {
        self.mouse_subscriptions.fetch_add(1, Ordering::SeqCst);
        Ok(Self::install(&self.mouse, Arc::new(callback)))
    }

    fn check_permissions(&self) -> Permissions {
        *lock(&self.permissions)
    }

    fn request_permissions(&self) -> bool {
        self.permission_requests.fetch_add(1, Ordering::SeqCst);
        if self.grant_on_request.load(Ordering::SeqCst) {
            *lock(&self.permissions) = Permissions::all_granted();
        }
        lock(&self.permissions).is_sufficient()
    }
}
