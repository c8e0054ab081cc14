//! Platform capture capability.
//!
//! The monitor never talks to the operating system directly. Everything it
//! needs from the host (focused window, key and mouse streams, permission
//! state) comes through the [`PlatformCapability`] trait. A concrete platform
//! is picked once at startup by [`create_platform`].

pub mod clock;
pub mod scripted;
pub mod types;

#[cfg(target_os = "macos")]
pub mod macos;

#[cfg(not(target_os = "macos"))]
pub mod noop;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

// Re-export commonly used types
pub use clock::MonotonicClock;
pub use scripted::ScriptedPlatform;
pub use types::{Bounds, KeyInput, MouseButton, MouseEventKind, MouseInput, WindowInfo};

/// Callback invoked by the platform for every key press.
pub type KeyCallback = Box<dyn Fn(KeyInput) + Send + Sync + 'static>;

/// Callback invoked by the platform for every mouse event.
pub type MouseCallback = Box<dyn Fn(MouseInput) + Send + Sync + 'static>;

/// Host permissions relevant to capture.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    pub accessibility: bool,
    pub input_monitoring: bool,
    pub screen_recording: bool,
}

impl Permissions {
    /// Every permission granted.
    pub fn all_granted() -> Self {
        Self {
            accessibility: true,
            input_monitoring: true,
            screen_recording: true,
        }
    }

    /// Accessibility and input monitoring are the minimum to run.
    pub fn is_sufficient(&self) -> bool {
        self.accessibility && self.input_monitoring
    }

    /// Names of required permissions that are not granted.
    pub fn missing_required(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if !self.accessibility {
            missing.push("Accessibility");
        }
        if !self.input_monitoring {
            missing.push("Input Monitoring");
        }
        missing
    }
}

/// Errors raised by a capture source.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("{0} capture is not supported on this platform")]
    Unsupported(&'static str),
    #[error("no focused window")]
    NoFocusedWindow,
    #[error("failed to install {source_name} hook: {reason}")]
    HookFailed {
        source_name: &'static str,
        reason: String,
    },
    #[error("platform query failed: {0}")]
    Query(String),
}

impl PlatformError {
    /// Whether retrying can ever succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(self, PlatformError::Unsupported(_))
    }
}

/// The narrow interface the monitor consumes from the host platform.
pub trait PlatformCapability: Send + Sync {
    /// Short platform name for logs.
    fn name(&self) -> &'static str;

    /// The currently focused window.
    fn current_window(&self) -> Result<WindowInfo, PlatformError>;

    /// Start delivering key presses to `callback` until the subscription is dropped.
    fn subscribe_keyboard(&self, callback: KeyCallback) -> Result<Subscription, PlatformError>;

    /// Start delivering mouse events to `callback` until the subscription is dropped.
    fn subscribe_mouse(&self, callback: MouseCallback) -> Result<Subscription, PlatformError>;

    /// Current permission state. Never blocks.
    fn check_permissions(&self) -> Permissions;

    /// Ask the user for missing permissions. May block on a system dialog.
    fn request_permissions(&self) -> bool;
}

/// Handle to a live event stream.
///
/// Dropping the handle (or calling [`Subscription::cancel`]) stops delivery.
/// A platform whose hook dies clears the liveness flag so the monitor can
/// resubscribe.
pub struct Subscription {
    alive: Arc<AtomicBool>,
    on_cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(alive: Arc<AtomicBool>, on_cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            alive,
            on_cancel: Some(Box::new(on_cancel)),
        }
    }

    /// A subscription that never delivers anything but reports itself alive.
    pub fn idle() -> Self {
        let alive = Arc::new(AtomicBool::new(true));
        let flag = alive.clone();
        Self::new(alive, move || flag.store(false, Ordering::SeqCst))
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Stop delivery and wait for the platform to release the hook.
    pub fn cancel(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(on_cancel) = self.on_cancel.take() {
            on_cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Create the capture platform for the current host.
#[cfg(target_os = "macos")]
pub fn create_platform() -> Arc<dyn PlatformCapability> {
    Arc::new(macos::MacOSPlatform::new())
}

/// Create the capture platform for the current host.
#[cfg(not(target_os = "macos"))]
pub fn create_platform() -> Arc<dyn PlatformCapability> {
    Arc::new(noop::NoopPlatform::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permissions_minimum_bar() {
        let mut permissions = Permissions::all_granted();
        assert!(permissions.is_sufficient());

        // Screen recording is best-effort
        permissions.screen_recording = false;
        assert!(permissions.is_sufficient());

        permissions.accessibility = false;
        assert!(!permissions.is_sufficient());
        assert_eq!(permissions.missing_required(), vec!["Accessibility"]);
    }

    #[test]
    fn test_subscription_cancel_runs_once() {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let subscription = Subscription::new(Arc::new(AtomicBool::new(true)), move || {
            assert!(!flag.swap(true, Ordering::SeqCst));
        });
        assert!(subscription.is_alive());
        subscription.cancel();
        assert!(cancelled.load(Ordering::SeqCst));
    }
}
