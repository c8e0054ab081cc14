//! Non-macOS (noop) platform.
//!
//! This exists so the crate (and binary) can build and run on hosts without a
//! capture backend. Streams never deliver events and there is no window to
//! report; no permission gate exists, so everything reads as granted.

use crate::capture::{
    KeyCallback, MouseCallback, PlatformCapability, PlatformError, Permissions, Subscription,
    WindowInfo,
};

/// A platform that never emits events.
#[derive(Debug, Default)]
pub struct NoopPlatform;

impl NoopPlatform {
    pub fn new() -> Self {
        Self
    }
}

impl PlatformCapability for NoopPlatform {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn current_window(&self) -> Result<WindowInfo, PlatformError> {
        Err(PlatformError::Unsupported("window"))
    }

    fn subscribe_keyboard(&self, _callback: KeyCallback) -> Result<Subscription, PlatformError> {
        Ok(Subscription::idle())
    }

    fn subscribe_mouse(&self, _callback: MouseCallback) -> Result<Subscription, PlatformError> {
        Ok(Subscription::idle())
    }

    fn check_permissions(&self) -> Permissions {
        Permissions::all_granted()
    }

    fn request_permissions(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_platform() {
        let platform = NoopPlatform::new();
        assert!(platform.check_permissions().is_sufficient());
        assert!(platform.current_window().unwrap_err().is_permanent());

        let subscription = platform.subscribe_keyboard(Box::new(|_| {})).unwrap();
        assert!(subscription.is_alive());
    }
}
