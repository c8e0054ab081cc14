//! Permission gate in front of the capture platform.

use crate::capture::{PlatformCapability, Permissions};
use thiserror::Error;

/// Required permissions were not granted.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("missing required permissions: {}", missing.join(", "))]
pub struct PermissionError {
    pub missing: Vec<&'static str>,
}

impl PermissionError {
    /// Instructions for granting the missing permissions by hand.
    pub fn instructions(&self) -> String {
        let mut text = String::from("Grant the following in System Settings > Privacy & Security:\n");
        for name in &self.missing {
            text.push_str(&format!("  - {name}: add this terminal or the footprint binary\n"));
        }
        text.push_str("Then restart footprint.");
        text
    }
}

/// Decides whether the platform is ready to be monitored.
pub struct PermissionGate<'a> {
    platform: &'a dyn PlatformCapability,
}

impl<'a> PermissionGate<'a> {
    pub fn new(platform: &'a dyn PlatformCapability) -> Self {
        Self { platform }
    }

    /// Current permission state. Never blocks.
    pub fn check(&self) -> Permissions {
        self.platform.check_permissions()
    }

    /// Ask for missing permissions, returning whether monitoring may proceed.
    ///
    /// Does nothing if the minimum is already granted. May block on a
    /// system dialog.
    pub fn request_if_missing(&self) -> bool {
        if self.check().is_sufficient() {
            return true;
        }
        tracing::info!("requesting capture permissions");
        self.platform.request_permissions() && self.check().is_sufficient()
    }

    /// Check, request once if needed, and return the final state.
    pub fn ensure(&self) -> Result<Permissions, PermissionError> {
        if !self.request_if_missing() {
            let missing = self.check().missing_required();
            return Err(PermissionError { missing });
        }

        let permissions = self.check();
        if !permissions.screen_recording {
            tracing::warn!("screen recording not granted; window titles may be empty");
        }
        Ok(permissions)
    }
}
