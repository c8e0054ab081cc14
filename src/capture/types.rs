//! Raw observations handed to the monitor by a platform capability.
//!
//! Every value here is stamped at capture time by the producer that saw it.
//! Nothing in this module is persisted directly; the monitor turns these into
//! records (see [`crate::monitor`]).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Screen rectangle of a window, in global display coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bounds {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

/// The focused window as reported by one poll of the platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowInfo {
    /// Window title
    pub title: String,
    /// Owning application (process) name
    pub application: String,
    /// Bundle or package identifier, when the platform knows one
    pub bundle_id: Option<String>,
    /// Owning process id
    pub pid: i32,
    /// Window geometry
    pub bounds: Bounds,
    /// When the window was observed
    pub observed_at: DateTime<Utc>,
}

impl WindowInfo {
    pub fn new(application: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            application: application.into(),
            bundle_id: None,
            pid: 0,
            bounds: Bounds::default(),
            observed_at: Utc::now(),
        }
    }

    pub fn with_bundle_id(mut self, bundle_id: impl Into<String>) -> Self {
        self.bundle_id = Some(bundle_id.into());
        self
    }

    pub fn with_pid(mut self, pid: i32) -> Self {
        self.pid = pid;
        self
    }

    pub fn with_bounds(mut self, bounds: Bounds) -> Self {
        self.bounds = bounds;
        self
    }

    /// Two observations describe the same focus when application and title match.
    ///
    /// Geometry and pid are ignored: moving a window is not a focus change.
    pub fn same_focus(&self, other: &WindowInfo) -> bool {
        self.application == other.application && self.title == other.title
    }
}

/// A key press delivered by the keyboard stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyInput {
    /// Printable text or a bracketed key name such as `<Return>`
    pub key: String,
    /// Process that received the key, when the platform reports it
    pub pid: Option<i32>,
    /// Application that received the key, when the platform reports it
    pub application: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl KeyInput {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            pid: None,
            application: None,
            timestamp: Utc::now(),
        }
    }

    pub fn in_application(mut self, application: impl Into<String>, pid: i32) -> Self {
        self.application = Some(application.into());
        self.pid = Some(pid);
        self
    }
}

/// Mouse button identifier.
///
/// Scroll directions are encoded as buttons 4 and 5, following the X11 convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MouseButton {
    None,
    Left,
    Middle,
    Right,
    ScrollUp,
    ScrollDown,
}

impl MouseButton {
    /// Numeric code stored in the `clicks.button` column.
    pub fn code(self) -> i64 {
        match self {
            MouseButton::None => 0,
            MouseButton::Left => 1,
            MouseButton::Middle => 2,
            MouseButton::Right => 3,
            MouseButton::ScrollUp => 4,
            MouseButton::ScrollDown => 5,
        }
    }

    pub fn from_code(code: i64) -> Self {
        match code {
            1 => MouseButton::Left,
            2 => MouseButton::Middle,
            3 => MouseButton::Right,
            4 => MouseButton::ScrollUp,
            5 => MouseButton::ScrollDown,
            _ => MouseButton::None,
        }
    }
}

/// Mouse event classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseEventKind {
    Click,
    Move,
    Scroll,
}

impl MouseEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MouseEventKind::Click => "click",
            MouseEventKind::Move => "move",
            MouseEventKind::Scroll => "scroll",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "click" => Some(MouseEventKind::Click),
            "move" => Some(MouseEventKind::Move),
            "scroll" => Some(MouseEventKind::Scroll),
            _ => None,
        }
    }
}

/// A mouse event delivered by the mouse stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MouseInput {
    pub x: i32,
    pub y: i32,
    pub button: MouseButton,
    pub kind: MouseEventKind,
    pub pid: Option<i32>,
    pub timestamp: DateTime<Utc>,
}

impl MouseInput {
    /// Create a click event at the given position.
    pub fn click(x: i32, y: i32, button: MouseButton) -> Self {
        Self {
            x,
            y,
            button,
            kind: MouseEventKind::Click,
            pid: None,
            timestamp: Utc::now(),
        }
    }

    /// Create a movement event.
    pub fn movement(x: i32, y: i32) -> Self {
        Self {
            x,
            y,
            button: MouseButton::None,
            kind: MouseEventKind::Move,
            pid: None,
            timestamp: Utc::now(),
        }
    }

    /// Create a scroll event; the sign of `delta_y` picks the direction.
    pub fn scroll(x: i32, y: i32, delta_y: f64) -> Self {
        Self {
            x,
            y,
            button: if delta_y > 0.0 {
                MouseButton::ScrollUp
            } else {
                MouseButton::ScrollDown
            },
            kind: MouseEventKind::Scroll,
            pid: None,
            timestamp: Utc::now(),
        }
    }
}
