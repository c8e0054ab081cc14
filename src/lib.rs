//! Footprint - local activity telemetry daemon.
//!
//! This library observes keyboard, mouse, focused-window and shell activity
//! on the local machine and records it in a SQLite database for later
//! review. Nothing leaves the machine.
//!
//! # Privacy Guarantees
//!
//! - **Encrypted key content**: typed text is encrypted before it is buffered;
//!   if encryption fails the event is dropped, never stored in the clear
//! - **Count-only mode**: with `capture_text` off only per-app key counts are kept
//! - **Exclusions**: excluded applications are never recorded
//! - **Transparency**: all collection is counted and auditable
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                           Monitor                            │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐         │
//! │  │  Platform   │──▶│   Router    │──▶│   Buffers   │         │
//! │  │  (capture)  │   │ (+ cipher)  │   │ (per kind)  │         │
//! │  └─────────────┘   └─────────────┘   └─────────────┘         │
//! │         │                 │                 │                │
//! │         ▼                 ▼                 ▼                │
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐         │
//! │  │ Permission  │   │Transparency │   │   Flusher   │──▶ SQLite│
//! │  │    Gate     │   │    Log      │   │ (+ backoff) │         │
//! │  └─────────────┘   └─────────────┘   └─────────────┘         │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use footprint_agent::{capture, Config, Encryptor, Monitor, Storage};
//!
//! let config = Config::load().expect("config");
//! let storage = Arc::new(Storage::open(&config.database_path).expect("storage"));
//! let cipher = Arc::new(Encryptor::open(&config.data_dir(), None).expect("key"));
//!
//! let mut monitor = Monitor::new(config, capture::create_platform(), storage, Some(cipher));
//! monitor.start().expect("start");
//! // ...
//! let report = monitor.stop().expect("stop");
//! println!("flushed {} events", report.flushed);
//! ```

pub mod buffer;
pub mod capture;
pub mod config;
pub mod crypto;
pub mod model;
pub mod monitor;
pub mod permissions;
pub mod stats;
pub mod storage;
pub mod terminal;
pub mod transparency;

// Re-export key types at crate root for convenience
pub use buffer::{BufferKind, BufferedCounts};
pub use capture::{PlatformCapability, PlatformError, Permissions, ScriptedPlatform};
pub use config::{Config, ConfigError};
pub use crypto::{EncryptionError, Encryptor, PayloadCipher};
pub use monitor::{AllSourcesFailed, Monitor, MonitorError, MonitorState, StopReport};
pub use permissions::{PermissionError, PermissionGate};
pub use stats::{ActivityStats, StatsAggregator, TerminalSummary, TimelineEntry};
pub use storage::{EventSink, Storage, StorageError};
pub use terminal::TerminalTracker;
pub use transparency::{Counter, SharedTransparencyLog, TransparencyLog, TransparencyStats};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Privacy declaration that can be displayed to users.
pub const PRIVACY_DECLARATION: &str = r#"
╔══════════════════════════════════════════════════════════════════╗
║                FOOTPRINT - PRIVACY DECLARATION                   ║
╠══════════════════════════════════════════════════════════════════╣
║                                                                  ║
║  Footprint records your own activity on this machine only.       ║
║                                                                  ║
║  ✓ WHAT WE CAPTURE:                                              ║
║    • Typed text, encrypted with a key that stays on this machine ║
║      (or only per-app key counts when text capture is off)       ║
║    • Mouse clicks and scrolls with position and button           ║
║    • The focused application and window title                    ║
║    • Commands from your shell history                            ║
║                                                                  ║
║  ✗ WHAT WE NEVER DO:                                             ║
║    • Store typed text unencrypted when encryption is enabled     ║
║    • Record applications on the exclusion list                   ║
║    • Capture screen content                                      ║
║    • Send anything over the network                              ║
║                                                                  ║
║  All data stays in a local SQLite database. You can view         ║
║  collection statistics anytime with:                             ║
║    footprint stats                                               ║
║                                                                  ║
╚══════════════════════════════════════════════════════════════════╝
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_privacy_declaration_contents() {
        assert!(PRIVACY_DECLARATION.contains("PRIVACY"));
        assert!(PRIVACY_DECLARATION.contains("NEVER DO"));
        assert!(PRIVACY_DECLARATION.contains("encrypted"));
        assert!(PRIVACY_DECLARATION.contains("footprint stats"));
    }
}
