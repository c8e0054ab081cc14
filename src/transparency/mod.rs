//! Transparency module for the Footprint agent.
//!
//! Tracks how much the agent captured, persisted and lost so users can audit
//! the daemon without opening the database.

pub mod log;

pub use log::{Counter, SharedTransparencyLog, TransparencyLog, TransparencyStats};
