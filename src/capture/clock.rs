//! Per-producer monotonic timestamps.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};

/// Clamps a producer's capture timestamps so they never go backwards.
///
/// Wall-clock adjustments (NTP steps, manual changes) can move `Utc::now()`
/// backwards; events from one producer keep their capture order regardless.
#[derive(Debug)]
pub struct MonotonicClock {
    last_micros: AtomicI64,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            last_micros: AtomicI64::new(i64::MIN),
        }
    }

    /// Return `observed`, or the last stamp handed out if that is later.
    pub fn stamp(&self, observed: DateTime<Utc>) -> DateTime<Utc> {
        let micros = observed.timestamp_micros();
        let previous = self.last_micros.fetch_max(micros, Ordering::SeqCst);
        if previous > micros {
            DateTime::from_timestamp_micros(previous).unwrap_or(observed)
        } else {
            observed
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_stamp_never_regresses() {
        let clock = MonotonicClock::new();
        let now = DateTime::from_timestamp_micros(1_700_000_000_000_000).unwrap();

        assert_eq!(clock.stamp(now), now);
        // A wall-clock step backwards is clamped to the previous stamp
        assert_eq!(clock.stamp(now - Duration::seconds(5)), now);
        let later = now + Duration::milliseconds(10);
        assert_eq!(clock.stamp(later), later);
    }
}
