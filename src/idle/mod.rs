//! Idle detection: turns the activity clock into persisted idle intervals.

mod detector;

use chrono::{DateTime, Utc};

use crate::storage::EventId;

pub use detector::IdleDetector;

/// A state change performed by the idle detector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Active → Idle: a new interval was opened.
    Opened {
        event_id: EventId,
        idle_start: DateTime<Utc>,
    },
    /// Idle → Active: the open interval was closed.
    Closed {
        event_id: EventId,
        duration_seconds: i64,
        /// Closed during shutdown rather than by renewed activity.
        finalizing: bool,
    },
}

/// Whole seconds between `start` and `end`, never negative.
pub fn idle_duration_seconds(start: DateTime<Utc>, end: DateTime<Utc>) -> i64 {
    (end - start).num_seconds().max(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_duration_truncates_to_whole_seconds() {
        let start = Utc::now();
        let end = start + Duration::milliseconds(10_900);
        assert_eq!(idle_duration_seconds(start, end), 10);
    }

    #[test]
    fn test_duration_clamps_clock_skew_to_zero() {
        let start = Utc::now();
        assert_eq!(idle_duration_seconds(start, start - Duration::seconds(4)), 0);
    }
}
