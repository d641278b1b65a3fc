//! Shared state passed explicitly to every agent task.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};

use crate::storage::{EventId, SessionId, SessionStore};

/// Time of the last observed user activity.
#[derive(Debug, Clone)]
pub struct ActivityClock {
    last_activity: DateTime<Utc>,
}

impl ActivityClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { last_activity: now }
    }

    /// Record activity happening now.
    pub fn touch(&mut self) {
        self.touch_at(Utc::now());
    }

    pub fn touch_at(&mut self, now: DateTime<Utc>) {
        self.last_activity = now;
    }

    /// Record input that happened at `at`, ignoring readings older than the
    /// activity already recorded. Returns true when the clock moved.
    pub fn observe(&mut self, at: DateTime<Utc>) -> bool {
        if at > self.last_activity {
            self.last_activity = at;
            true
        } else {
            false
        }
    }

    /// Time since the last activity.
    pub fn elapsed_since(&self) -> Duration {
        self.elapsed_at(Utc::now())
    }

    /// Time between the last activity and `now`, zero if the wall clock went backwards.
    pub fn elapsed_at(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_activity).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_activity
    }
}

/// Idle detector state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdlePhase {
    Active,
    /// Idle with an open interval persisted under `event_id`.
    Idle {
        event_id: EventId,
        idle_start: DateTime<Utc>,
    },
}

/// Everything guarded by the agent's single lock.
#[derive(Debug)]
pub struct TrackerState {
    pub clock: ActivityClock,
    pub phase: IdlePhase,
}

/// Context shared by the activity source, the idle detector and the session
/// controller for the lifetime of one session.
pub struct AgentContext {
    session_id: SessionId,
    threshold: Duration,
    running: AtomicBool,
    state: Mutex<TrackerState>,
    store: Arc<dyn SessionStore>,
}

impl AgentContext {
    pub fn new(
        session_id: SessionId,
        threshold: Duration,
        store: Arc<dyn SessionStore>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id,
            threshold,
            running: AtomicBool::new(true),
            state: Mutex::new(TrackerState {
                clock: ActivityClock::new(started_at),
                phase: IdlePhase::Active,
            }),
            store,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    pub fn store(&self) -> &dyn SessionStore {
        self.store.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Ask every loop to exit at its next check point.
    pub fn halt(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Acquire the lock over the clock and idle phase.
    pub async fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().await
    }

    /// Report activity now.
    pub async fn touch(&self) {
        self.state.lock().await.clock.touch();
    }

    /// Report input observed at `at`. See [`ActivityClock::observe`].
    pub async fn observe_input(&self, at: DateTime<Utc>) -> bool {
        self.state.lock().await.clock.observe(at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn test_elapsed_tracks_last_touch() {
        let t0 = Utc::now();
        let mut clock = ActivityClock::new(t0);
        assert_eq!(clock.elapsed_at(t0 + ChronoDuration::seconds(6)), Duration::from_secs(6));

        clock.touch_at(t0 + ChronoDuration::seconds(10));
        assert_eq!(clock.elapsed_at(t0 + ChronoDuration::seconds(11)), Duration::from_secs(1));
        assert_eq!(clock.last_activity(), t0 + ChronoDuration::seconds(10));
    }

    #[test]
    fn test_elapsed_is_zero_when_clock_moves_backwards() {
        let t0 = Utc::now();
        let clock = ActivityClock::new(t0);
        assert_eq!(clock.elapsed_at(t0 - ChronoDuration::seconds(30)), Duration::ZERO);
    }

    #[test]
    fn test_observe_only_moves_forward() {
        let t0 = Utc::now();
        let mut clock = ActivityClock::new(t0);

        assert!(!clock.observe(t0 - ChronoDuration::seconds(90)));
        assert_eq!(clock.last_activity(), t0);

        assert!(clock.observe(t0 + ChronoDuration::seconds(3)));
        assert!(!clock.observe(t0 + ChronoDuration::seconds(2)));
        assert_eq!(clock.last_activity(), t0 + ChronoDuration::seconds(3));
    }

    #[test]
    fn test_touch_uses_wall_clock() {
        let mut clock = ActivityClock::new(Utc::now() - ChronoDuration::hours(1));
        clock.touch();
        assert!(clock.elapsed_since() < Duration::from_secs(5));
    }
}
