//! Activity sources: real platform input or a synthetic generator.

#[cfg(target_os = "macos")]
mod macos;
#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "windows")]
mod windows;
mod synthetic;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

use crate::config::ActivityMode;
use crate::context::AgentContext;

pub use synthetic::SyntheticActivity;

/// Platform query for "how long since the user last touched an input device".
pub trait InputProbe: Send {
    /// Human-readable name of the underlying platform facility.
    fn name(&self) -> &'static str;

    /// Time since the last keyboard or pointer input, if it could be read.
    fn idle_time(&mut self) -> Option<Duration>;
}

/// Result of probing the host for a usable input facility.
pub enum InputCapability {
    Available(Box<dyn InputProbe>),
    Unavailable(String),
}

/// Probe the host platform once for real input tracking.
pub fn detect_input_capability() -> InputCapability {
    #[cfg(target_os = "linux")]
    return linux::detect();
    #[cfg(target_os = "macos")]
    return macos::detect();
    #[cfg(target_os = "windows")]
    return self::windows::detect();
    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    InputCapability::Unavailable("no input facility on this platform".to_string())
}

/// Strategy feeding the activity clock, chosen once at startup.
pub enum ActivitySource {
    Synthetic(SyntheticActivity),
    RealInput(RealInput),
}

impl ActivitySource {
    /// Pick a strategy for `mode`, falling back to simulation when real input
    /// tracking is not available on this host.
    pub async fn select(mode: ActivityMode, threshold: Duration, poll_interval: Duration) -> Self {
        match mode {
            ActivityMode::Synthetic => Self::Synthetic(SyntheticActivity::new(threshold)),
            ActivityMode::Real => {
                // Display connections and IOKit lookups block.
                let capability = tokio::task::spawn_blocking(detect_input_capability)
                    .await
                    .unwrap_or_else(|e| InputCapability::Unavailable(format!("detection failed: {}", e)));
                Self::from_capability(capability, threshold, poll_interval)
            }
        }
    }

    fn from_capability(capability: InputCapability, threshold: Duration, poll_interval: Duration) -> Self {
        match capability {
            InputCapability::Available(probe) => {
                info!("Real tracking using {}", probe.name());
                Self::RealInput(RealInput::new(probe, poll_interval))
            }
            InputCapability::Unavailable(reason) => {
                warn!("Real input hooks unavailable ({}); falling back to simulation", reason);
                Self::Synthetic(SyntheticActivity::new(threshold))
            }
        }
    }

    pub fn is_synthetic(&self) -> bool {
        matches!(self, Self::Synthetic(_))
    }

    /// Feed the context's clock until it stops running.
    pub async fn run(self, ctx: Arc<AgentContext>) {
        match self {
            Self::Synthetic(source) => source.run(ctx).await,
            Self::RealInput(source) => source.run(ctx).await,
        }
    }
}

/// Polls a platform probe and moves the clock to the last input it reports.
pub struct RealInput {
    probe: Box<dyn InputProbe>,
    poll_interval: Duration,
}

impl RealInput {
    pub fn new(probe: Box<dyn InputProbe>, poll_interval: Duration) -> Self {
        Self { probe, poll_interval }
    }

    /// When the last input happened, given an idle-time reading taken at `now`.
    fn last_input_at(idle_time: Duration, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let idle = ChronoDuration::from_std(idle_time).ok()?;
        now.checked_sub_signed(idle)
    }

    async fn run(self, ctx: Arc<AgentContext>) {
        let Self { mut probe, poll_interval } = self;
        let name = probe.name();
        info!("Starting input monitor using {}", name);

        while ctx.is_running() {
            tokio::time::sleep(poll_interval).await;

            let query = tokio::task::spawn_blocking(move || {
                let reading = probe.idle_time();
                (probe, reading)
            })
            .await;
            let reading = match query {
                Ok((returned, reading)) => {
                    probe = returned;
                    reading
                }
                Err(e) => {
                    error!("{} query aborted: {}; input monitor stopping", name, e);
                    return;
                }
            };

            match reading.and_then(|idle_time| Self::last_input_at(idle_time, Utc::now())) {
                Some(at) => {
                    if ctx.observe_input(at).await {
                        trace!("Activity detected at {} ({})", at, name);
                    }
                }
                None => warn!("Failed to query {} idle time", name),
            }
        }

        debug!("Input monitor loop exiting");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{temp_store, SessionStore};

    /// Replays a fixed sequence of idle-time readings.
    struct ScriptedProbe {
        readings: Vec<Option<Duration>>,
    }

    impl InputProbe for ScriptedProbe {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn idle_time(&mut self) -> Option<Duration> {
            if self.readings.is_empty() {
                Some(Duration::from_secs(3600))
            } else {
                self.readings.remove(0)
            }
        }
    }

    #[test]
    fn test_unavailable_capability_falls_back_to_simulation() {
        let source = ActivitySource::from_capability(
            InputCapability::Unavailable("no display".to_string()),
            Duration::from_secs(120),
            Duration::from_millis(500),
        );
        assert!(source.is_synthetic());
    }

    #[test]
    fn test_available_capability_uses_real_input() {
        let probe = ScriptedProbe { readings: vec![] };
        let source = ActivitySource::from_capability(
            InputCapability::Available(Box::new(probe)),
            Duration::from_secs(120),
            Duration::from_millis(500),
        );
        assert!(!source.is_synthetic());
    }

    #[tokio::test]
    async fn test_synthetic_mode_skips_detection() {
        let source = ActivitySource::select(
            ActivityMode::Synthetic,
            Duration::from_secs(120),
            Duration::from_millis(500),
        )
        .await;
        assert!(source.is_synthetic());
    }

    #[test]
    fn test_last_input_is_dated_back_by_idle_time() {
        let now = Utc::now();
        assert_eq!(RealInput::last_input_at(Duration::ZERO, now), Some(now));
        assert_eq!(
            RealInput::last_input_at(Duration::from_secs(4), now),
            Some(now - ChronoDuration::seconds(4))
        );
        assert_eq!(RealInput::last_input_at(Duration::MAX, now), None);
    }

    #[tokio::test]
    async fn test_input_between_polls_is_not_missed() {
        let (_dir, store) = temp_store().await;
        let store = Arc::new(store);
        let long_ago = Utc::now() - ChronoDuration::hours(1);
        let session_id = store.create_session("alice", "WC-01", long_ago).await.unwrap();
        let ctx = Arc::new(AgentContext::new(session_id, Duration::from_secs(120), store, long_ago));

        // One keypress 30s before the first reading, far outside a 10ms poll window.
        let probe = ScriptedProbe { readings: vec![Some(Duration::from_secs(30))] };
        let source = RealInput::new(Box::new(probe), Duration::from_millis(10));
        let before = Utc::now();
        let handle = tokio::spawn(source.run(ctx.clone()));

        tokio::time::sleep(Duration::from_millis(200)).await;
        ctx.halt();
        handle.await.unwrap();

        let last = ctx.lock().await.clock.last_activity();
        assert!(last >= before - ChronoDuration::seconds(31), "{last}");
        assert!(last <= Utc::now() - ChronoDuration::seconds(29), "{last}");
    }

    #[tokio::test]
    async fn test_real_input_loop_touches_clock() {
        let (_dir, store) = temp_store().await;
        let store = Arc::new(store);
        let long_ago = Utc::now() - ChronoDuration::hours(1);
        let session_id = store.create_session("alice", "WC-01", long_ago).await.unwrap();
        let ctx = Arc::new(AgentContext::new(session_id, Duration::from_secs(120), store, long_ago));

        let probe = ScriptedProbe { readings: vec![Some(Duration::ZERO)] };
        let source = RealInput::new(Box::new(probe), Duration::from_millis(10));
        let handle = tokio::spawn(source.run(ctx.clone()));

        tokio::time::sleep(Duration::from_millis(200)).await;
        ctx.halt();
        handle.await.unwrap();

        assert!(ctx.lock().await.clock.last_activity() > long_ago);
    }
}
