//! Session lifecycle: open on start, close with a recomputed idle total on stop.

use chrono::Utc;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::activity::ActivitySource;
use crate::config::Config;
use crate::context::AgentContext;
use crate::idle::IdleDetector;
use crate::storage::{Session, SessionId, SessionStore, StoreError};

/// Tasks and shared state of the session currently being tracked.
struct ActiveSession {
    ctx: Arc<AgentContext>,
    detector: IdleDetector,
    tasks: Vec<JoinHandle<()>>,
}

/// Owns one tracked session and the loops feeding it.
pub struct SessionController {
    store: Arc<dyn SessionStore>,
    config: Config,
    active: Option<ActiveSession>,
}

impl SessionController {
    pub fn new(store: Arc<dyn SessionStore>, config: Config) -> Self {
        Self {
            store,
            config,
            active: None,
        }
    }

    /// Open a session and launch the activity source selected by configuration.
    pub async fn start(&mut self) -> Result<SessionId, StoreError> {
        let source = ActivitySource::select(
            self.config.activity.mode,
            self.config.idle.threshold(),
            self.config.activity.poll_interval(),
        )
        .await;
        self.start_with(source).await
    }

    /// Open a session fed by `source`. Returns the running session's id if
    /// one is already open.
    pub async fn start_with(&mut self, source: ActivitySource) -> Result<SessionId, StoreError> {
        if let Some(active) = &self.active {
            return Ok(active.ctx.session_id());
        }

        let login_time = Utc::now();
        let session_id = self
            .store
            .create_session(&self.config.agent.user_id, &self.config.agent.machine_id, login_time)
            .await?;
        info!(
            "Created session id {} for {}@{} (simulated activity: {})",
            session_id,
            self.config.agent.user_id,
            self.config.agent.machine_id,
            source.is_synthetic()
        );

        let ctx = Arc::new(AgentContext::new(
            session_id,
            self.config.idle.threshold(),
            self.store.clone(),
            login_time,
        ));
        let detector = IdleDetector::new(ctx.clone(), self.config.idle.check_interval());

        let tasks = vec![
            tokio::spawn(source.run(ctx.clone())),
            tokio::spawn(detector.clone().run()),
        ];

        self.active = Some(ActiveSession { ctx, detector, tasks });
        Ok(session_id)
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        self.active.is_some()
    }

    /// Idle detector of the running session.
    #[cfg(test)]
    pub fn detector(&self) -> Option<&IdleDetector> {
        self.active.as_ref().map(|active| &active.detector)
    }

    /// Stop the loops, close any open idle interval and close the session.
    ///
    /// Returns the closed session, or `None` when nothing was running or the
    /// session row had vanished from the store.
    pub async fn stop(&mut self) -> Result<Option<Session>, StoreError> {
        let Some(active) = self.active.take() else {
            return Ok(None);
        };
        let session_id = active.ctx.session_id();

        let quiet_for = active.ctx.lock().await.clock.elapsed_since();
        info!("Agent stopping; last activity {:?} ago", quiet_for);
        active.ctx.halt();
        tokio::time::sleep(self.config.agent.shutdown_grace()).await;

        let finalized = active.detector.finalize().await;

        // Loops still asleep past the grace period have nothing left to do.
        for task in &active.tasks {
            task.abort();
        }
        finalized?;

        let total_idle_seconds = self.store.sum_idle_durations(session_id).await?;
        let logout_time = Utc::now();

        match self
            .store
            .close_session(session_id, logout_time, total_idle_seconds)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_missing_row() => {
                warn!("Session {} could not be finalized: {}", session_id, e);
                return Ok(None);
            }
            Err(e) => return Err(e),
        }

        let events = self.store.idle_events(session_id).await?;
        for event in &events {
            debug!(
                "Idle event {}: {} -> {:?} ({}s)",
                event.event_id, event.idle_start, event.idle_end, event.duration_seconds
            );
        }
        let still_open = events.iter().filter(|e| e.is_open()).count();
        if still_open > 0 {
            warn!("Session {} closed with {} idle events still open", session_id, still_open);
        }

        info!(
            "Session {} updated: logout_time set, total_idle_seconds={} over {} idle events",
            session_id,
            total_idle_seconds,
            events.len()
        );
        self.store.get_session(session_id).await
    }
}
