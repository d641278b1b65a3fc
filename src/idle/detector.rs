//! Fixed-interval idle state machine over the shared activity clock.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::{idle_duration_seconds, Transition};
use crate::context::{AgentContext, IdlePhase, TrackerState};
use crate::storage::StoreError;

/// Polls the activity clock and opens/closes idle intervals.
#[derive(Clone)]
pub struct IdleDetector {
    ctx: Arc<AgentContext>,
    check_interval: Duration,
}

impl IdleDetector {
    pub fn new(ctx: Arc<AgentContext>, check_interval: Duration) -> Self {
        Self { ctx, check_interval }
    }

    /// Run the poll loop until the context stops running.
    ///
    /// Shutdown latency is bounded by one check interval: the running flag is
    /// re-read after every sleep.
    pub async fn run(self) {
        info!(
            "Starting idle detector with threshold {:?}, checking every {:?}",
            self.ctx.threshold(),
            self.check_interval
        );

        while self.ctx.is_running() {
            if let Err(e) = self.poll_at(Utc::now()).await {
                error!("Idle transition failed for session {}: {}", self.ctx.session_id(), e);
            }
            tokio::time::sleep(self.check_interval).await;
        }

        debug!("Idle detector loop exiting");
    }

    /// Evaluate the state machine once at `now`.
    pub async fn poll_at(&self, now: DateTime<Utc>) -> Result<Option<Transition>, StoreError> {
        let mut state = self.ctx.lock().await;

        // Shutdown owns the final transition once it has begun.
        if !self.ctx.is_running() {
            return Ok(None);
        }

        let elapsed = state.clock.elapsed_at(now);
        let is_now_idle = elapsed >= self.ctx.threshold();

        match state.phase {
            IdlePhase::Active if is_now_idle => {
                let event_id = self
                    .ctx
                    .store()
                    .create_idle_event(self.ctx.session_id(), now)
                    .await?;
                state.phase = IdlePhase::Idle { event_id, idle_start: now };

                info!("Idle started (event_id={}, idle for {:?})", event_id, elapsed);
                Ok(Some(Transition::Opened { event_id, idle_start: now }))
            }
            IdlePhase::Idle { .. } if !is_now_idle => self.close_open_event(&mut state, now, false).await,
            _ => Ok(None),
        }
    }

    /// Force-close the open interval, if any, as part of shutdown.
    pub async fn finalize(&self) -> Result<Option<Transition>, StoreError> {
        self.finalize_at(Utc::now()).await
    }

    pub async fn finalize_at(&self, now: DateTime<Utc>) -> Result<Option<Transition>, StoreError> {
        let mut state = self.ctx.lock().await;
        self.close_open_event(&mut state, now, true).await
    }

    /// Close the current interval and return to Active. A no-op when Active.
    ///
    /// On a transient store error the phase stays Idle so the next poll (or
    /// the finalizing close) can retry; a vanished or already-closed event is
    /// logged and dropped.
    async fn close_open_event(
        &self,
        state: &mut TrackerState,
        now: DateTime<Utc>,
        finalizing: bool,
    ) -> Result<Option<Transition>, StoreError> {
        let IdlePhase::Idle { event_id, idle_start } = state.phase else {
            return Ok(None);
        };

        let duration_seconds = idle_duration_seconds(idle_start, now);
        let result = self
            .ctx
            .store()
            .close_idle_event_and_accumulate(event_id, now, duration_seconds)
            .await;

        match result {
            Ok(()) => {
                state.phase = IdlePhase::Active;
                info!(
                    "Idle ended (event_id={}) duration={}s finalizing={}",
                    event_id, duration_seconds, finalizing
                );
                Ok(Some(Transition::Closed { event_id, duration_seconds, finalizing }))
            }
            Err(e) if e.is_missing_row() => {
                state.phase = IdlePhase::Active;
                warn!("Idle event {} could not be closed: {}", event_id, e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}
