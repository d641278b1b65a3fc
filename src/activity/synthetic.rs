//! Synthetic activity generator for demos and hosts without input tracking.
//!
//! Alternates bursts of frequent activity with silent pauses long enough to
//! cross the idle threshold.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use crate::context::AgentContext;

/// Probability that the next step is an activity burst.
pub const BURST_PROBABILITY: f64 = 0.7;

const BURST_SECS: (f64, f64) = (5.0, 30.0);
const TOUCH_GAP_SECS: (f64, f64) = (0.5, 2.0);
const PAUSE_THRESHOLD_FACTOR: (f64, f64) = (0.5, 3.0);

/// One step of the generator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SyntheticStep {
    /// Touch repeatedly for this long.
    Burst(Duration),
    /// Stay silent for this long.
    Pause(Duration),
}

pub struct SyntheticActivity {
    threshold: Duration,
    rng: StdRng,
}

impl SyntheticActivity {
    pub fn new(threshold: Duration) -> Self {
        Self::with_rng(threshold, StdRng::from_entropy())
    }

    pub fn with_rng(threshold: Duration, rng: StdRng) -> Self {
        Self { threshold, rng }
    }

    /// Draw the next burst or pause.
    pub fn next_step(&mut self) -> SyntheticStep {
        let p: f64 = self.rng.gen();
        if p < BURST_PROBABILITY {
            let secs = self.rng.gen_range(BURST_SECS.0..=BURST_SECS.1);
            SyntheticStep::Burst(Duration::from_secs_f64(secs))
        } else {
            let threshold = self.threshold.as_secs_f64();
            let (low, high) = PAUSE_THRESHOLD_FACTOR;
            let secs = self.rng.gen_range(threshold * low..=threshold * high);
            SyntheticStep::Pause(Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX))
        }
    }

    /// Draw the sleep between two touches of a burst.
    pub fn touch_gap(&mut self) -> Duration {
        Duration::from_secs_f64(self.rng.gen_range(TOUCH_GAP_SECS.0..=TOUCH_GAP_SECS.1))
    }

    pub async fn run(mut self, ctx: Arc<AgentContext>) {
        info!("Simulation mode: activity will be simulated");

        while ctx.is_running() {
            match self.next_step() {
                SyntheticStep::Burst(length) => {
                    trace!("Simulated burst for {:?}", length);
                    let end = Instant::now() + length;
                    while Instant::now() < end && ctx.is_running() {
                        ctx.touch().await;
                        tokio::time::sleep(self.touch_gap()).await;
                    }
                }
                SyntheticStep::Pause(length) => {
                    trace!("Simulated pause for {:?}", length);
                    tokio::time::sleep(length).await;
                }
            }
        }

        debug!("Simulation loop exiting");
    }
}
