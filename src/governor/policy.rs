//! Per-tick gear decisions.
//!
//! Evaluation order is fixed: downshift, then predictive upshift, then CPU
//! stall. A sample that would satisfy both the downshift and the upshift
//! condition always downshifts.
//!
//! The upshift model is a plain linear extrapolation
//! (`used * next_concurrency / current_concurrency`). It assumes memory
//! scales with job count and is not calibrated; treat it as an approximation.

use tokio::time::Instant;
use tracing::{debug, info};

use super::GovernorSettings;
use super::state::{GovernorState, KillReason};
use crate::gear::GearLadder;
use crate::monitor::ResourceSample;

/// What the control loop should do after one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickDecision {
    Continue,
    /// Memory over threshold: restart at the more conservative gear `to`.
    Downshift { to: usize },
    /// Predicted memory at the higher gear `to` fits under the threshold.
    Upshift { to: usize, predicted_kb: u64 },
    /// CPU below the stall threshold for the whole stall duration.
    Stall,
}

impl TickDecision {
    /// The forced-termination reason and next gear, if this decision ends the attempt.
    pub fn termination(&self, current_gear: usize) -> Option<(KillReason, usize)> {
        match *self {
            TickDecision::Continue => None,
            TickDecision::Downshift { to } => Some((KillReason::MemoryDownshift, to)),
            TickDecision::Upshift { to, .. } => Some((KillReason::PredictiveUpshift, to)),
            TickDecision::Stall => Some((KillReason::CpuStall, current_gear)),
        }
    }
}

/// Decision rules for one phase's ladder.
pub struct GearPolicy<'a> {
    settings: &'a GovernorSettings,
    ladder: &'a GearLadder,
}

impl<'a> GearPolicy<'a> {
    pub fn new(settings: &'a GovernorSettings, ladder: &'a GearLadder) -> Self {
        Self { settings, ladder }
    }

    pub fn ladder(&self) -> &GearLadder {
        self.ladder
    }

    /// Memory the host would use at `to` if usage scaled linearly with concurrency.
    pub fn predict_memory_kb(&self, used_kb: u64, from: usize, to: usize) -> u64 {
        let cur = self.ladder.concurrency(from) as u128;
        let next = self.ladder.concurrency(to) as u128;
        (used_kb as u128 * next / cur).min(u64::MAX as u128) as u64
    }

    /// Evaluate one sample. May reset the task counter (declined upshift)
    /// and start or clear the stall timer.
    pub fn evaluate(
        &self,
        state: &mut GovernorState,
        sample: &ResourceSample,
        now: Instant,
    ) -> TickDecision {
        let threshold = self.settings.memory_threshold_kb;
        let gear = state.current_gear;

        if sample.used_memory_kb > threshold {
            if let Some(to) = self.ladder.downshift(gear) {
                return TickDecision::Downshift { to };
            }
            debug!(
                gear,
                used_kb = sample.used_memory_kb,
                "Memory over threshold at the lowest gear; continuing"
            );
        }

        if state.tasks_completed_at_gear >= self.settings.upshift_batch_size
            && let Some(to) = self.ladder.upshift(gear)
        {
            let predicted_kb = self.predict_memory_kb(sample.used_memory_kb, gear, to);
            if predicted_kb < threshold {
                return TickDecision::Upshift { to, predicted_kb };
            }
            info!(
                tasks = state.tasks_completed_at_gear,
                predicted_kb,
                threshold_kb = threshold,
                "Upshift declined: predicted memory over threshold"
            );
            state.tasks_completed_at_gear = 0;
        }

        if let Some(pct) = sample.cpu.percent() {
            if pct < self.settings.stall_threshold_percent {
                let started = *state.stall_timer_start.get_or_insert_with(|| {
                    debug!(cpu_percent = pct, "Stall timer started");
                    now
                });
                if now.duration_since(started) >= self.settings.stall_duration {
                    return TickDecision::Stall;
                }
            } else if state.stall_timer_start.take().is_some() {
                debug!(cpu_percent = pct, "Stall timer reset");
            }
        }

        TickDecision::Continue
    }
}
