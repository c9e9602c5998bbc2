//! Adaptive concurrency governor.
//!
//! One [`Governor`] drives one phase: it starts the executor at the top of
//! the phase's gear ladder, samples the host every tick, and terminates and
//! restarts the build whenever the [`policy`] asks for a different gear or
//! detects a CPU stall.

pub mod policy;
pub mod runner;
pub mod state;

use regex::Regex;
use std::time::Duration;

use crate::gear::GearLadder;

pub use policy::{GearPolicy, TickDecision};
pub use runner::{Governor, GovernorObserver, NoopObserver};
pub use state::{GovernorState, KillReason};

/// Thresholds and timings shared by every phase.
#[derive(Debug, Clone)]
pub struct GovernorSettings {
    pub memory_threshold_kb: u64,
    /// Poll timeout at gear 0
    pub fast_poll: Duration,
    /// Poll timeout at every lower gear
    pub throttle_poll: Duration,
    pub stall_threshold_percent: f64,
    pub stall_duration: Duration,
    pub upshift_batch_size: u32,
    pub cleanup_window: Duration,
    pub cooldown: Duration,
    /// Executor output lines matching this count as completed tasks
    pub task_line: Regex,
}

impl GovernorSettings {
    /// Poll timeout for the given gear index.
    pub fn poll_interval(&self, gear_index: usize) -> Duration {
        if gear_index == 0 {
            self.fast_poll
        } else {
            self.throttle_poll
        }
    }
}

/// Parameters of one governed phase.
#[derive(Debug, Clone)]
pub struct PhaseSpec {
    pub name: String,
    /// Named unit to build, or `None` for the whole graph
    pub target: Option<String>,
    pub ladder: GearLadder,
}

impl PhaseSpec {
    pub fn new(name: &str, target: Option<&str>, ladder: GearLadder) -> Self {
        Self {
            name: name.to_string(),
            target: target.map(String::from),
            ladder,
        }
    }
}

#[cfg(test)]
pub(crate) mod testing;
