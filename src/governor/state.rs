use std::fmt;
use tokio::time::Instant;

/// Why the governor forcibly ended an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KillReason {
    MemoryDownshift,
    PredictiveUpshift,
    CpuStall,
}

impl KillReason {
    /// Memory-driven terminations get a cooldown before the next attempt.
    pub fn is_memory_related(&self) -> bool {
        matches!(self, KillReason::MemoryDownshift | KillReason::PredictiveUpshift)
    }
}

impl fmt::Display for KillReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KillReason::MemoryDownshift => write!(f, "memory downshift"),
            KillReason::PredictiveUpshift => write!(f, "predictive upshift"),
            KillReason::CpuStall => write!(f, "cpu stall"),
        }
    }
}

/// Mutable control-loop state, owned by one governor.
#[derive(Debug, Clone, Default)]
pub struct GovernorState {
    pub current_gear: usize,
    /// Tasks completed since the attempt started or the last declined upshift
    pub tasks_completed_at_gear: u32,
    pub stall_timer_start: Option<Instant>,
    last_kill_reason: Option<KillReason>,
}

impl GovernorState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh state parked at `gear`, for exercising the policy mid-ladder.
    #[cfg(test)]
    pub(crate) fn at_gear(gear: usize) -> Self {
        Self {
            current_gear: gear,
            ..Self::default()
        }
    }

    /// Reset per-attempt counters. The pending kill reason survives until
    /// recovery consumes it.
    pub fn begin_attempt(&mut self) {
        self.tasks_completed_at_gear = 0;
        self.stall_timer_start = None;
    }

    pub fn record_kill(&mut self, reason: KillReason) {
        self.last_kill_reason = Some(reason);
    }

    /// Consume the pending kill reason; a second call returns `None`.
    pub fn take_kill_reason(&mut self) -> Option<KillReason> {
        self.last_kill_reason.take()
    }

    pub fn last_kill_reason(&self) -> Option<KillReason> {
        self.last_kill_reason
    }
}
