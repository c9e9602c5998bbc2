pub mod logger;

pub use logger::AuditLogger;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::governor::KillReason;
use crate::recovery::CleanupReport;
use crate::supervisor::TerminationOutcome;

/// One governed run: both phases plus packaging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub config: RunConfig,
    pub phases: Vec<PhaseRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl RunReport {
    pub fn new(config: RunConfig) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            ended_at: None,
            config,
            phases: Vec::new(),
            exit_code: None,
        }
    }

    pub fn finish(&mut self, exit_code: i32) {
        self.ended_at = Some(Utc::now());
        self.exit_code = Some(exit_code);
    }

    /// Forced terminations across all phases.
    pub fn forced_terminations(&self) -> usize {
        self.phases
            .iter()
            .flat_map(|p| &p.attempts)
            .filter(|a| matches!(a.end, AttemptEnd::Forced { .. }))
            .count()
    }
}

/// Settings snapshot stored with each report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub project_dir: PathBuf,
    pub memory_threshold_kb: u64,
    pub conservative_ladder: Vec<u32>,
    pub main_ladder: Vec<u32>,
    pub phase1_target: String,
    pub resume: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub ladder: Vec<u32>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub attempts: Vec<AttemptRecord>,
    pub outcome: PhaseOutcome,
}

impl PhaseRecord {
    pub fn new(name: &str, target: Option<&str>, ladder: &[u32]) -> Self {
        Self {
            name: name.to_string(),
            target: target.map(String::from),
            ladder: ladder.to_vec(),
            started_at: Utc::now(),
            ended_at: None,
            attempts: Vec::new(),
            outcome: PhaseOutcome::InProgress,
        }
    }

    pub fn finish(&mut self, outcome: PhaseOutcome, attempts: Vec<AttemptRecord>) {
        self.ended_at = Some(Utc::now());
        self.outcome = outcome;
        self.attempts = attempts;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum PhaseOutcome {
    InProgress,
    Completed,
    /// Already completed by an earlier run and skipped on resume
    Skipped,
    Failed { error: String },
    Cancelled,
}

/// One executor run at a fixed gear.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub gear_index: usize,
    pub concurrency: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// Task-completed lines seen during the attempt
    pub tasks_completed: u32,
    pub end: AttemptEnd,
}

/// How an attempt ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum AttemptEnd {
    /// The executor exited on its own
    Exited { code: i32 },
    /// The governor terminated it to change gear or break a stall
    Forced {
        reason: KillReason,
        next_gear: usize,
        termination: TerminationOutcome,
        cleanup: CleanupReport,
    },
    Cancelled {
        termination: TerminationOutcome,
    },
    /// A fatal governor error (e.g. host probe failure) ended it
    Aborted {
        error: String,
        termination: TerminationOutcome,
    },
}
