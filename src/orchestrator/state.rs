//! Append-only phase journal.
//!
//! One line per transition: `phase|gear|status|timestamp`, where `gear` is
//! the concurrency of the attempt that produced the status.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Started,
    Completed,
    Failed,
    Cancelled,
}

impl PhaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseStatus::Started => "started",
            PhaseStatus::Completed => "completed",
            PhaseStatus::Failed => "failed",
            PhaseStatus::Cancelled => "cancelled",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "started" => Some(PhaseStatus::Started),
            "completed" => Some(PhaseStatus::Completed),
            "failed" => Some(PhaseStatus::Failed),
            "cancelled" => Some(PhaseStatus::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateEntry {
    pub phase: String,
    pub gear: u32,
    pub status: PhaseStatus,
    pub timestamp: DateTime<Utc>,
}

pub struct StateManager {
    state_file: PathBuf,
}

impl StateManager {
    pub fn new(state_file: PathBuf) -> Self {
        Self { state_file }
    }

    pub fn save(&self, phase: &str, gear: u32, status: PhaseStatus) -> Result<()> {
        let entry = format!(
            "{}|{}|{}|{}\n",
            phase,
            gear,
            status,
            Utc::now().to_rfc3339()
        );

        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.state_file)
            .context("Failed to open state file")?
            .write_all(entry.as_bytes())
            .context("Failed to write state entry")?;

        Ok(())
    }

    /// Name of the most recently completed phase.
    pub fn get_last_completed_phase(&self) -> Option<String> {
        self.get_entries()
            .ok()?
            .into_iter()
            .rfind(|e| e.status == PhaseStatus::Completed)
            .map(|e| e.phase)
    }

    /// Whether the latest entry for `phase` is `completed`.
    pub fn is_completed(&self, phase: &str) -> Result<bool> {
        let latest = self
            .get_entries()?
            .into_iter()
            .rfind(|e| e.phase == phase)
            .map(|e| e.status);
        Ok(latest == Some(PhaseStatus::Completed))
    }

    /// All well-formed entries; malformed lines are skipped.
    pub fn get_entries(&self) -> Result<Vec<StateEntry>> {
        if !self.state_file.exists() {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&self.state_file).context("Failed to read state file")?;

        let entries = content
            .lines()
            .filter_map(|line| {
                let parts: Vec<&str> = line.split('|').collect();
                if parts.len() != 4 {
                    return None;
                }
                Some(StateEntry {
                    phase: parts[0].to_string(),
                    gear: parts[1].parse().unwrap_or(0),
                    status: PhaseStatus::parse(parts[2])?,
                    timestamp: DateTime::parse_from_rfc3339(parts[3])
                        .ok()?
                        .with_timezone(&Utc),
                })
            })
            .collect();

        Ok(entries)
    }

    pub fn reset(&self) -> Result<()> {
        if self.state_file.exists() {
            fs::remove_file(&self.state_file).context("Failed to remove state file")?;
        }
        Ok(())
    }
}
