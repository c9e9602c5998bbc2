use super::{PhaseRecord, RunConfig, RunReport};
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Persists the run report as it evolves.
///
/// The in-flight report lives at `current-run.json`; `finish_run` moves it
/// to `runs/<timestamp>_<id>.json`.
pub struct AuditLogger {
    audit_dir: PathBuf,
    current_run: Option<RunReport>,
    current_run_file: PathBuf,
}

impl AuditLogger {
    pub fn new(audit_dir: &Path) -> Self {
        let current_run_file = audit_dir.join("current-run.json");
        Self {
            audit_dir: audit_dir.to_path_buf(),
            current_run: None,
            current_run_file,
        }
    }

    pub fn start_run(&mut self, config: RunConfig) -> Result<()> {
        self.current_run = Some(RunReport::new(config));
        self.save_current()
    }

    /// Add a phase record to the current run.
    ///
    /// Errors if no run is active so phase data is never silently dropped.
    pub fn add_phase(&mut self, phase: PhaseRecord) -> Result<()> {
        let run = self
            .current_run
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("add_phase called with no active run"))?;
        run.phases.push(phase);
        self.save_current()
    }

    /// Apply a mutation to the last phase in the current run.
    pub fn update_last_phase<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&mut PhaseRecord),
    {
        let run = self
            .current_run
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("update_last_phase called with no active run"))?;
        let phase = run
            .phases
            .last_mut()
            .ok_or_else(|| anyhow::anyhow!("update_last_phase called with no phases in run"))?;
        f(phase);
        self.save_current()
    }

    pub fn finish_run(&mut self, exit_code: i32) -> Result<PathBuf> {
        let run = self
            .current_run
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("No current run to finish"))?;

        run.finish(exit_code);

        let filename = format!(
            "{}_{}.json",
            run.started_at.format("%Y-%m-%dT%H-%M-%S"),
            &run.run_id.to_string()[..8]
        );
        let runs_dir = self.audit_dir.join("runs");
        fs::create_dir_all(&runs_dir).context("Failed to create runs directory")?;
        let run_file = runs_dir.join(&filename);

        let json = serde_json::to_string_pretty(&run).context("Failed to serialize run report")?;
        fs::write(&run_file, json).context("Failed to write run report")?;

        if self.current_run_file.exists() {
            fs::remove_file(&self.current_run_file)
                .context("Failed to remove current-run.json after finishing run")?;
        }

        self.current_run = None;
        Ok(run_file)
    }

    pub fn save_current(&self) -> Result<()> {
        if let Some(ref run) = self.current_run {
            let json =
                serde_json::to_string_pretty(&run).context("Failed to serialize current run")?;
            fs::write(&self.current_run_file, json).context("Failed to write current run file")?;
        }
        Ok(())
    }

    pub fn current_run(&self) -> Option<&RunReport> {
        self.current_run.as_ref()
    }

    /// Finished run reports, oldest first.
    pub fn list_runs(&self) -> Result<Vec<PathBuf>> {
        let runs_dir = self.audit_dir.join("runs");
        if !runs_dir.exists() {
            return Ok(Vec::new());
        }

        let mut runs: Vec<PathBuf> = fs::read_dir(&runs_dir)
            .context("Failed to read runs directory")?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|e| e == "json").unwrap_or(false))
            .collect();

        runs.sort();
        Ok(runs)
    }

    pub fn load_run(path: &Path) -> Result<RunReport> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read run report: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse run report: {}", path.display()))
    }

    /// The most recent finished run, if any.
    pub fn latest_run(&self) -> Result<Option<RunReport>> {
        match self.list_runs()?.last() {
            Some(path) => Self::load_run(path).map(Some),
            None => Ok(None),
        }
    }
}
