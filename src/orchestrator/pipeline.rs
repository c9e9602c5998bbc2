//! Two-phase build pipeline.
//!
//! The conservative phase builds the single heaviest unit on a short
//! ladder; the main phase then builds everything on the full ladder.
//! Packaging runs only after both succeed.

use std::path::PathBuf;
use tokio::sync::watch;
use tracing::{info, warn};

use super::packaging::Packager;
use super::state::{PhaseStatus, StateManager};
use crate::audit::{AuditLogger, PhaseOutcome, PhaseRecord, RunConfig};
use crate::config::GovernorConfig;
use crate::errors::{EXIT_SUCCESS, GovernorError, PipelineError};
use crate::governor::{Governor, GovernorObserver, NoopObserver, PhaseSpec};
use crate::monitor::ResourceProbe;
use crate::recovery::Recovery;
use crate::supervisor::Supervisor;

pub const CONSERVATIVE_PHASE: &str = "conservative";
pub const MAIN_PHASE: &str = "main";
pub const PACKAGING_STEP: &str = "packaging";

static NOOP_OBSERVER: NoopObserver = NoopObserver;

/// Phases in execution order.
pub fn phase_specs(config: &GovernorConfig) -> [PhaseSpec; 2] {
    [
        PhaseSpec::new(
            CONSERVATIVE_PHASE,
            Some(&config.phase1_target),
            config.conservative_ladder.clone(),
        ),
        PhaseSpec::new(MAIN_PHASE, None, config.main_ladder.clone()),
    ]
}

#[derive(Debug, Default)]
pub struct PipelineSummary {
    pub completed: Vec<String>,
    /// Phases skipped because a previous run completed them
    pub skipped: Vec<String>,
    pub packaged: bool,
    pub report: Option<PathBuf>,
}

pub struct PhaseOrchestrator<'a> {
    config: &'a GovernorConfig,
    probe: &'a mut dyn ResourceProbe,
    supervisor: &'a mut dyn Supervisor,
    recovery: &'a mut dyn Recovery,
    packager: &'a mut dyn Packager,
    observer: &'a dyn GovernorObserver,
    cancel: Option<watch::Receiver<bool>>,
    state: StateManager,
    audit: Option<AuditLogger>,
    resume: bool,
    packaging_args: Vec<String>,
}

impl<'a> PhaseOrchestrator<'a> {
    pub fn new(
        config: &'a GovernorConfig,
        probe: &'a mut dyn ResourceProbe,
        supervisor: &'a mut dyn Supervisor,
        recovery: &'a mut dyn Recovery,
        packager: &'a mut dyn Packager,
    ) -> Self {
        Self {
            config,
            probe,
            supervisor,
            recovery,
            packager,
            observer: &NOOP_OBSERVER,
            cancel: None,
            state: StateManager::new(config.state_file()),
            audit: None,
            resume: false,
            packaging_args: Vec::new(),
        }
    }

    pub fn with_observer(mut self, observer: &'a dyn GovernorObserver) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_audit(mut self, audit: AuditLogger) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Skip phases the journal already records as completed.
    pub fn resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    /// Extra arguments appended to the packaging command line.
    pub fn packaging_args(mut self, args: Vec<String>) -> Self {
        self.packaging_args = args;
        self
    }

    pub async fn run(&mut self) -> Result<PipelineSummary, PipelineError> {
        if !self.resume {
            self.state.reset().map_err(PipelineError::Preflight)?;
        }
        self.audit_start();

        let result = self.run_phases().await;

        let code = match &result {
            Ok(_) => EXIT_SUCCESS,
            Err(e) => e.exit_code(),
        };
        let report = self.audit_finish(code);
        result.map(|summary| PipelineSummary { report, ..summary })
    }

    async fn run_phases(&mut self) -> Result<PipelineSummary, PipelineError> {
        let mut summary = PipelineSummary::default();

        for phase in phase_specs(self.config) {
            if self.already_completed(&phase.name) {
                info!(phase = %phase.name, "Phase completed by an earlier run; skipping");
                let mut record =
                    PhaseRecord::new(&phase.name, phase.target.as_deref(), phase.ladder.levels());
                record.finish(PhaseOutcome::Skipped, Vec::new());
                self.audit(|a| a.add_phase(record));
                summary.skipped.push(phase.name);
                continue;
            }
            self.run_phase(&phase).await?;
            summary.completed.push(phase.name);
        }

        summary.packaged = self.package().await?;
        Ok(summary)
    }

    async fn run_phase(&mut self, phase: &PhaseSpec) -> Result<(), PipelineError> {
        info!(
            phase = %phase.name,
            target = phase.target.as_deref().unwrap_or("<all>"),
            ladder = %phase.ladder,
            "Starting phase"
        );
        let record = PhaseRecord::new(&phase.name, phase.target.as_deref(), phase.ladder.levels());
        self.audit(|a| a.add_phase(record));
        self.journal(&phase.name, phase.ladder.concurrency(0), PhaseStatus::Started);

        let config = self.config;
        let mut governor = Governor::new(
            &config.governor,
            &config.executor,
            &mut *self.probe,
            &mut *self.supervisor,
            &mut *self.recovery,
        )
        .with_observer(self.observer);
        if let Some(ref rx) = self.cancel {
            governor = governor.with_cancellation(rx.clone());
        }

        let result = governor.run(phase).await;
        let attempts = governor.take_attempts();
        drop(governor);

        let gear = attempts
            .last()
            .map(|a| a.concurrency)
            .unwrap_or_else(|| phase.ladder.concurrency(0));
        let (status, outcome) = match &result {
            Ok(()) => (PhaseStatus::Completed, PhaseOutcome::Completed),
            Err(GovernorError::Cancelled) => (PhaseStatus::Cancelled, PhaseOutcome::Cancelled),
            Err(e) => (
                PhaseStatus::Failed,
                PhaseOutcome::Failed {
                    error: e.to_string(),
                },
            ),
        };
        self.journal(&phase.name, gear, status);
        self.audit(|a| a.update_last_phase(|p| p.finish(outcome, attempts)));

        match result {
            Ok(()) => {
                info!(phase = %phase.name, "Phase completed");
                Ok(())
            }
            Err(e) => Err(PipelineError::from_phase(&phase.name, e)),
        }
    }

    /// Run packaging if configured. Returns whether it ran.
    async fn package(&mut self) -> Result<bool, PipelineError> {
        if self.already_completed(PACKAGING_STEP) {
            info!("Packaging completed by an earlier run; skipping");
            return Ok(false);
        }
        let config = self.config;
        let Some(ref spec) = config.packaging else {
            info!("No packaging program configured; skipping packaging");
            return Ok(false);
        };
        if self.cancel.as_ref().is_some_and(|rx| *rx.borrow()) {
            return Err(PipelineError::Cancelled);
        }

        self.journal(PACKAGING_STEP, 0, PhaseStatus::Started);
        let result = self
            .packager
            .package(spec, &config.executor.output_dir, &self.packaging_args)
            .await;

        match result {
            Ok(0) => {
                self.journal(PACKAGING_STEP, 0, PhaseStatus::Completed);
                info!("Packaging completed");
                Ok(true)
            }
            Ok(exit_code) => {
                self.journal(PACKAGING_STEP, 0, PhaseStatus::Failed);
                Err(PipelineError::Packaging { exit_code })
            }
            Err(e) => {
                self.journal(PACKAGING_STEP, 0, PhaseStatus::Failed);
                Err(e)
            }
        }
    }

    fn already_completed(&self, step: &str) -> bool {
        if !self.resume {
            return false;
        }
        match self.state.is_completed(step) {
            Ok(done) => done,
            Err(e) => {
                warn!(step, error = %e, "Could not read phase journal; running step");
                false
            }
        }
    }

    /// Journal failures are logged, not fatal: the build itself is unaffected.
    fn journal(&self, step: &str, gear: u32, status: PhaseStatus) {
        if let Err(e) = self.state.save(step, gear, status) {
            warn!(step, %status, error = %e, "Failed to write phase journal");
        }
    }

    fn audit<F>(&mut self, f: F)
    where
        F: FnOnce(&mut AuditLogger) -> anyhow::Result<()>,
    {
        if let Some(ref mut audit) = self.audit
            && let Err(e) = f(audit)
        {
            warn!(error = %e, "Failed to update run report");
        }
    }

    fn audit_start(&mut self) {
        let config = self.config;
        let run_config = RunConfig {
            project_dir: config.project_dir.clone(),
            memory_threshold_kb: config.governor.memory_threshold_kb,
            conservative_ladder: config.conservative_ladder.levels().to_vec(),
            main_ladder: config.main_ladder.levels().to_vec(),
            phase1_target: config.phase1_target.clone(),
            resume: self.resume,
        };
        self.audit(|a| a.start_run(run_config));
    }

    fn audit_finish(&mut self, exit_code: i32) -> Option<PathBuf> {
        let audit = self.audit.as_mut()?;
        match audit.finish_run(exit_code) {
            Ok(path) => {
                info!(report = %path.display(), "Run report written");
                Some(path)
            }
            Err(e) => {
                warn!(error = %e, "Failed to write run report");
                None
            }
        }
    }
}
