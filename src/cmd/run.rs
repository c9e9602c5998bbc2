//! Governed build (`gearbox run`).

use console::style;
use std::path::Path;
use tokio::sync::watch;
use tracing::{error, info, warn};

use gearbox::audit::AuditLogger;
use gearbox::config::{CliOverrides, GovernorConfig};
use gearbox::errors::{EXIT_PREFLIGHT, EXIT_SUCCESS, PipelineError};
use gearbox::lock::WorkspaceLock;
use gearbox::logging;
use gearbox::monitor::{KB_PER_GB, ResourceMonitor, ResourceProbe};
use gearbox::orchestrator::{CommandPackager, PhaseOrchestrator, PipelineSummary};
use gearbox::recovery::HostRecovery;
use gearbox::supervisor::{ProcessSupervisor, signals};
use gearbox::ui::GovernorUi;

use super::super::Cli;

pub struct RunOptions {
    pub resume: bool,
    pub overrides: CliOverrides,
    pub packaging_args: Vec<String>,
}

/// Run the whole pipeline and return the process exit code.
///
/// Everything that must be released before exit (workspace lock, log
/// writer) is dropped before this returns.
pub async fn cmd_run(cli: &Cli, project_dir: &Path, opts: RunOptions) -> i32 {
    let config = match GovernorConfig::load(project_dir, cli.config.as_deref(), &opts.overrides) {
        Ok(config) => config,
        Err(e) => {
            report_preflight(&e);
            return EXIT_PREFLIGHT;
        }
    };

    let _log_guard =
        match logging::init_logging(cli.verbose, cli.log_format, Some(&config.log_dir())) {
            Ok(guard) => guard,
            Err(e) => {
                report_preflight(&e);
                return EXIT_PREFLIGHT;
            }
        };

    match execute(cli, &config, opts).await {
        Ok(_) => EXIT_SUCCESS,
        Err(e) => {
            error!(error = %e, exit_code = e.exit_code(), "Run failed");
            if let PipelineError::Preflight(ref inner) = e {
                report_preflight(inner);
            }
            e.exit_code()
        }
    }
}

fn report_preflight(err: &anyhow::Error) {
    eprintln!("{} {:#}", style("pre-flight failed:").red().bold(), err);
}

async fn execute(
    cli: &Cli,
    config: &GovernorConfig,
    opts: RunOptions,
) -> Result<PipelineSummary, PipelineError> {
    for warning in &config.warnings {
        warn!("{}", warning);
    }

    config.ensure_directories().map_err(PipelineError::Preflight)?;
    let _lock = WorkspaceLock::acquire(&config.lock_file()).map_err(PipelineError::Preflight)?;

    // Primes the CPU delta and fails fast when host counters are unreadable.
    let mut monitor = ResourceMonitor::new();
    let priming = monitor
        .sample()
        .map_err(|e| PipelineError::Preflight(e.into()))?;
    if config.governor.memory_threshold_kb > priming.total_memory_kb {
        warn!(
            threshold_gb = config.governor.memory_threshold_kb as f64 / KB_PER_GB as f64,
            total_gb = priming.total_memory_gb(),
            "Memory threshold exceeds total host memory; downshifts will never trigger"
        );
    }
    info!(
        project = %config.project_dir.display(),
        conservative = %config.conservative_ladder,
        main = %config.main_ladder,
        target = %config.phase1_target,
        resume = opts.resume,
        "Pre-flight complete"
    );

    // Orphaned members of a killed executor group reparent to us and are
    // reaped during termination instead of lingering as zombies.
    if let Err(e) = signals::become_subreaper() {
        warn!(
            error = %e,
            "Could not become child subreaper; forced terminations may stay unconfirmed"
        );
    }

    let ui = GovernorUi::new(config.governor.memory_threshold_kb, cli.verbose);
    let mut supervisor = ProcessSupervisor::new(config.termination_wait);
    let mut recovery = HostRecovery::new(&config.executor.output_dir, &config.artifact_extensions);
    let mut packager = CommandPackager::new(&config.project_dir);

    let result = PhaseOrchestrator::new(
        config,
        &mut monitor,
        &mut supervisor,
        &mut recovery,
        &mut packager,
    )
    .with_observer(&ui)
    .with_cancellation(watch_interrupt())
    .with_audit(AuditLogger::new(&config.audit_dir()))
    .resume(opts.resume)
    .packaging_args(opts.packaging_args)
    .run()
    .await;

    match &result {
        Ok(summary) => ui.finish(summary),
        Err(e) => ui.failed(e),
    }
    result
}

/// Flip the returned receiver to `true` on Ctrl-C.
///
/// The executor runs in its own process group and never sees the terminal's
/// SIGINT; the governor stops it through the normal termination protocol.
fn watch_interrupt() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; stopping the build");
            let _ = tx.send(true);
        }
    });
    rx
}
