//! Journal and last-run summary (`gearbox status`).

use anyhow::Result;
use std::path::Path;

use gearbox::audit::{AttemptEnd, AuditLogger};
use gearbox::config::{CliOverrides, GearboxToml};
use gearbox::orchestrator::StateManager;

pub fn cmd_status(project_dir: &Path, config_file: Option<&Path>) -> Result<()> {
    let toml = GearboxToml::load_layered(project_dir, config_file, &CliOverrides::default())?;
    let state_dir = toml.state_dir(project_dir);

    let state = StateManager::new(state_dir.join("state"));
    let entries = state.get_entries()?;

    println!();
    if entries.is_empty() {
        println!("No runs recorded in {}", state_dir.display());
        println!();
        return Ok(());
    }

    match state.get_last_completed_phase() {
        Some(phase) => println!("Last completed step: {}", phase),
        None => println!("No step has completed yet."),
    }
    println!();
    println!("Journal:");
    for entry in &entries {
        println!(
            "  {}  {:<13} {:<10} gear {}",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.phase,
            entry.status,
            entry.gear
        );
    }

    let audit = AuditLogger::new(&state_dir.join("audit"));
    if let Some(run) = audit.latest_run()? {
        println!();
        println!(
            "Latest run {} (exit code {}):",
            &run.run_id.to_string()[..8],
            run.exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string())
        );
        for phase in &run.phases {
            let forced = phase
                .attempts
                .iter()
                .filter(|a| matches!(a.end, AttemptEnd::Forced { .. }))
                .count();
            println!(
                "  {:<13} {:?}  {} attempt(s), {} forced termination(s)",
                phase.name,
                phase.outcome,
                phase.attempts.len(),
                forced
            );
        }
    }
    println!();

    Ok(())
}
