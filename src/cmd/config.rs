//! Configuration view and validation commands (`gearbox config`).

use anyhow::{Context, Result};
use std::path::Path;

use gearbox::config::{CliOverrides, GearboxToml, config_path};

use super::super::ConfigCommands;

pub fn cmd_config(
    project_dir: &Path,
    config_file: Option<&Path>,
    command: Option<ConfigCommands>,
) -> Result<()> {
    let path = config_path(project_dir, config_file);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Gearbox Configuration");
            println!("=====================");
            println!();
            if path.exists() {
                println!("Config file: {}", path.display());
            } else {
                println!("No gearbox.toml found at {}; using defaults.", path.display());
            }
            println!();

            let toml = GearboxToml::load_layered(project_dir, config_file, &CliOverrides::default())?;
            println!("Effective values (with .env and GEARBOX_* overrides):");
            println!();
            let rendered =
                toml::to_string_pretty(&toml).context("Failed to render configuration")?;
            for line in rendered.lines() {
                println!("  {}", line);
            }
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let toml = GearboxToml::load_layered(project_dir, config_file, &CliOverrides::default())?;
            let warnings = toml
                .validate()
                .with_context(|| format!("Invalid configuration in {}", path.display()))?;

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration is valid, with warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init { force }) => {
            if path.exists() && !force {
                println!("gearbox.toml already exists at {}", path.display());
                println!("Pass --force to overwrite it.");
                return Ok(());
            }

            GearboxToml::default().save(&path)?;

            println!("Created gearbox.toml at {}", path.display());
            println!();
            println!("Before the first run, set:");
            println!("  - [phases] phase1_target, the unit built by the conservative phase");
            println!("  - [executor] program, args and output_dir for your build");
            println!("  - [packaging] program, if the build output should be packaged");
            println!();
        }
    }

    Ok(())
}
