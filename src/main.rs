use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use gearbox::config::CliOverrides;
use gearbox::logging::{self, LogFormat};

mod cmd;

#[derive(Parser)]
#[command(name = "gearbox")]
#[command(
    version,
    about = "Adaptive concurrency governor for memory-hungry parallel builds"
)]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Config file to use instead of <project-dir>/gearbox.toml
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Diagnostic log format on stderr
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the conservative phase, the main phase, then packaging
    Run {
        /// Skip steps a previous run already completed
        #[arg(long)]
        resume: bool,

        /// Memory threshold in GB (overrides gearbox.toml)
        #[arg(long)]
        memory_threshold_gb: Option<f64>,

        /// Unit built by the conservative phase (overrides gearbox.toml)
        #[arg(long)]
        phase1_target: Option<String>,

        /// Arguments passed through to the packaging step
        #[arg(last = true)]
        packaging_args: Vec<String>,
    },
    /// Sample host memory and CPU utilisation
    Probe {
        /// Seconds between the two CPU snapshots
        #[arg(long, default_value = "1.0")]
        interval: f64,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Show the phase journal and the latest run report
    Status,
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate the configuration
    Validate,
    /// Write a default gearbox.toml
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    // `run` sets up logging itself once the state directory is known.
    if !matches!(cli.command, Commands::Run { .. }) {
        logging::init_logging(cli.verbose, cli.log_format, None)?;
    }

    match &cli.command {
        Commands::Run {
            resume,
            memory_threshold_gb,
            phase1_target,
            packaging_args,
        } => {
            let opts = cmd::RunOptions {
                resume: *resume,
                overrides: CliOverrides {
                    memory_threshold_gb: *memory_threshold_gb,
                    phase1_target: phase1_target.clone(),
                },
                packaging_args: packaging_args.clone(),
            };
            let code = cmd::cmd_run(&cli, &project_dir, opts).await;
            std::process::exit(code);
        }
        Commands::Probe { interval } => cmd::cmd_probe(*interval).await?,
        Commands::Config { command } => {
            cmd::cmd_config(&project_dir, cli.config.as_deref(), command.clone())?
        }
        Commands::Status => cmd::cmd_status(&project_dir, cli.config.as_deref())?,
    }

    Ok(())
}
