//! Configuration for gearbox.
//!
//! Settings are read from `gearbox.toml` in the project directory, then
//! overlaid with `GEARBOX_*` environment variables (a `.env` file is loaded
//! first via `dotenvy`), then with CLI flags. The layered result is resolved
//! once into an immutable [`GovernorConfig`] that the rest of the program
//! borrows.
//!
//! # Configuration File Format
//!
//! ```toml
//! [executor]
//! program = "ninja"
//! args = ["-C", "out/Release", "-j", "{jobs}", "{target}"]
//! output_dir = "out/Release"
//! task_line_pattern = '^\[\d+/\d+\]'
//!
//! [governor]
//! memory_threshold_gb = 50.0
//! fast_poll_secs = 1.0
//! throttle_poll_secs = 5.0
//! stall_threshold_percent = 2.5
//! stall_duration_secs = 600
//! upshift_batch_size = 50
//! termination_wait_secs = 30
//! cooldown_secs = 30
//!
//! [recovery]
//! cleanup_window_secs = 120
//! artifact_extensions = ["o", "obj", "a", "so", "rlib", "rmeta", "tmp"]
//!
//! [phases]
//! conservative_ladder = [4, 2, 1]
//! main_ladder = [32, 16, 8, 4, 2]
//! phase1_target = "libheavy"
//!
//! [packaging]
//! program = "./package.sh"
//! args = ["--compress"]
//! ```

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::ConfigError;
use crate::gear::GearLadder;
use crate::governor::GovernorSettings;
use crate::monitor::KB_PER_GB;

pub const CONFIG_FILE_NAME: &str = "gearbox.toml";

/// Placeholder replaced by the gear's concurrency in executor arguments.
pub const JOBS_PLACEHOLDER: &str = "{jobs}";
/// Placeholder replaced by the phase target in executor arguments.
pub const TARGET_PLACEHOLDER: &str = "{target}";

/// How the build executor is invoked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorSection {
    #[serde(default = "default_executor_program")]
    pub program: String,
    #[serde(default = "default_executor_args")]
    pub args: Vec<String>,
    /// Working directory for the executor, relative to the project directory
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// The executor's declared output path, cleaned on forced termination
    /// and handed to packaging on success
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// A line matching this pattern counts as one completed task
    #[serde(default = "default_task_line_pattern")]
    pub task_line_pattern: String,
}

fn default_executor_program() -> String {
    "ninja".to_string()
}

fn default_executor_args() -> Vec<String> {
    vec![
        "-C".to_string(),
        "out/Release".to_string(),
        "-j".to_string(),
        JOBS_PLACEHOLDER.to_string(),
        TARGET_PLACEHOLDER.to_string(),
    ]
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("out/Release")
}

fn default_task_line_pattern() -> String {
    r"^\[\d+/\d+\]".to_string()
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            program: default_executor_program(),
            args: default_executor_args(),
            working_dir: None,
            output_dir: default_output_dir(),
            task_line_pattern: default_task_line_pattern(),
        }
    }
}

/// Control-loop thresholds and timings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernorSection {
    #[serde(default = "default_memory_threshold_gb")]
    pub memory_threshold_gb: f64,
    /// Poll interval at gear 0
    #[serde(default = "default_fast_poll_secs")]
    pub fast_poll_secs: f64,
    /// Poll interval at every other gear
    #[serde(default = "default_throttle_poll_secs")]
    pub throttle_poll_secs: f64,
    #[serde(default = "default_stall_threshold_percent")]
    pub stall_threshold_percent: f64,
    #[serde(default = "default_stall_duration_secs")]
    pub stall_duration_secs: u64,
    #[serde(default = "default_upshift_batch_size")]
    pub upshift_batch_size: u32,
    /// Bounded wait after each termination signal
    #[serde(default = "default_termination_wait_secs")]
    pub termination_wait_secs: u64,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

fn default_memory_threshold_gb() -> f64 {
    50.0
}

fn default_fast_poll_secs() -> f64 {
    1.0
}

fn default_throttle_poll_secs() -> f64 {
    5.0
}

fn default_stall_threshold_percent() -> f64 {
    2.5
}

fn default_stall_duration_secs() -> u64 {
    600
}

fn default_upshift_batch_size() -> u32 {
    50
}

fn default_termination_wait_secs() -> u64 {
    30
}

fn default_cooldown_secs() -> u64 {
    30
}

impl Default for GovernorSection {
    fn default() -> Self {
        Self {
            memory_threshold_gb: default_memory_threshold_gb(),
            fast_poll_secs: default_fast_poll_secs(),
            throttle_poll_secs: default_throttle_poll_secs(),
            stall_threshold_percent: default_stall_threshold_percent(),
            stall_duration_secs: default_stall_duration_secs(),
            upshift_batch_size: default_upshift_batch_size(),
            termination_wait_secs: default_termination_wait_secs(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

/// Artifact cleanup after forced terminations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoverySection {
    #[serde(default = "default_cleanup_window_secs")]
    pub cleanup_window_secs: u64,
    /// File extensions (without the dot) treated as build artifacts
    #[serde(default = "default_artifact_extensions")]
    pub artifact_extensions: Vec<String>,
}

fn default_cleanup_window_secs() -> u64 {
    120
}

fn default_artifact_extensions() -> Vec<String> {
    ["o", "obj", "a", "so", "rlib", "rmeta", "tmp"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            cleanup_window_secs: default_cleanup_window_secs(),
            artifact_extensions: default_artifact_extensions(),
        }
    }
}

/// Gear ladders and scope for the two phases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhasesSection {
    #[serde(default = "default_conservative_ladder")]
    pub conservative_ladder: Vec<u32>,
    #[serde(default = "default_main_ladder")]
    pub main_ladder: Vec<u32>,
    /// The single heavy unit built by the conservative phase
    #[serde(default)]
    pub phase1_target: Option<String>,
}

fn default_conservative_ladder() -> Vec<u32> {
    vec![4, 2, 1]
}

fn default_main_ladder() -> Vec<u32> {
    vec![32, 16, 8, 4, 2]
}

impl Default for PhasesSection {
    fn default() -> Self {
        Self {
            conservative_ladder: default_conservative_ladder(),
            main_ladder: default_main_ladder(),
            phase1_target: None,
        }
    }
}

/// Packaging step run once after the main phase succeeds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PackagingSection {
    #[serde(default)]
    pub program: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Where gearbox keeps its own state, logs and reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSection {
    #[serde(default = "default_state_dir")]
    pub dir: PathBuf,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".gearbox")
}

impl Default for StateSection {
    fn default() -> Self {
        Self {
            dir: default_state_dir(),
        }
    }
}

/// The complete gearbox.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GearboxToml {
    #[serde(default)]
    pub executor: ExecutorSection,
    #[serde(default)]
    pub governor: GovernorSection,
    #[serde(default)]
    pub recovery: RecoverySection,
    #[serde(default)]
    pub phases: PhasesSection,
    #[serde(default)]
    pub packaging: PackagingSection,
    #[serde(default)]
    pub state: StateSection,
}

impl GearboxToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse gearbox.toml")
    }

    /// Load `path`, or defaults when the file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize gearbox.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// File, then `.env` and `GEARBOX_*` variables, then CLI flags.
    /// Not validated.
    pub fn load_layered(
        project_dir: &Path,
        config_file: Option<&Path>,
        overrides: &CliOverrides,
    ) -> Result<Self> {
        let mut toml = Self::load_or_default(&config_path(project_dir, config_file))?;
        // A missing .env is normal; anything else is worth surfacing.
        if let Err(e) = dotenvy::from_path(project_dir.join(".env"))
            && !e.not_found()
        {
            return Err(e).context("Failed to load .env");
        }
        toml.apply_env(|key| std::env::var(key).ok())?;
        toml.apply_overrides(overrides);
        Ok(toml)
    }

    /// State directory, resolved against `project_dir` when relative.
    pub fn state_dir(&self, project_dir: &Path) -> PathBuf {
        resolve_in(project_dir, &self.state.dir)
    }

    /// Overlay `GEARBOX_*` variables fetched through `lookup`.
    ///
    /// Taking a lookup function keeps tests independent of the process
    /// environment; production passes `std::env::var(..).ok()`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(
            lookup: &dyn Fn(&str) -> Option<String>,
            key: &str,
        ) -> Result<Option<T>> {
            match lookup(key) {
                Some(raw) => raw
                    .trim()
                    .parse::<T>()
                    .map(Some)
                    .map_err(|_| anyhow::anyhow!("Invalid value '{}' for {}", raw, key)),
                None => Ok(None),
            }
        }

        fn ladder(lookup: &dyn Fn(&str) -> Option<String>, key: &str) -> Result<Option<Vec<u32>>> {
            match lookup(key) {
                Some(raw) => {
                    let ladder = GearLadder::parse(&raw)
                        .with_context(|| format!("Invalid value '{}' for {}", raw, key))?;
                    Ok(Some(ladder.into()))
                }
                None => Ok(None),
            }
        }

        let lookup: &dyn Fn(&str) -> Option<String> = &lookup;
        let g = &mut self.governor;
        if let Some(v) = parsed(lookup, "GEARBOX_MEMORY_THRESHOLD_GB")? {
            g.memory_threshold_gb = v;
        }
        if let Some(v) = parsed(lookup, "GEARBOX_FAST_POLL_SECS")? {
            g.fast_poll_secs = v;
        }
        if let Some(v) = parsed(lookup, "GEARBOX_THROTTLE_POLL_SECS")? {
            g.throttle_poll_secs = v;
        }
        if let Some(v) = parsed(lookup, "GEARBOX_STALL_THRESHOLD_PERCENT")? {
            g.stall_threshold_percent = v;
        }
        if let Some(v) = parsed(lookup, "GEARBOX_STALL_DURATION_SECS")? {
            g.stall_duration_secs = v;
        }
        if let Some(v) = parsed(lookup, "GEARBOX_UPSHIFT_BATCH_SIZE")? {
            g.upshift_batch_size = v;
        }
        if let Some(v) = parsed(lookup, "GEARBOX_TERMINATION_WAIT_SECS")? {
            g.termination_wait_secs = v;
        }
        if let Some(v) = parsed(lookup, "GEARBOX_COOLDOWN_SECS")? {
            g.cooldown_secs = v;
        }
        if let Some(v) = parsed(lookup, "GEARBOX_CLEANUP_WINDOW_SECS")? {
            self.recovery.cleanup_window_secs = v;
        }
        if let Some(v) = ladder(lookup, "GEARBOX_CONSERVATIVE_LADDER")? {
            self.phases.conservative_ladder = v;
        }
        if let Some(v) = ladder(lookup, "GEARBOX_MAIN_LADDER")? {
            self.phases.main_ladder = v;
        }
        if let Some(v) = lookup("GEARBOX_PHASE1_TARGET") {
            self.phases.phase1_target = Some(v);
        }
        Ok(())
    }

    /// Overlay CLI flags.
    pub fn apply_overrides(&mut self, overrides: &CliOverrides) {
        if let Some(gb) = overrides.memory_threshold_gb {
            self.governor.memory_threshold_gb = gb;
        }
        if let Some(ref target) = overrides.phase1_target {
            self.phases.phase1_target = Some(target.clone());
        }
    }

    /// Validate the configuration and return any warnings.
    ///
    /// Hard errors (values the governor cannot run with) are returned as
    /// `Err`; soft problems are returned as warning strings.
    pub fn validate(&self) -> std::result::Result<Vec<String>, ConfigError> {
        let mut warnings = Vec::new();
        let g = &self.governor;

        GearLadder::new(self.phases.conservative_ladder.clone()).map_err(|source| {
            ConfigError::Ladder {
                field: "phases.conservative_ladder".to_string(),
                source,
            }
        })?;
        GearLadder::new(self.phases.main_ladder.clone()).map_err(|source| ConfigError::Ladder {
            field: "phases.main_ladder".to_string(),
            source,
        })?;
        Regex::new(&self.executor.task_line_pattern).map_err(ConfigError::TaskPattern)?;

        positive("governor.memory_threshold_gb", g.memory_threshold_gb)?;
        interval("governor.fast_poll_secs", g.fast_poll_secs)?;
        interval("governor.throttle_poll_secs", g.throttle_poll_secs)?;
        if !g.stall_threshold_percent.is_finite() || g.stall_threshold_percent < 0.0 {
            return Err(invalid(
                "governor.stall_threshold_percent",
                "must be a non-negative number",
            ));
        }
        if g.upshift_batch_size == 0 {
            return Err(invalid("governor.upshift_batch_size", "must be at least 1"));
        }
        if self.executor.program.trim().is_empty() {
            return Err(invalid("executor.program", "must not be empty"));
        }
        match self.phases.phase1_target.as_deref() {
            Some(t) if !t.trim().is_empty() => {}
            _ => {
                return Err(invalid(
                    "phases.phase1_target",
                    "must name the unit built by the conservative phase",
                ));
            }
        }

        if g.stall_threshold_percent > 100.0 {
            warnings.push(format!(
                "governor.stall_threshold_percent is {} (> 100); every sample will count as stalled",
                g.stall_threshold_percent
            ));
        }
        if g.fast_poll_secs > g.throttle_poll_secs {
            warnings.push(format!(
                "governor.fast_poll_secs ({}) is slower than throttle_poll_secs ({})",
                g.fast_poll_secs, g.throttle_poll_secs
            ));
        }
        if !self
            .executor
            .args
            .iter()
            .any(|a| a.contains(JOBS_PLACEHOLDER))
        {
            warnings.push(format!(
                "executor.args contains no {} placeholder; concurrency will not reach the executor",
                JOBS_PLACEHOLDER
            ));
        }
        if self.packaging.program.is_none() {
            warnings.push("packaging.program is not set; packaging will be skipped".to_string());
        }

        Ok(warnings)
    }
}

/// Config file path: `config_file` if given, else `gearbox.toml` in `project_dir`.
pub fn config_path(project_dir: &Path, config_file: Option<&Path>) -> PathBuf {
    config_file
        .map(Path::to_path_buf)
        .unwrap_or_else(|| project_dir.join(CONFIG_FILE_NAME))
}

fn resolve_in(base: &Path, p: &Path) -> PathBuf {
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base.join(p)
    }
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

fn positive(field: &str, value: f64) -> std::result::Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(invalid(field, "must be greater than zero"))
    }
}

/// A positive number of seconds that fits in a `Duration`.
fn interval(field: &str, secs: f64) -> std::result::Result<Duration, ConfigError> {
    positive(field, secs)?;
    Duration::try_from_secs_f64(secs).map_err(|_| invalid(field, "is too large"))
}

/// Flags from the command line that override file and environment values.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub memory_threshold_gb: Option<f64>,
    pub phase1_target: Option<String>,
}

/// Resolved executor invocation.
#[derive(Debug, Clone)]
pub struct ExecutorSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub output_dir: PathBuf,
}

/// One concrete executor command line at a fixed concurrency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildCommand {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub concurrency: u32,
}

impl BuildCommand {
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

impl ExecutorSpec {
    /// Substitute placeholders for one attempt.
    ///
    /// An argument that is exactly `{target}` is dropped when the phase is
    /// unscoped, so `ninja -j 8 {target}` becomes `ninja -j 8`.
    pub fn command_for(&self, concurrency: u32, target: Option<&str>) -> BuildCommand {
        let jobs = concurrency.to_string();
        let args = self
            .args
            .iter()
            .filter(|arg| target.is_some() || arg.as_str() != TARGET_PLACEHOLDER)
            .map(|arg| {
                arg.replace(JOBS_PLACEHOLDER, &jobs)
                    .replace(TARGET_PLACEHOLDER, target.unwrap_or(""))
            })
            .collect();
        BuildCommand {
            program: self.program.clone(),
            args,
            working_dir: self.working_dir.clone(),
            concurrency,
        }
    }
}

/// Packaging invocation, present only when configured.
#[derive(Debug, Clone)]
pub struct PackagingSpec {
    pub program: String,
    pub args: Vec<String>,
}

/// Immutable configuration resolved once at startup.
#[derive(Debug, Clone)]
pub struct GovernorConfig {
    pub project_dir: PathBuf,
    pub state_dir: PathBuf,
    pub executor: ExecutorSpec,
    pub governor: GovernorSettings,
    pub termination_wait: Duration,
    pub artifact_extensions: Vec<String>,
    pub conservative_ladder: GearLadder,
    pub main_ladder: GearLadder,
    pub phase1_target: String,
    pub packaging: Option<PackagingSpec>,
    pub warnings: Vec<String>,
}

impl GovernorConfig {
    /// Load, layer and validate configuration for `project_dir`.
    pub fn load(
        project_dir: &Path,
        config_file: Option<&Path>,
        overrides: &CliOverrides,
    ) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let toml = GearboxToml::load_layered(&project_dir, config_file, overrides)?;
        Self::from_toml(&project_dir, toml)
    }

    /// Resolve an already-layered `GearboxToml`.
    pub fn from_toml(project_dir: &Path, toml: GearboxToml) -> Result<Self> {
        let warnings = toml.validate()?;
        let resolve = |p: &Path| resolve_in(project_dir, p);

        let g = &toml.governor;
        let governor = GovernorSettings {
            memory_threshold_kb: (g.memory_threshold_gb * KB_PER_GB as f64) as u64,
            fast_poll: interval("governor.fast_poll_secs", g.fast_poll_secs)?,
            throttle_poll: interval("governor.throttle_poll_secs", g.throttle_poll_secs)?,
            stall_threshold_percent: g.stall_threshold_percent,
            stall_duration: Duration::from_secs(g.stall_duration_secs),
            upshift_batch_size: g.upshift_batch_size,
            cleanup_window: Duration::from_secs(toml.recovery.cleanup_window_secs),
            cooldown: Duration::from_secs(g.cooldown_secs),
            task_line: Regex::new(&toml.executor.task_line_pattern)
                .map_err(ConfigError::TaskPattern)?,
        };

        let executor = ExecutorSpec {
            program: toml.executor.program.clone(),
            args: toml.executor.args.clone(),
            working_dir: toml
                .executor
                .working_dir
                .as_deref()
                .map(resolve)
                .unwrap_or_else(|| project_dir.to_path_buf()),
            output_dir: resolve(&toml.executor.output_dir),
        };

        Ok(Self {
            project_dir: project_dir.to_path_buf(),
            state_dir: toml.state_dir(project_dir),
            executor,
            governor,
            termination_wait: Duration::from_secs(g.termination_wait_secs),
            artifact_extensions: toml.recovery.artifact_extensions.clone(),
            conservative_ladder: GearLadder::new(toml.phases.conservative_ladder.clone())?,
            main_ladder: GearLadder::new(toml.phases.main_ladder.clone())?,
            phase1_target: toml.phases.phase1_target.clone().unwrap_or_default(),
            packaging: toml.packaging.program.clone().map(|program| PackagingSpec {
                program,
                args: toml.packaging.args.clone(),
            }),
            warnings,
        })
    }

    pub fn log_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    pub fn audit_dir(&self) -> PathBuf {
        self.state_dir.join("audit")
    }

    pub fn state_file(&self) -> PathBuf {
        self.state_dir.join("state")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.state_dir.join("gearbox.lock")
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(self.log_dir()).context("Failed to create log directory")?;
        std::fs::create_dir_all(self.audit_dir().join("runs"))
            .context("Failed to create audit directory")?;
        Ok(())
    }
}
