//! Typed error hierarchy for the gearbox governor.
//!
//! The enums follow the failure taxonomy of the control loop:
//! - `LadderError` / `ConfigError`: rejected configuration (pre-flight)
//! - `ProbeError`: host counters unreadable, always fatal
//! - `SupervisorError`: the executor could not be spawned or waited on
//! - `GovernorError`: the outcome of one governed phase
//! - `PipelineError`: the outcome of the whole run, mapped to an exit code
//!
//! Recoverable resource pressure (memory breach, CPU stall) never appears
//! here: the governor handles it internally by re-gearing and restarting.

use std::path::PathBuf;
use thiserror::Error;

/// Exit code for a successful run.
pub const EXIT_SUCCESS: i32 = 0;
/// Exit code when configuration, locking or the priming probe fails.
pub const EXIT_PREFLIGHT: i32 = 2;
/// Exit code when a phase ends in a genuine build failure.
pub const EXIT_BUILD: i32 = 3;
/// Exit code when packaging fails after a successful build.
pub const EXIT_PACKAGING: i32 = 4;
/// Exit code after an operator interrupt (128 + SIGINT).
pub const EXIT_CANCELLED: i32 = 130;

/// Rejected gear ladder.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LadderError {
    #[error("gear ladder must contain at least one level")]
    Empty,

    #[error("gear ladder level {index} is zero; concurrency must be positive")]
    ZeroLevel { index: usize },

    #[error("gear ladder must be strictly descending: level {index} ({value}) is not below {previous}")]
    NotDescending {
        index: usize,
        previous: u32,
        value: u32,
    },

    #[error("invalid gear ladder level '{value}'")]
    InvalidLevel { value: String },
}

/// Configuration rejected during validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field}: {reason}")]
    Invalid { field: String, reason: String },

    #[error("{field}: {source}")]
    Ladder {
        field: String,
        #[source]
        source: LadderError,
    },

    #[error("executor.task_line_pattern is not a valid regex: {0}")]
    TaskPattern(#[source] regex::Error),
}

/// Host counters could not be read or parsed.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{field} missing from {path}")]
    MissingField { path: PathBuf, field: &'static str },

    #[error("unparsable value '{value}' for {field}")]
    Parse { field: &'static str, value: String },
}

/// Failures while starting or observing the executor process.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to spawn executor '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("executor spawned without a {0} pipe")]
    MissingPipe(&'static str),

    #[error("executor exited before its process id could be read")]
    NoPid,

    #[error("failed to wait on executor: {0}")]
    Wait(#[source] std::io::Error),
}

/// Outcome of one governed phase that is not a clean success.
#[derive(Debug, Error)]
pub enum GovernorError {
    #[error("host probe failed: {0}")]
    Probe(#[from] ProbeError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error("executor exited with non-zero code {exit_code}")]
    BuildFailed { exit_code: i32 },

    #[error("cancelled by operator")]
    Cancelled,
}

/// Outcome of the whole pipeline that is not a clean success.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pre-flight check failed: {0:#}")]
    Preflight(#[source] anyhow::Error),

    #[error("phase '{phase}' failed: {source}")]
    Build {
        phase: String,
        #[source]
        source: GovernorError,
    },

    #[error("packaging exited with non-zero code {exit_code}")]
    Packaging { exit_code: i32 },

    #[error("failed to run packaging '{program}': {source}")]
    PackagingSpawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cancelled by operator")]
    Cancelled,
}

impl PipelineError {
    /// Process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::Preflight(_) => EXIT_PREFLIGHT,
            PipelineError::Build { .. } => EXIT_BUILD,
            PipelineError::Packaging { .. } | PipelineError::PackagingSpawn { .. } => {
                EXIT_PACKAGING
            }
            PipelineError::Cancelled => EXIT_CANCELLED,
        }
    }

    /// Wrap a phase failure, routing cancellation to its own variant.
    pub fn from_phase(phase: &str, err: GovernorError) -> Self {
        match err {
            GovernorError::Cancelled => PipelineError::Cancelled,
            source => PipelineError::Build {
                phase: phase.to_string(),
                source,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct() {
        let codes = [
            PipelineError::Preflight(anyhow::anyhow!("bad")).exit_code(),
            PipelineError::Build {
                phase: "main".into(),
                source: GovernorError::BuildFailed { exit_code: 2 },
            }
            .exit_code(),
            PipelineError::Packaging { exit_code: 1 }.exit_code(),
            PipelineError::Cancelled.exit_code(),
        ];
        assert_eq!(codes, [EXIT_PREFLIGHT, EXIT_BUILD, EXIT_PACKAGING, EXIT_CANCELLED]);
        assert!(!codes.contains(&EXIT_SUCCESS));
    }

    #[test]
    fn from_phase_routes_cancellation() {
        let err = PipelineError::from_phase("conservative", GovernorError::Cancelled);
        assert!(matches!(err, PipelineError::Cancelled));

        let err = PipelineError::from_phase(
            "main",
            GovernorError::BuildFailed { exit_code: 2 },
        );
        match &err {
            PipelineError::Build { phase, source } => {
                assert_eq!(phase, "main");
                assert!(matches!(source, GovernorError::BuildFailed { exit_code: 2 }));
            }
            _ => panic!("Expected Build variant"),
        }
        assert!(err.to_string().contains("code 2"));
    }

    #[test]
    fn probe_error_carries_path() {
        let err = ProbeError::MissingField {
            path: PathBuf::from("/proc/meminfo"),
            field: "MemAvailable",
        };
        assert!(err.to_string().contains("/proc/meminfo"));
        let gov: GovernorError = err.into();
        assert!(matches!(gov, GovernorError::Probe(_)));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&LadderError::Empty);
        assert_std_error(&SupervisorError::NoPid);
        assert_std_error(&GovernorError::Cancelled);
        assert_std_error(&PipelineError::Cancelled);
    }
}
