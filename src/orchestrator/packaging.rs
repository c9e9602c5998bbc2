//! Final packaging step, run once both phases succeed.

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::info;

use crate::config::PackagingSpec;
use crate::errors::PipelineError;
use crate::supervisor::process::exit_code;

#[async_trait]
pub trait Packager: Send {
    /// Run packaging against `output_dir` and return its exit code.
    async fn package(
        &mut self,
        spec: &PackagingSpec,
        output_dir: &Path,
        extra_args: &[String],
    ) -> Result<i32, PipelineError>;
}

/// Runs the configured packaging program in `working_dir` with inherited
/// stdio. Invoked as `program <args...> <output_dir> <extra_args...>`.
pub struct CommandPackager {
    working_dir: std::path::PathBuf,
}

impl CommandPackager {
    pub fn new(working_dir: &Path) -> Self {
        Self {
            working_dir: working_dir.to_path_buf(),
        }
    }
}

#[async_trait]
impl Packager for CommandPackager {
    async fn package(
        &mut self,
        spec: &PackagingSpec,
        output_dir: &Path,
        extra_args: &[String],
    ) -> Result<i32, PipelineError> {
        info!(
            program = %spec.program,
            output_dir = %output_dir.display(),
            "Running packaging"
        );
        let status = Command::new(&spec.program)
            .args(&spec.args)
            .arg(output_dir)
            .args(extra_args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .status()
            .await
            .map_err(|source| PipelineError::PackagingSpawn {
                program: spec.program.clone(),
                source,
            })?;
        Ok(exit_code(status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sh(script: &str) -> PackagingSpec {
        PackagingSpec {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string(), "package".to_string()],
        }
    }

    #[tokio::test]
    async fn test_passes_output_dir_then_extra_args() {
        let dir = tempdir().unwrap();
        let mut packager = CommandPackager::new(dir.path());
        let spec = sh(r#"echo "$@" > args.txt"#);

        let code = packager
            .package(
                &spec,
                Path::new("out/Release"),
                &["--zip".to_string(), "v2".to_string()],
            )
            .await
            .unwrap();

        assert_eq!(code, 0);
        let args = std::fs::read_to_string(dir.path().join("args.txt")).unwrap();
        assert_eq!(args.trim(), "out/Release --zip v2");
    }

    #[tokio::test]
    async fn test_reports_non_zero_exit() {
        let dir = tempdir().unwrap();
        let mut packager = CommandPackager::new(dir.path());
        let code = packager
            .package(&sh("exit 5"), dir.path(), &[])
            .await
            .unwrap();
        assert_eq!(code, 5);
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let dir = tempdir().unwrap();
        let mut packager = CommandPackager::new(dir.path());
        let spec = PackagingSpec {
            program: "/nonexistent/package-tool".to_string(),
            args: vec![],
        };
        let err = packager.package(&spec, dir.path(), &[]).await.unwrap_err();
        assert!(matches!(err, PipelineError::PackagingSpawn { .. }));
    }
}
