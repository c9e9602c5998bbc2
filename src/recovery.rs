//! Recovery actions run after an attempt ends.
//!
//! A forcibly killed task can leave half-written objects behind, so after
//! every forced termination the recently modified artifacts in the output
//! directory are deleted, leftover children are reaped, and memory-driven
//! terminations additionally wait out a cooldown. None of this runs while
//! an attempt is alive.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::supervisor::signals;

/// What a cleanup pass removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CleanupReport {
    pub files_removed: usize,
    pub bytes_removed: u64,
    /// Files that matched but could not be deleted
    pub failures: usize,
}

/// Recovery operations, behind a trait so the governor can be tested
/// without touching the filesystem or sleeping.
#[async_trait]
pub trait Recovery: Send {
    /// Delete build artifacts modified within `window` of now.
    fn clean_recent_outputs(&mut self, window: Duration) -> CleanupReport;

    /// Collect exited-but-unreaped children of `pgid` until none remain.
    fn reap_zombies(&mut self, pgid: Option<i32>) -> usize;

    /// Sleep for `duration` so the host can reclaim memory.
    async fn cooldown(&mut self, duration: Duration);
}

/// Recovery against the real build workspace.
pub struct HostRecovery {
    output_dir: PathBuf,
    extensions: Vec<String>,
}

impl HostRecovery {
    pub fn new(output_dir: impl Into<PathBuf>, extensions: &[String]) -> Self {
        Self {
            output_dir: output_dir.into(),
            extensions: extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_lowercase())
                .collect(),
        }
    }

    fn is_artifact(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| self.extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
            .unwrap_or(false)
    }
}

#[async_trait]
impl Recovery for HostRecovery {
    fn clean_recent_outputs(&mut self, window: Duration) -> CleanupReport {
        let mut report = CleanupReport::default();
        if !self.output_dir.exists() {
            debug!(dir = %self.output_dir.display(), "Output directory missing; nothing to clean");
            return report;
        }
        let cutoff = SystemTime::now()
            .checked_sub(window)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        for entry in WalkDir::new(&self.output_dir)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let path = entry.path();
            if !self.is_artifact(path) {
                continue;
            }
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            let recent = meta.modified().map(|m| m >= cutoff).unwrap_or(false);
            if !recent {
                continue;
            }
            match std::fs::remove_file(path) {
                Ok(()) => {
                    report.files_removed += 1;
                    report.bytes_removed += meta.len();
                    debug!(path = %path.display(), "Removed partial artifact");
                }
                Err(e) => {
                    report.failures += 1;
                    warn!(path = %path.display(), error = %e, "Failed to remove artifact");
                }
            }
        }

        info!(
            files = report.files_removed,
            bytes = report.bytes_removed,
            window_secs = window.as_secs(),
            "Cleaned recently modified artifacts"
        );
        report
    }

    fn reap_zombies(&mut self, pgid: Option<i32>) -> usize {
        let Some(pgid) = pgid else {
            return 0;
        };
        let reaped = signals::reap_group(pgid);
        if reaped > 0 {
            info!(pgid, reaped, "Reaped leftover children");
        }
        reaped
    }

    async fn cooldown(&mut self, duration: Duration) {
        info!(secs = duration.as_secs(), "Cooling down before restart");
        tokio::time::sleep(duration).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn extensions() -> Vec<String> {
        vec!["o".to_string(), ".a".to_string()]
    }

    #[test]
    fn test_removes_recent_artifacts_only() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("obj/base");
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join("fresh.o"), b"partial").unwrap();
        fs::write(dir.path().join("libfresh.a"), b"archive").unwrap();
        fs::write(dir.path().join("build.ninja"), b"rules").unwrap();

        let mut recovery = HostRecovery::new(dir.path(), &extensions());
        let report = recovery.clean_recent_outputs(Duration::from_secs(120));

        assert_eq!(report.files_removed, 2);
        assert_eq!(report.bytes_removed, 14);
        assert!(!nested.join("fresh.o").exists());
        assert!(!dir.path().join("libfresh.a").exists());
        assert!(dir.path().join("build.ninja").exists());
    }

    #[test]
    fn test_keeps_artifacts_outside_window() {
        let dir = tempdir().unwrap();
        let old = dir.path().join("old.o");
        fs::write(&old, b"complete").unwrap();
        let an_hour_ago = SystemTime::now() - Duration::from_secs(3600);
        fs::File::options()
            .write(true)
            .open(&old)
            .unwrap()
            .set_modified(an_hour_ago)
            .unwrap();

        let mut recovery = HostRecovery::new(dir.path(), &extensions());
        let report = recovery.clean_recent_outputs(Duration::from_secs(120));

        assert_eq!(report.files_removed, 0);
        assert!(old.exists());
    }

    #[test]
    fn test_missing_output_dir_is_empty_report() {
        let dir = tempdir().unwrap();
        let mut recovery = HostRecovery::new(dir.path().join("absent"), &extensions());
        assert_eq!(
            recovery.clean_recent_outputs(Duration::from_secs(60)),
            CleanupReport::default()
        );
    }

    #[test]
    fn test_reap_without_group() {
        let dir = tempdir().unwrap();
        let mut recovery = HostRecovery::new(dir.path(), &extensions());
        assert_eq!(recovery.reap_zombies(None), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_sleeps_for_duration() {
        let dir = tempdir().unwrap();
        let mut recovery = HostRecovery::new(dir.path(), &extensions());
        let start = tokio::time::Instant::now();
        recovery.cooldown(Duration::from_secs(30)).await;
        assert!(start.elapsed() >= Duration::from_secs(30));
    }
}
