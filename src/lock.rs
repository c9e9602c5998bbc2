//! Exclusive workspace lock.
//!
//! Two governors sharing one build workspace would delete each other's
//! artifacts during cleanup, so a run holds an advisory lock on
//! `<state_dir>/gearbox.lock` until it exits.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct WorkspaceLock {
    file: File,
    path: PathBuf,
}

impl WorkspaceLock {
    /// Take the lock without blocking. Fails if another process holds it.
    pub fn acquire(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open lock file: {}", path.display()))?;

        FileExt::try_lock_exclusive(&file).with_context(|| {
            format!(
                "Another gearbox run holds the workspace lock ({})",
                path.display()
            )
        })?;

        file.set_len(0).context("Failed to truncate lock file")?;
        writeln!(file, "{}", std::process::id()).context("Failed to write lock file")?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkspaceLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_second_acquire_fails_until_release() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gearbox.lock");

        let first = WorkspaceLock::acquire(&path).unwrap();
        assert_eq!(first.path(), path.as_path());
        let err = WorkspaceLock::acquire(&path).unwrap_err();
        assert!(err.to_string().contains("workspace lock"));

        drop(first);
        assert!(WorkspaceLock::acquire(&path).is_ok());
    }

    #[test]
    fn test_lock_file_records_pid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gearbox.lock");
        let _lock = WorkspaceLock::acquire(&path).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());
    }
}
