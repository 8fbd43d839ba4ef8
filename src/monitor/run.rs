//! The execution collaborator: whatever actually runs the universes.

use anyhow::Result;
use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};

/// Interface the monitor needs from the process that executes universes.
///
/// `exit_codes` is the ordered sequence of `(uid, status)` pairs for
/// universes that have finished; its length is the done count.
#[async_trait]
pub trait MultiverseRun: Send + Sync {
    fn is_running(&self) -> bool;

    /// Total number of universes.
    fn size(&self) -> usize;

    fn exit_codes(&self) -> Vec<(u64, i32)>;

    async fn run_multiverse(&self, order: Vec<u64>) -> Result<()>;

    async fn resume_multiverse(&self, order: Vec<u64>) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    /// Merges partial result files so they can be read.
    async fn run_after_execute(&self) -> Result<()>;

    fn log_dir(&self) -> PathBuf;

    fn exit_log_path(&self) -> PathBuf;
}

/// Lines of the exit-status log, empty if it does not exist yet.
pub fn read_log_lines(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .map(|t| t.lines().map(str::to_string).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_read_log_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("exit_code.csv");
        fs::write(&path, "1,0\n3,1\n").unwrap();
        assert_eq!(read_log_lines(&path), vec!["1,0", "3,1"]);
        assert!(read_log_lines(&dir.path().join("missing")).is_empty());
    }
}
