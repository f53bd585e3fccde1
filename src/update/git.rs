//! Git-aware incremental updates
//!
//! For cached entries that are git checkouts, change detection compares
//! commits instead of hashing file trees: fetch, diff the local head
//! against the remote head, and pull when they differ.

use std::path::Path;
use std::process::Command;

use crate::core::{MortarError, MortarResult};

/// Result of a git-aware update attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GitUpdateOutcome {
    /// Local head already matches the remote.
    UpToDate,
    /// Pulled; these paths changed between the two commits.
    Updated { changed_files: Vec<String> },
    /// The target is not a git checkout; the caller should fetch fresh.
    NotARepository,
}

/// Runs git against cached checkouts.
#[derive(Debug, Default)]
pub struct GitIncrementalUpdater;

impl GitIncrementalUpdater {
    pub fn new() -> Self {
        Self
    }

    pub fn is_git_repository(&self, path: &Path) -> bool {
        path.join(".git").exists()
    }

    /// Commit hash of the local HEAD.
    pub fn current_commit(&self, path: &Path) -> MortarResult<String> {
        run_git(path, &["rev-parse", "HEAD"])
    }

    /// Commit hash of the remote head after a fetch.
    pub fn remote_head(&self, path: &Path) -> MortarResult<String> {
        run_git(path, &["fetch", "--quiet", "origin"])?;
        run_git(path, &["rev-parse", "FETCH_HEAD"])
    }

    /// Paths that differ between two commits.
    pub fn changed_files(
        &self,
        path: &Path,
        from_commit: &str,
        to_commit: &str,
    ) -> MortarResult<Vec<String>> {
        let output = run_git(path, &["diff", "--name-only", from_commit, to_commit])?;
        Ok(parse_name_only(&output))
    }

    pub fn pull(&self, path: &Path) -> MortarResult<()> {
        run_git(path, &["pull", "--quiet"])?;
        Ok(())
    }

    /// Check out a tag or commit.
    pub fn checkout_version(&self, path: &Path, version: &str) -> MortarResult<()> {
        run_git(path, &["checkout", "--quiet", version])?;
        Ok(())
    }

    /// Tags available in the checkout.
    pub fn available_versions(&self, path: &Path) -> MortarResult<Vec<String>> {
        let output = run_git(path, &["tag", "-l"])?;
        Ok(parse_name_only(&output))
    }

    /// Fetch-then-compare-commits update. Pulls only when the remote
    /// moved, and reports exactly which files the pull changed.
    pub fn update_incremental(&self, target_path: &Path) -> MortarResult<GitUpdateOutcome> {
        if !self.is_git_repository(target_path) {
            return Ok(GitUpdateOutcome::NotARepository);
        }

        let local = self.current_commit(target_path)?;
        let remote = self.remote_head(target_path)?;
        if local == remote {
            tracing::debug!(path = %target_path.display(), "checkout already at remote head");
            return Ok(GitUpdateOutcome::UpToDate);
        }

        let changed_files = self.changed_files(target_path, &local, &remote)?;
        self.pull(target_path)?;
        tracing::info!(
            path = %target_path.display(),
            files = changed_files.len(),
            "pulled incremental git update"
        );
        Ok(GitUpdateOutcome::Updated { changed_files })
    }
}

fn run_git(dir: &Path, args: &[&str]) -> MortarResult<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .map_err(|e| MortarError::git(format!("failed to spawn git: {}", e)))?;
    if !output.status.success() {
        return Err(MortarError::git(format!(
            "git {} exited with {}: {}",
            args.join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// One path per non-empty line, as `--name-only` and `tag -l` print.
fn parse_name_only(output: &str) -> Vec<String> {
    output
        .lines()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .map(|l| l.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_is_git_repository() {
        let tmp = tempdir().unwrap();
        let u = GitIncrementalUpdater::new();
        assert!(!u.is_git_repository(tmp.path()));

        std::fs::create_dir_all(tmp.path().join(".git")).unwrap();
        assert!(u.is_git_repository(tmp.path()));
    }

    #[test]
    fn test_non_repository_short_circuits() {
        let tmp = tempdir().unwrap();
        let u = GitIncrementalUpdater::new();
        assert_eq!(
            u.update_incremental(tmp.path()).unwrap(),
            GitUpdateOutcome::NotARepository
        );
    }

    #[test]
    fn test_parse_name_only() {
        let output = "src/a.cpp\n\ninclude/b.hpp\n  \nREADME.md\n";
        assert_eq!(
            parse_name_only(output),
            vec!["src/a.cpp", "include/b.hpp", "README.md"]
        );
        assert!(parse_name_only("").is_empty());
    }
}
