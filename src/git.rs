//! Git operations for the task executor and review workflow
//!
//! Provides the branch lifecycle for isolated task work:
//! - Clean-tree checks before the executor touches anything
//! - Branch create/switch/delete and base-branch detection
//! - Commit and change counts for the auto-template gate
//! - Merging reviewed assistant branches
//!
//! Uses direct CLI commands (no libgit2) for simplicity and compatibility.

use crate::errors::{MagpieError, Result};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

/// Verify git exists on PATH before anything needs it
pub fn ensure_git_available() -> Result<()> {
    match Command::new("git").arg("--version").output() {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(MagpieError::VcsNotFound),
        Err(e) => Err(MagpieError::Io(e)),
    }
}

/// Handle to one git repository
#[derive(Debug)]
pub struct GitRepo {
    repo_path: PathBuf,
}

impl GitRepo {
    /// Open a repository, verifying it actually is one
    pub fn open(repo_path: &Path) -> Result<Self> {
        if !repo_path.join(".git").exists() {
            return Err(MagpieError::NotARepository(
                repo_path.display().to_string(),
            ));
        }
        Ok(Self {
            repo_path: repo_path.to_path_buf(),
        })
    }

    fn git(&self, args: &[&str]) -> Result<std::process::Output> {
        let output = Command::new("git")
            .current_dir(&self.repo_path)
            .args(args)
            .output()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    MagpieError::VcsNotFound
                } else {
                    MagpieError::Io(e)
                }
            })?;
        Ok(output)
    }

    /// Run git and require a zero exit, returning stdout
    fn git_ok(&self, args: &[&str]) -> Result<String> {
        let output = self.git(args)?;
        if !output.status.success() {
            return Err(MagpieError::Vcs(format!(
                "git {}: {}",
                args.first().unwrap_or(&"?"),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Whether the working tree has no uncommitted changes
    pub fn is_clean(&self) -> Result<bool> {
        let stdout = self.git_ok(&["status", "--porcelain"])?;
        Ok(stdout.trim().is_empty())
    }

    /// Name of the currently checked-out branch
    pub fn current_branch(&self) -> Result<String> {
        Ok(self
            .git_ok(&["rev-parse", "--abbrev-ref", "HEAD"])?
            .trim()
            .to_string())
    }

    /// Create a branch at HEAD and switch to it
    pub fn create_and_switch(&self, branch: &str) -> Result<()> {
        self.git_ok(&["checkout", "-b", branch])?;
        info!(branch, "Created work branch");
        Ok(())
    }

    pub fn switch(&self, branch: &str) -> Result<()> {
        self.git_ok(&["checkout", branch])?;
        debug!(branch, "Switched branch");
        Ok(())
    }

    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        self.git_ok(&["branch", "-D", branch])?;
        info!(branch, "Deleted branch");
        Ok(())
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let output = self.git(&[
            "rev-parse",
            "--verify",
            "--quiet",
            &format!("refs/heads/{branch}"),
        ])?;
        Ok(output.status.success())
    }

    /// `main` or `master`, whichever exists
    pub fn default_base_branch(&self) -> Result<String> {
        for candidate in ["main", "master"] {
            if self.branch_exists(candidate)? {
                return Ok(candidate.to_string());
            }
        }
        Err(MagpieError::Vcs(
            "neither 'main' nor 'master' exists".to_string(),
        ))
    }

    /// Commits on the current branch since it forked from the base branch
    pub fn commits_since_fork(&self) -> Result<u32> {
        let base = self.default_base_branch()?;
        let current = self.current_branch()?;
        if current == base {
            return Ok(0);
        }
        let stdout = self.git_ok(&["rev-list", "--count", &format!("{base}..HEAD")])?;
        parse_count(&stdout)
    }

    /// Commits on HEAD newer than `since`
    pub fn commits_since(&self, since: DateTime<Utc>) -> Result<u32> {
        let stdout = self.git_ok(&[
            "rev-list",
            "--count",
            &format!("--since={}", since.to_rfc3339()),
            "HEAD",
        ])?;
        parse_count(&stdout)
    }

    /// Paths in the git index, relative to the repo root
    pub fn tracked_files(&self) -> Result<Vec<String>> {
        let stdout = self.git_ok(&["ls-files", "-z"])?;
        Ok(stdout
            .split('\0')
            .filter(|path| !path.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Paths added, modified, or renamed in commits newer than `since`
    pub fn changed_files_since(&self, since: DateTime<Utc>) -> Result<Vec<String>> {
        let stdout = self.git_ok(&[
            "log",
            &format!("--since={}", since.to_rfc3339()),
            "--diff-filter=AMR",
            "--name-only",
            "--pretty=format:",
        ])?;
        let mut files: Vec<String> = stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        files.sort();
        files.dedup();
        Ok(files)
    }

    /// Merge an assistant branch into the base branch (review approval)
    ///
    /// Leaves the repository checked out on the base branch. Merge conflicts
    /// surface as a `Vcs` error for the operator to resolve by hand.
    pub fn merge_into_base(&self, branch: &str) -> Result<()> {
        let base = self.default_base_branch()?;
        self.switch(&base)?;
        self.git_ok(&["merge", "--no-ff", branch, "-m", &format!("Merge {branch}")])?;
        info!(branch, base = %base, "Merged assistant branch");
        Ok(())
    }
}

fn parse_count(stdout: &str) -> Result<u32> {
    stdout
        .trim()
        .parse()
        .map_err(|e| MagpieError::Vcs(format!("unparseable rev-list count: {e}")))
}
