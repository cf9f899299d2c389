//! Structured error types for wise-magpie
//!
//! Uses thiserror for ergonomic error definitions with automatic Display
//! and Error trait implementations. Each kind maps to the CLI exit code the
//! operator-facing commands report: 1 user error, 2 precondition failure,
//! 3 external tool missing.

use thiserror::Error;

/// All possible errors in wise-magpie
#[derive(Error, Debug)]
pub enum MagpieError {
    /// Configuration file missing or invalid
    #[error("Config error: {0}")]
    Config(String),

    /// The working tree has uncommitted changes; the daemon refuses to touch it
    #[error("Working tree at {0} is dirty; commit or stash before autonomous work")]
    DirtyWorkingTree(String),

    /// The configured work_dir is not a git repository
    #[error("Not a git repository: {0}")]
    NotARepository(String),

    /// A live daemon already holds the singleton lock
    #[error("Daemon already running with pid {pid}")]
    AlreadyRunning { pid: u32 },

    /// Operation rejected because the task is currently running
    #[error("Task {0} is running; stop the daemon or wait for it to finish")]
    TaskBusy(i64),

    /// Attempted status change outside the task lifecycle
    #[error("Illegal status transition for task {id}: {from} -> {to}")]
    IllegalTransition {
        id: i64,
        from: crate::task::TaskStatus,
        to: crate::task::TaskStatus,
    },

    /// The Assistant CLI binary was not found on PATH
    #[error("Assistant CLI '{0}' not found on PATH")]
    AssistantNotFound(String),

    /// git was not found on PATH
    #[error("git not found on PATH")]
    VcsNotFound,

    /// A git invocation exited non-zero
    #[error("git failed: {0}")]
    Vcs(String),

    /// The Assistant CLI exited non-zero or produced unusable output
    #[error("Task execution failed: {0}")]
    TaskExecutionFailure(String),

    /// Upstream quota sync failed; retried on the next auto-sync
    #[error("Upstream quota sync failed: {0}")]
    UpstreamSync(String),

    /// Database failure; fatal for the daemon
    #[error("Store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// Filesystem or subprocess I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience Result type using MagpieError
pub type Result<T> = std::result::Result<T, MagpieError>;

impl MagpieError {
    /// Exit code the CLI front-end reports for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::TaskBusy(_) | Self::IllegalTransition { .. } => 1,
            Self::DirtyWorkingTree(_) | Self::NotARepository(_) | Self::AlreadyRunning { .. } => 2,
            Self::AssistantNotFound(_) | Self::VcsNotFound => 3,
            Self::TaskExecutionFailure(_)
            | Self::UpstreamSync(_)
            | Self::Vcs(_)
            | Self::Store(_)
            | Self::Io(_) => 1,
        }
    }
}
