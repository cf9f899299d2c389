//! CLI argument parsing
//!
//! Uses clap with derive macros. The subcommand tree mirrors the daemon's
//! operator surface: config, quota, schedule, tasks, review, and the daemon
//! lifecycle commands.

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use std::io;
use std::path::PathBuf;

/// Background agent that spends idle Claude quota on your task backlog
#[derive(Parser, Debug)]
#[command(name = "wise-magpie")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config directory (default: platform config dir)
    #[arg(long, env = "CONFIG_DIR_OVERRIDE", global = true)]
    pub config_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "RUST_LOG", default_value = "info", global = true)]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Manage the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Inspect and correct quota accounting
    Quota {
        #[command(subcommand)]
        action: QuotaAction,
    },

    /// Inspect the learned activity schedule
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },

    /// Manage the task queue
    Tasks {
        #[command(subcommand)]
        action: TasksAction,
    },

    /// Review finished work branches
    Review {
        #[command(subcommand)]
        action: ReviewAction,
    },

    /// Start the daemon
    Start {
        /// Run in the foreground instead of detaching
        #[arg(long, default_value_t = false)]
        foreground: bool,
    },

    /// Stop a running daemon (waits for the current task)
    Stop,

    /// Show daemon, quota, and queue status
    Status,

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Write a commented default config file
    Init,
    /// Print the effective configuration
    Show,
    /// Open the config file in $EDITOR
    Edit,
}

#[derive(Subcommand, Debug)]
pub enum QuotaAction {
    /// Show per-model consumption and remaining headroom
    Show,
    /// Pull remaining quota from the configured upstream endpoint
    Sync,
    /// Tell the accountant how many messages actually remain
    Correct {
        /// Model tier to correct (opus, sonnet, haiku)
        model: String,
        /// Remaining messages as reported by the provider UI
        remaining: u32,
    },
    /// Show past corrections
    History,
}

#[derive(Subcommand, Debug)]
pub enum ScheduleAction {
    /// Print the learned weekly activity heatmap
    Show,
    /// Predict the next return and the longest idle window
    Predict,
}

#[derive(Subcommand, Debug)]
pub enum TasksAction {
    /// List tasks, optionally filtered by status
    List {
        /// Filter: pending, running, completed, failed, awaiting_review,
        /// merged, rejected
        #[arg(long)]
        status: Option<String>,
    },
    /// Add a manual task to the queue
    Add {
        /// Task title
        title: String,
        /// Longer description passed to the assistant
        #[arg(long)]
        description: Option<String>,
        /// Force a model tier instead of automatic selection
        #[arg(long, default_value = "auto")]
        model: String,
        /// Repository the task should run in (default: current directory)
        #[arg(long)]
        work_dir: Option<PathBuf>,
    },
    /// Scan a repository for tasks (comments, queue file, templates)
    Scan {
        /// Repository to scan (default: configured work_dir)
        #[arg(long)]
        work_dir: Option<PathBuf>,
    },
    /// Remove a pending task
    Remove {
        /// Task id
        id: i64,
    },
}

#[derive(Subcommand, Debug)]
pub enum ReviewAction {
    /// List branches awaiting review
    List,
    /// Show one task's result in full
    Show {
        /// Task id
        id: i64,
    },
    /// Merge the task's branch into the base branch
    Approve {
        /// Task id
        id: i64,
    },
    /// Discard the task's branch
    Reject {
        /// Task id
        id: i64,
    },
    /// Queue a follow-up task with feedback for the assistant
    Respond {
        /// Task id
        id: i64,
        /// Feedback text
        feedback: String,
    },
}

/// Generate shell completions and print to stdout
pub fn print_completions(shell: Shell) {
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, "wise-magpie", &mut io::stdout());
}
