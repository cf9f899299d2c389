//! Task model and the enums that travel with it
//!
//! A task is the unit of autonomous work: where it came from, what model the
//! operator asked for, where it is in its lifecycle, and what it cost.
//! Everything here round-trips through the SQLite store as plain strings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Where a task was discovered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskSource {
    Manual,
    CodeComment,
    QueueFile,
    AutoTemplate,
    Issue,
    Markdown,
}

impl TaskSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::CodeComment => "code_comment",
            Self::QueueFile => "queue_file",
            Self::AutoTemplate => "auto_template",
            Self::Issue => "issue",
            Self::Markdown => "markdown",
        }
    }
}

impl FromStr for TaskSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Self::Manual),
            "code_comment" => Ok(Self::CodeComment),
            "queue_file" => Ok(Self::QueueFile),
            "auto_template" => Ok(Self::AutoTemplate),
            "issue" => Ok(Self::Issue),
            "markdown" => Ok(Self::Markdown),
            other => Err(format!("unknown task source '{other}'")),
        }
    }
}

impl fmt::Display for TaskSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task lifecycle state
///
/// Transitions are strictly `pending -> running -> (completed|failed) ->
/// awaiting_review -> (merged|rejected)`. The store enforces legality on
/// every status update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    AwaitingReview,
    Merged,
    Rejected,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::AwaitingReview => "awaiting_review",
            Self::Merged => "merged",
            Self::Rejected => "rejected",
        }
    }

    /// Whether `next` is a legal successor of `self`
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Pending) // orphan sweep after a crash
                | (Self::Completed, Self::AwaitingReview)
                | (Self::AwaitingReview, Self::Merged)
                | (Self::AwaitingReview, Self::Rejected)
        )
    }

}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "awaiting_review" => Ok(Self::AwaitingReview),
            "merged" => Ok(Self::Merged),
            "rejected" => Ok(Self::Rejected),
            other => Err(format!("unknown task status '{other}'")),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The three Claude tiers the daemon dispatches to, cheapest last
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    Opus,
    Sonnet,
    Haiku,
}

impl ModelTier {
    pub const ALL: [ModelTier; 3] = [Self::Opus, Self::Sonnet, Self::Haiku];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Opus => "opus",
            Self::Sonnet => "sonnet",
            Self::Haiku => "haiku",
        }
    }

    /// One tier up (haiku -> sonnet -> opus); opus has no upgrade
    pub fn upgraded(self) -> Option<ModelTier> {
        match self {
            Self::Haiku => Some(Self::Sonnet),
            Self::Sonnet => Some(Self::Opus),
            Self::Opus => None,
        }
    }

    /// One tier down (opus -> sonnet -> haiku); haiku has no downgrade
    pub fn downgraded(self) -> Option<ModelTier> {
        match self {
            Self::Opus => Some(Self::Sonnet),
            Self::Sonnet => Some(Self::Haiku),
            Self::Haiku => None,
        }
    }

    /// Ballpark USD cost of one autonomous task on this tier, used for
    /// budget admission and as the fallback when the CLI reports no cost.
    pub fn average_task_cost_usd(self) -> f64 {
        match self {
            Self::Opus => 1.50,
            Self::Sonnet => 0.30,
            Self::Haiku => 0.05,
        }
    }
}

impl FromStr for ModelTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "opus" => Ok(Self::Opus),
            "sonnet" => Ok(Self::Sonnet),
            "haiku" => Ok(Self::Haiku),
            other => Err(format!("unknown model tier '{other}'")),
        }
    }
}

impl fmt::Display for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the operator asked for on the task itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestedModel {
    Auto,
    Fixed(ModelTier),
}

impl RequestedModel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Fixed(tier) => tier.as_str(),
        }
    }
}

impl FromStr for RequestedModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "auto" {
            Ok(Self::Auto)
        } else {
            ModelTier::from_str(s).map(Self::Fixed)
        }
    }
}

impl fmt::Display for RequestedModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of autonomous work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Monotonic id assigned by the store
    pub id: i64,
    pub title: String,
    pub description: Option<String>,
    pub source: TaskSource,
    /// Opaque dedup key; `(source, source_ref)` is unique when set
    pub source_ref: Option<String>,
    pub requested_model: RequestedModel,
    /// Deterministic score in [0, 100]
    pub priority: u8,
    pub status: TaskStatus,
    pub work_dir: PathBuf,
    /// Set while the task holds a work branch
    pub branch_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub actual_cost_usd: Option<f64>,
    pub result_summary: Option<String>,
    pub retry_count: u32,
}

impl Task {
    /// Branch the executor will create for this task
    pub fn branch_name_for(&self) -> String {
        format!("assistant/{}-{}", slugify(&self.title), self.id)
    }

    /// Title + description as a single prompt-friendly block
    pub fn prompt_body(&self) -> String {
        match &self.description {
            Some(desc) if !desc.trim().is_empty() => {
                format!("{}\n\n{}", self.title, desc)
            }
            _ => self.title.clone(),
        }
    }
}

/// Lowercase, alphanumeric-and-dash slug for branch names, capped at 40 chars
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut last_dash = true;
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
        if slug.len() >= 40 {
            break;
        }
    }
    let trimmed = slug.trim_end_matches('-');
    if trimmed.is_empty() {
        "task".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::AwaitingReview,
            TaskStatus::Merged,
            TaskStatus::Rejected,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_legal_transitions() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Failed));
        assert!(TaskStatus::Completed.can_transition_to(TaskStatus::AwaitingReview));
        assert!(TaskStatus::AwaitingReview.can_transition_to(TaskStatus::Merged));
        assert!(TaskStatus::AwaitingReview.can_transition_to(TaskStatus::Rejected));

        // The crash-recovery sweep is the only way back to pending
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Pending));

        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Completed));
        assert!(!TaskStatus::Failed.can_transition_to(TaskStatus::Running));
        assert!(!TaskStatus::Merged.can_transition_to(TaskStatus::Pending));
    }

    #[test]
    fn test_tier_ladder() {
        assert_eq!(ModelTier::Haiku.upgraded(), Some(ModelTier::Sonnet));
        assert_eq!(ModelTier::Sonnet.upgraded(), Some(ModelTier::Opus));
        assert_eq!(ModelTier::Opus.upgraded(), None);
        assert_eq!(ModelTier::Opus.downgraded(), Some(ModelTier::Sonnet));
        assert_eq!(ModelTier::Haiku.downgraded(), None);
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Fix login bug"), "fix-login-bug");
        assert_eq!(slugify("  Weird -- punctuation!! "), "weird-punctuation");
        assert_eq!(slugify("!!!"), "task");
        assert!(slugify("a very long title that keeps going and going and going").len() <= 40);
    }

    #[test]
    fn test_requested_model_parse() {
        assert_eq!("auto".parse::<RequestedModel>().unwrap(), RequestedModel::Auto);
        assert_eq!(
            "opus".parse::<RequestedModel>().unwrap(),
            RequestedModel::Fixed(ModelTier::Opus)
        );
        assert!("gpt".parse::<RequestedModel>().is_err());
    }
}
