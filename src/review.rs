//! Review workflow: the operator decides what happens to finished branches
//!
//! The executor leaves every successful task on its own `assistant/` branch
//! in `awaiting_review`. Approval merges the branch into the base branch and
//! deletes it; rejection just deletes it. Responding spawns a follow-up task
//! carrying the operator's feedback, since finished runs are not resumable.

use crate::errors::{MagpieError, Result};
use crate::git::GitRepo;
use crate::priority;
use crate::store::{NewTask, Store, TaskFilter};
use crate::task::{RequestedModel, Task, TaskSource, TaskStatus};
use tracing::info;

/// Tasks waiting for an operator decision
pub fn list(store: &Store) -> Result<Vec<Task>> {
    store.list_tasks(TaskFilter {
        status: Some(TaskStatus::AwaitingReview),
        limit: None,
    })
}

fn reviewable(store: &Store, id: i64) -> Result<Task> {
    let task = store
        .get_task(id)?
        .ok_or_else(|| MagpieError::Config(format!("no such task: {id}")))?;
    if task.status != TaskStatus::AwaitingReview {
        return Err(MagpieError::Config(format!(
            "task {id} is {}, not awaiting review",
            task.status
        )));
    }
    Ok(task)
}

/// Merge an approved branch into the base branch and delete it
pub fn approve(store: &Store, id: i64) -> Result<Task> {
    let task = reviewable(store, id)?;
    let branch = task
        .branch_name
        .clone()
        .ok_or_else(|| MagpieError::Config(format!("task {id} has no work branch")))?;

    let git = GitRepo::open(&task.work_dir)?;
    if !git.is_clean()? {
        return Err(MagpieError::DirtyWorkingTree(
            task.work_dir.display().to_string(),
        ));
    }

    git.merge_into_base(&branch)?;
    git.delete_branch(&branch)?;
    store.update_task_status(id, TaskStatus::Merged)?;
    info!(id, branch = %branch, "Approved and merged");
    store
        .get_task(id)?
        .ok_or_else(|| MagpieError::Config(format!("task {id} vanished during approve")))
}

/// Discard a reviewed branch without merging
pub fn reject(store: &Store, id: i64) -> Result<Task> {
    let task = reviewable(store, id)?;

    if let Some(branch) = &task.branch_name {
        let git = GitRepo::open(&task.work_dir)?;
        if git.branch_exists(branch)? {
            // Make sure we are not deleting the branch out from under HEAD
            if git.current_branch()? == *branch {
                let base = git.default_base_branch()?;
                git.switch(&base)?;
            }
            git.delete_branch(branch)?;
        }
    }

    store.update_task_status(id, TaskStatus::Rejected)?;
    info!(id, "Rejected");
    store
        .get_task(id)?
        .ok_or_else(|| MagpieError::Config(format!("task {id} vanished during reject")))
}

/// Queue a follow-up task carrying operator feedback
///
/// The reviewed task itself stays `awaiting_review`; runs are not resumable,
/// so the feedback becomes a fresh unit of work referencing the old result.
pub fn respond(store: &Store, id: i64, feedback: &str) -> Result<Task> {
    let task = reviewable(store, id)?;

    let mut description = format!("Operator feedback on task #{id} ({}):\n{feedback}", task.title);
    if let Some(summary) = &task.result_summary {
        description.push_str("\n\nPrevious result:\n");
        description.push_str(summary);
    }

    let title = format!("Follow-up: {}", task.title);
    let new = NewTask {
        priority: priority::score(TaskSource::Manual, &title, Some(&description)),
        title,
        description: Some(description),
        source: TaskSource::Manual,
        source_ref: None,
        requested_model: task.requested_model,
        work_dir: task.work_dir.clone(),
    };
    let followup = store.create_task(&new)?.ok_or_else(|| {
        MagpieError::Config("follow-up task unexpectedly deduplicated".to_string())
    })?;
    info!(id, followup = followup.id, "Queued follow-up from review feedback");
    Ok(followup)
}
