//! Sandboxed task execution on a dedicated branch
//!
//! The executor owns the branch lifecycle from creation to hand-off:
//! verify the tree is clean, create `assistant/<slug>-<id>`, run the
//! Assistant CLI, and always restore the prior checkout on the way out.
//! Merging and deleting branches belongs to the review workflow, never here.

use crate::assistant::{AssistantCli, AssistantRun};
use crate::errors::{MagpieError, Result};
use crate::git::GitRepo;
use crate::store::Store;
use crate::task::{ModelTier, Task};
use tracing::{error, info, warn};

/// What a finished execution attempt looks like to the scheduler
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    /// CLI exited zero and produced a parseable result
    Success { summary: String, cost_usd: f64 },
    /// CLI failed after start; detail carries the stderr tail
    Failed { detail: String },
}

/// Restores the original checkout when dropped
///
/// Scoped around the CLI invocation so every exit path (success, failure,
/// panic unwinding through the scheduler) puts the operator's branch back.
struct BranchGuard<'a> {
    git: &'a GitRepo,
    original: String,
}

impl Drop for BranchGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.git.switch(&self.original) {
            error!(
                branch = %self.original,
                "Failed to restore original checkout: {e}"
            );
        }
    }
}

pub struct Executor;

impl Executor {
    /// Run one claimed task to completion
    ///
    /// Errors returned here mean the run never started (dirty tree, missing
    /// tools); the scheduler returns the task to pending. A started run
    /// always resolves to an [`ExecutionOutcome`].
    pub async fn execute(
        store: &Store,
        assistant: &AssistantCli,
        task: &Task,
        tier: ModelTier,
    ) -> Result<ExecutionOutcome> {
        let git = GitRepo::open(&task.work_dir)?;
        if !git.is_clean()? {
            return Err(MagpieError::DirtyWorkingTree(
                task.work_dir.display().to_string(),
            ));
        }

        let original = git.current_branch()?;
        let branch = task.branch_name_for();
        git.create_and_switch(&branch)?;
        store.set_task_branch(task.id, &branch)?;
        let _guard = BranchGuard {
            git: &git,
            original,
        };

        info!(task = task.id, branch = %branch, model = %tier, "Executing task");
        match assistant
            .run_task(&task.work_dir, tier, &task.prompt_body())
            .await
        {
            Ok(AssistantRun { summary, cost_usd }) => {
                let cost = cost_usd.unwrap_or_else(|| {
                    warn!(task = task.id, "No cost reported, using tier average");
                    tier.average_task_cost_usd()
                });
                Ok(ExecutionOutcome::Success {
                    summary,
                    cost_usd: cost,
                })
            }
            Err(MagpieError::TaskExecutionFailure(detail)) => {
                warn!(task = task.id, "Task execution failed: {detail}");
                Ok(ExecutionOutcome::Failed { detail })
            }
            // Tooling vanished mid-run; surface it instead of failing the task
            Err(other) => Err(other),
        }
    }
}
