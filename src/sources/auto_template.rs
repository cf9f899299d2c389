//! Auto-template task source
//!
//! A static table of recurring maintenance tasks, each guarded by a
//! six-check gate: template enabled, interval elapsed since last completion,
//! enough commits on the current branch, fresh commits / code changes in the
//! interval window where required, and no task generated today. The dedup
//! key is `<task_type>:<YYYY-MM-DD>` in the local date, so each template
//! fires at most once per calendar day.

use super::{Candidate, ScanContext, TaskScanner};
use crate::errors::Result;
use crate::git::GitRepo;
use crate::policy::Difficulty;
use crate::task::TaskSource;
use chrono::{Duration, Local};
use std::path::Path;
use tracing::{debug, warn};

/// One row of the built-in template table
#[derive(Debug, Clone, Copy)]
pub struct TemplateSpec {
    pub task_type: &'static str,
    pub title: &'static str,
    pub description: &'static str,
    pub interval_hours: u32,
    pub min_commits: u32,
    pub needs_new_commits: bool,
    pub needs_code_changes: bool,
    /// Intended difficulty; the wording above is chosen so the keyword
    /// classifier reproduces it (see the alignment test below)
    pub difficulty: Difficulty,
}

static TEMPLATES: [TemplateSpec; 11] = [
    TemplateSpec {
        task_type: "run_tests",
        title: "Run the test suite",
        description: "Run the project's test suite and clean up any failures you find.",
        interval_hours: 24,
        min_commits: 0,
        needs_new_commits: true,
        needs_code_changes: false,
        difficulty: Difficulty::Simple,
    },
    TemplateSpec {
        task_type: "update_docs",
        title: "Update project docs",
        description: "Refresh the docs to match recent code changes.",
        interval_hours: 48,
        min_commits: 0,
        needs_new_commits: false,
        needs_code_changes: true,
        difficulty: Difficulty::Simple,
    },
    TemplateSpec {
        task_type: "lint_check",
        title: "Run lint checks",
        description: "Run the linters and fix any new lint warnings.",
        interval_hours: 12,
        min_commits: 0,
        needs_new_commits: false,
        needs_code_changes: true,
        difficulty: Difficulty::Simple,
    },
    TemplateSpec {
        task_type: "clean_commits",
        title: "Organize the branch commit history",
        description: "Squash and reorder work-in-progress commits into a reviewable history.",
        interval_hours: 24,
        min_commits: 10,
        needs_new_commits: false,
        needs_code_changes: false,
        difficulty: Difficulty::Medium,
    },
    TemplateSpec {
        task_type: "dependency_check",
        title: "Check dependencies for updates",
        description: "Review dependency versions and apply safe upgrades.",
        interval_hours: 168,
        min_commits: 0,
        needs_new_commits: false,
        needs_code_changes: false,
        difficulty: Difficulty::Medium,
    },
    TemplateSpec {
        task_type: "security_audit",
        title: "Audit recent changes for security issues",
        description: "Review recently changed code for security vulnerabilities.",
        interval_hours: 168,
        min_commits: 0,
        needs_new_commits: false,
        needs_code_changes: true,
        difficulty: Difficulty::Complex,
    },
    TemplateSpec {
        task_type: "test_coverage",
        title: "Improve test coverage",
        description: "Add tests for recently changed code paths that lack coverage.",
        interval_hours: 48,
        min_commits: 0,
        needs_new_commits: false,
        needs_code_changes: true,
        difficulty: Difficulty::Medium,
    },
    TemplateSpec {
        task_type: "dead_code_detection",
        title: "Remove dead code",
        description: "Find and delete dead code left behind by recent changes.",
        interval_hours: 168,
        min_commits: 0,
        needs_new_commits: false,
        needs_code_changes: true,
        difficulty: Difficulty::Simple,
    },
    TemplateSpec {
        task_type: "changelog_generation",
        title: "Update the changelog",
        description: "Summarize recent commits into changelog entries.",
        interval_hours: 24,
        min_commits: 5,
        needs_new_commits: false,
        needs_code_changes: false,
        difficulty: Difficulty::Simple,
    },
    TemplateSpec {
        task_type: "deprecation_cleanup",
        title: "Migrate off deprecated APIs",
        description: "Plan the migration away from deprecated APIs and apply it incrementally.",
        interval_hours: 336,
        min_commits: 0,
        needs_new_commits: false,
        needs_code_changes: true,
        difficulty: Difficulty::Complex,
    },
    TemplateSpec {
        task_type: "type_coverage",
        title: "Strengthen type coverage",
        description: "Add missing type annotations in weakly typed areas.",
        interval_hours: 168,
        min_commits: 0,
        needs_new_commits: false,
        needs_code_changes: true,
        difficulty: Difficulty::Medium,
    },
];

pub fn template_table() -> &'static [TemplateSpec] {
    &TEMPLATES
}

pub struct AutoTemplateScanner;

impl TaskScanner for AutoTemplateScanner {
    fn name(&self) -> &'static str {
        "auto_template"
    }

    fn scan(&self, ctx: &ScanContext<'_>, work_dir: &Path) -> Result<Vec<Candidate>> {
        let git = match GitRepo::open(work_dir) {
            Ok(git) => Some(git),
            Err(e) => {
                warn!("Auto-templates without a git repo, commit gates will not pass: {e}");
                None
            }
        };
        let today = ctx.now.with_timezone(&Local).format("%Y-%m-%d").to_string();
        let mut candidates = Vec::new();

        for spec in template_table() {
            let overrides = ctx.config.auto_tasks.override_for(spec.task_type);
            let enabled = overrides.and_then(|o| o.enabled).unwrap_or(true);
            let interval_hours = overrides
                .and_then(|o| o.interval_hours)
                .unwrap_or(spec.interval_hours);
            let min_commits = overrides
                .and_then(|o| o.min_commits)
                .unwrap_or(spec.min_commits);

            // (i) template enabled
            if !enabled {
                continue;
            }

            // (ii) interval since last completion
            if let Some(last) = ctx.store.last_template_run(spec.task_type)? {
                if ctx.now - last < Duration::hours(i64::from(interval_hours)) {
                    debug!(template = spec.task_type, "Interval not elapsed");
                    continue;
                }
            }

            // (iii) enough commits on the current branch since its fork point
            if min_commits > 0 {
                let commits = git
                    .as_ref()
                    .and_then(|g| g.commits_since_fork().ok())
                    .unwrap_or(0);
                if commits < min_commits {
                    continue;
                }
            }

            let window_start = ctx.now - Duration::hours(i64::from(interval_hours));

            // (iv) at least one commit inside the interval window
            if spec.needs_new_commits {
                let fresh = git
                    .as_ref()
                    .and_then(|g| g.commits_since(window_start).ok())
                    .unwrap_or(0);
                if fresh == 0 {
                    continue;
                }
            }

            // (v) at least one added/modified/renamed file inside the window
            if spec.needs_code_changes {
                let changed = git
                    .as_ref()
                    .and_then(|g| g.changed_files_since(window_start).ok())
                    .unwrap_or_default();
                if changed.is_empty() {
                    continue;
                }
            }

            // (vi) nothing generated for this template today
            let source_ref = format!("{}:{}", spec.task_type, today);
            if ctx
                .store
                .has_task_with_source_ref(TaskSource::AutoTemplate, &source_ref)?
            {
                continue;
            }

            candidates.push(Candidate {
                title: spec.title.to_string(),
                description: Some(spec.description.to_string()),
                source: TaskSource::AutoTemplate,
                source_ref,
            });
        }

        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, TemplateOverride};
    use crate::policy::classify;
    use crate::store::Store;
    use chrono::Utc;
    use std::process::Command;
    use tempfile::TempDir;

    fn run(repo: &Path, args: &[&str]) {
        let out = Command::new("git").current_dir(repo).args(args).output().unwrap();
        assert!(out.status.success(), "git {args:?} failed");
    }

    fn setup_repo() -> TempDir {
        let tmp = TempDir::new().unwrap();
        run(tmp.path(), &["init", "-b", "main"]);
        run(tmp.path(), &["config", "user.email", "test@test.com"]);
        run(tmp.path(), &["config", "user.name", "Test User"]);
        std::fs::write(tmp.path().join("README.md"), "# Test").unwrap();
        run(tmp.path(), &["add", "."]);
        run(tmp.path(), &["commit", "-m", "init"]);
        tmp
    }

    fn scan_with(config: &Config, store: &Store, dir: &Path) -> Vec<Candidate> {
        let ctx = ScanContext {
            store,
            config,
            now: Utc::now(),
        };
        AutoTemplateScanner.scan(&ctx, dir).unwrap()
    }

    fn types(candidates: &[Candidate]) -> Vec<&str> {
        candidates
            .iter()
            .map(|c| c.source_ref.split(':').next().unwrap())
            .collect()
    }

    #[test]
    fn test_table_difficulty_matches_classifier() {
        for spec in template_table() {
            assert_eq!(
                classify(spec.title, Some(spec.description)),
                spec.difficulty,
                "classifier disagrees with table for {}",
                spec.task_type
            );
        }
    }

    #[test]
    fn test_fresh_repo_fires_change_gated_templates() {
        let tmp = setup_repo();
        let store = Store::open_in_memory().unwrap();
        let config = Config::default();

        let found = scan_with(&config, &store, tmp.path());
        let found_types = types(&found);

        // The initial commit is inside every interval window
        assert!(found_types.contains(&"run_tests"));
        assert!(found_types.contains(&"lint_check"));
        // Commit-count templates need a long feature branch
        assert!(!found_types.contains(&"clean_commits"));
        assert!(!found_types.contains(&"changelog_generation"));
    }

    #[test]
    fn test_disabled_override_skips_template() {
        let tmp = setup_repo();
        let store = Store::open_in_memory().unwrap();
        let mut config = Config::default();
        config.auto_tasks.templates.insert(
            "run_tests".to_string(),
            TemplateOverride {
                enabled: Some(false),
                ..TemplateOverride::default()
            },
        );

        let found = scan_with(&config, &store, tmp.path());
        assert!(!types(&found).contains(&"run_tests"));
    }

    #[test]
    fn test_recent_completion_blocks_until_interval() {
        let tmp = setup_repo();
        let store = Store::open_in_memory().unwrap();
        let config = Config::default();

        store.record_template_run("run_tests", Utc::now()).unwrap();
        let found = scan_with(&config, &store, tmp.path());
        assert!(!types(&found).contains(&"run_tests"));

        // A completion outside the interval no longer blocks
        store
            .record_template_run("run_tests", Utc::now() - Duration::hours(25))
            .unwrap();
        let found = scan_with(&config, &store, tmp.path());
        assert!(types(&found).contains(&"run_tests"));
    }

    #[test]
    fn test_existing_task_today_blocks() {
        let tmp = setup_repo();
        let store = Store::open_in_memory().unwrap();
        let config = Config::default();

        let first = scan_with(&config, &store, tmp.path());
        assert!(types(&first).contains(&"run_tests"));

        // Materialize today's candidate, then rescan
        let ctx = ScanContext {
            store: &store,
            config: &config,
            now: Utc::now(),
        };
        let aggregator = super::super::Aggregator::with_scanners(vec![Box::new(
            AutoTemplateScanner,
        )]);
        aggregator.scan(&ctx, tmp.path()).unwrap();

        let second = scan_with(&config, &store, tmp.path());
        assert!(!types(&second).contains(&"run_tests"));
    }

    #[test]
    fn test_min_commits_gate() {
        let tmp = setup_repo();
        let store = Store::open_in_memory().unwrap();
        let config = Config::default();

        run(tmp.path(), &["checkout", "-b", "feature"]);
        for i in 0..10 {
            std::fs::write(tmp.path().join(format!("f{i}.txt")), "x").unwrap();
            run(tmp.path(), &["add", "."]);
            run(tmp.path(), &["commit", "-m", "work"]);
        }

        let found = scan_with(&config, &store, tmp.path());
        let found_types = types(&found);
        assert!(found_types.contains(&"clean_commits"));
        assert!(found_types.contains(&"changelog_generation"));
    }

    #[test]
    fn test_interval_override_applies() {
        let tmp = setup_repo();
        let store = Store::open_in_memory().unwrap();
        let mut config = Config::default();
        config.auto_tasks.templates.insert(
            "run_tests".to_string(),
            TemplateOverride {
                interval_hours: Some(48),
                ..TemplateOverride::default()
            },
        );

        // Completed 25h ago: past the default 24h but inside the 48h override
        store
            .record_template_run("run_tests", Utc::now() - Duration::hours(25))
            .unwrap();
        let found = scan_with(&config, &store, tmp.path());
        assert!(!types(&found).contains(&"run_tests"));
    }
}
