//! Task intake from the repository and the template table
//!
//! Each source implements [`TaskScanner`] and yields candidates keyed by
//! `(source, source_ref)`; the store's unique index makes repeated scans
//! idempotent. Manual tasks skip this path entirely and are created through
//! the store with a null `source_ref`.

mod auto_template;
mod code_comment;
mod queue_file;

pub use auto_template::{template_table, AutoTemplateScanner, TemplateSpec};
pub use code_comment::CodeCommentScanner;
pub use queue_file::QueueFileScanner;

use crate::config::Config;
use crate::errors::Result;
use crate::priority;
use crate::store::{NewTask, Store};
use crate::task::{RequestedModel, TaskSource};
use chrono::{DateTime, Utc};
use std::path::Path;
use tracing::{debug, info};

/// A task a scanner proposes before dedup and scoring
#[derive(Debug, Clone)]
pub struct Candidate {
    pub title: String,
    pub description: Option<String>,
    pub source: TaskSource,
    pub source_ref: String,
}

/// Shared context handed to every scanner
pub struct ScanContext<'a> {
    pub store: &'a Store,
    pub config: &'a Config,
    pub now: DateTime<Utc>,
}

/// One pluggable task source; registered at startup, not hot-pluggable
pub trait TaskScanner: Send {
    fn name(&self) -> &'static str;
    fn scan(&self, ctx: &ScanContext<'_>, work_dir: &Path) -> Result<Vec<Candidate>>;
}

/// Outcome of one aggregation pass
#[derive(Debug, Default, Clone, Copy)]
pub struct ScanReport {
    pub created: usize,
    pub skipped: usize,
}

/// Runs all registered scanners and inserts fresh candidates
pub struct Aggregator {
    scanners: Vec<Box<dyn TaskScanner>>,
}

impl Aggregator {
    /// The standard source set: code comments, queue file, and (when
    /// enabled) the auto-template table
    pub fn standard(config: &Config) -> Self {
        let mut scanners: Vec<Box<dyn TaskScanner>> = vec![
            Box::new(CodeCommentScanner),
            Box::new(QueueFileScanner),
        ];
        if config.auto_tasks.enabled {
            scanners.push(Box::new(AutoTemplateScanner));
        }
        Self { scanners }
    }

    #[cfg(test)]
    pub fn with_scanners(scanners: Vec<Box<dyn TaskScanner>>) -> Self {
        Self { scanners }
    }

    /// Scan `work_dir` with every source and insert what is new
    pub fn scan(&self, ctx: &ScanContext<'_>, work_dir: &Path) -> Result<ScanReport> {
        let mut report = ScanReport::default();
        for scanner in &self.scanners {
            let candidates = scanner.scan(ctx, work_dir)?;
            debug!(
                scanner = scanner.name(),
                candidates = candidates.len(),
                "Scanner finished"
            );
            for candidate in candidates {
                if ctx
                    .store
                    .has_task_with_source_ref(candidate.source, &candidate.source_ref)?
                {
                    report.skipped += 1;
                    continue;
                }
                let new = NewTask {
                    priority: priority::score(
                        candidate.source,
                        &candidate.title,
                        candidate.description.as_deref(),
                    ),
                    title: candidate.title,
                    description: candidate.description,
                    source: candidate.source,
                    source_ref: Some(candidate.source_ref),
                    requested_model: RequestedModel::Auto,
                    work_dir: work_dir.to_path_buf(),
                };
                match ctx.store.create_task(&new)? {
                    Some(_) => report.created += 1,
                    None => report.skipped += 1,
                }
            }
        }
        info!(
            created = report.created,
            skipped = report.skipped,
            "Task scan complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::TaskFilter;

    struct FixedScanner(Vec<Candidate>);

    impl TaskScanner for FixedScanner {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn scan(&self, _ctx: &ScanContext<'_>, _work_dir: &Path) -> Result<Vec<Candidate>> {
            Ok(self.0.clone())
        }
    }

    fn candidate(title: &str, source_ref: &str) -> Candidate {
        Candidate {
            title: title.to_string(),
            description: None,
            source: TaskSource::CodeComment,
            source_ref: source_ref.to_string(),
        }
    }

    #[test]
    fn test_scan_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let config = Config::default();
        let ctx = ScanContext {
            store: &store,
            config: &config,
            now: Utc::now(),
        };

        let aggregator = Aggregator::with_scanners(vec![Box::new(FixedScanner(vec![
            candidate("TODO: one", "a.rs:1"),
            candidate("TODO: two", "a.rs:2"),
        ]))]);

        let first = aggregator.scan(&ctx, Path::new(".")).unwrap();
        assert_eq!(first.created, 2);
        assert_eq!(first.skipped, 0);

        let second = aggregator.scan(&ctx, Path::new(".")).unwrap();
        assert_eq!(second.created, 0);
        assert_eq!(second.skipped, 2);

        assert_eq!(store.list_tasks(TaskFilter::default()).unwrap().len(), 2);
    }

    #[test]
    fn test_candidates_are_scored() {
        let store = Store::open_in_memory().unwrap();
        let config = Config::default();
        let ctx = ScanContext {
            store: &store,
            config: &config,
            now: Utc::now(),
        };

        let aggregator = Aggregator::with_scanners(vec![Box::new(FixedScanner(vec![
            candidate("FIXME: security hole in auth", "auth.rs:9"),
        ]))]);
        aggregator.scan(&ctx, Path::new(".")).unwrap();

        let tasks = store.list_tasks(TaskFilter::default()).unwrap();
        assert_eq!(
            tasks[0].priority,
            priority::score(
                TaskSource::CodeComment,
                "FIXME: security hole in auth",
                None
            )
        );
    }
}
