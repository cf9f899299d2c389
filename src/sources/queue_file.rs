//! Queue-file task source
//!
//! Reads `.wise-magpie-tasks` or `wise-magpie-tasks.md` at the repository
//! root. Markdown-style checkboxes, one task per line: `- [ ] title` is
//! intake, `- [x]` is done and ignored.

use super::{Candidate, ScanContext, TaskScanner};
use crate::errors::Result;
use crate::task::TaskSource;
use std::path::Path;
use tracing::debug;

const QUEUE_FILE_NAMES: [&str; 2] = [".wise-magpie-tasks", "wise-magpie-tasks.md"];

const OPEN_PREFIX: &str = "- [ ] ";
const DONE_PREFIXES: [&str; 2] = ["- [x] ", "- [X] "];

pub struct QueueFileScanner;

impl TaskScanner for QueueFileScanner {
    fn name(&self) -> &'static str {
        "queue_file"
    }

    fn scan(&self, _ctx: &ScanContext<'_>, work_dir: &Path) -> Result<Vec<Candidate>> {
        let mut candidates = Vec::new();

        for name in QUEUE_FILE_NAMES {
            let path = work_dir.join(name);
            if !path.exists() {
                continue;
            }
            let content = std::fs::read_to_string(&path)?;
            debug!(file = name, "Parsing queue file");

            for (idx, line) in content.lines().enumerate() {
                let trimmed = line.trim_start();
                if DONE_PREFIXES.iter().any(|p| trimmed.starts_with(p)) {
                    continue;
                }
                let Some(title) = trimmed.strip_prefix(OPEN_PREFIX) else {
                    continue;
                };
                let title = title.trim();
                if title.is_empty() {
                    continue;
                }
                candidates.push(Candidate {
                    title: title.to_string(),
                    description: None,
                    source: TaskSource::QueueFile,
                    source_ref: format!("{name}:{}", idx + 1),
                });
            }
        }

        Ok(candidates)
    }
}
