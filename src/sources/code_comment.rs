//! Code-comment task source
//!
//! Greps tracked files (the git index, per `git ls-files`) and turns every
//! TODO/FIXME/HACK/XXX marker into a candidate keyed by `<path>:<line>`.
//! Scanning a directory that is not a repository falls back to a git-aware
//! walk of what is on disk. Binary files are skipped; the marker's own text
//! becomes the title, truncated to 120 characters.

use super::{Candidate, ScanContext, TaskScanner};
use crate::errors::Result;
use crate::git::GitRepo;
use crate::task::TaskSource;
use ignore::WalkBuilder;
use std::path::Path;
use tracing::{debug, trace};

const MARKERS: [&str; 4] = ["TODO", "FIXME", "HACK", "XXX"];
const MAX_TITLE_CHARS: usize = 120;

pub struct CodeCommentScanner;

impl TaskScanner for CodeCommentScanner {
    fn name(&self) -> &'static str {
        "code_comment"
    }

    fn scan(&self, _ctx: &ScanContext<'_>, work_dir: &Path) -> Result<Vec<Candidate>> {
        let mut candidates = Vec::new();

        match GitRepo::open(work_dir) {
            Ok(git) => {
                for rel in git.tracked_files()? {
                    scan_file(work_dir, &rel, &mut candidates);
                }
            }
            Err(_) => {
                debug!(
                    work_dir = %work_dir.display(),
                    "Not a repository, scanning the directory contents instead"
                );
                for entry in WalkBuilder::new(work_dir).hidden(true).build() {
                    let Ok(entry) = entry else { continue };
                    if !entry.file_type().is_some_and(|ft| ft.is_file()) {
                        continue;
                    }
                    let rel = entry
                        .path()
                        .strip_prefix(work_dir)
                        .unwrap_or(entry.path())
                        .to_string_lossy()
                        .to_string();
                    scan_file(work_dir, &rel, &mut candidates);
                }
            }
        }

        Ok(candidates)
    }
}

/// Collect marker candidates from one file, path relative to `work_dir`
fn scan_file(work_dir: &Path, rel: &str, out: &mut Vec<Candidate>) {
    // Non-UTF-8 content is treated as binary and skipped
    let Ok(content) = std::fs::read_to_string(work_dir.join(rel)) else {
        return;
    };

    for (idx, line) in content.lines().enumerate() {
        let Some(marker_pos) = find_marker(line) else {
            continue;
        };
        let text: String = line[marker_pos..]
            .trim()
            .chars()
            .take(MAX_TITLE_CHARS)
            .collect();
        let source_ref = format!("{rel}:{}", idx + 1);
        trace!(source_ref = %source_ref, "Found comment marker");
        out.push(Candidate {
            title: text,
            description: None,
            source: TaskSource::CodeComment,
            source_ref,
        });
    }
}

/// Byte offset of the first marker in the line, if any
fn find_marker(line: &str) -> Option<usize> {
    MARKERS
        .iter()
        .filter_map(|marker| line.find(marker))
        .min()
}
