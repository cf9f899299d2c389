//! Assistant CLI subprocess invocation
//!
//! One task = one non-interactive invocation: prompt on the command line,
//! selected model id, JSON output so the result summary and cost can be
//! captured. The binary is configurable; a missing binary surfaces as
//! `AssistantNotFound` (exit 3) instead of a task failure.

use crate::config::AssistantConfig;
use crate::errors::{MagpieError, Result};
use crate::task::ModelTier;
use serde::Deserialize;
use std::path::Path;
use tracing::{debug, info};

/// Keep at most this much stderr when a run fails
const STDERR_TAIL_BYTES: usize = 4 * 1024;

/// Hard cap on one task run; bounds shutdown latency too
const TASK_TIMEOUT_SECS: u64 = 30 * 60;

/// Parsed result of a successful run
#[derive(Debug, Clone)]
pub struct AssistantRun {
    pub summary: String,
    pub cost_usd: Option<f64>,
}

/// JSON body the CLI prints with `--output-format json`
#[derive(Debug, Deserialize)]
struct CliOutput {
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    total_cost_usd: Option<f64>,
}

pub struct AssistantCli {
    binary: String,
    extra_flags: Vec<String>,
}

impl AssistantCli {
    pub fn new(config: &AssistantConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            extra_flags: config.extra_flags.clone(),
        }
    }

    /// Cheap availability probe used by `start` and `status`
    pub fn check_available(&self) -> Result<()> {
        match std::process::Command::new(&self.binary)
            .arg("--version")
            .output()
        {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(MagpieError::AssistantNotFound(self.binary.clone()))
            }
            Err(e) => Err(MagpieError::Io(e)),
        }
    }

    /// Run one task prompt to completion and parse the result
    ///
    /// Non-zero exit or unparseable output is a `TaskExecutionFailure`
    /// carrying the stderr tail; the caller decides what happens to the task.
    pub async fn run_task(
        &self,
        work_dir: &Path,
        model: ModelTier,
        prompt: &str,
    ) -> Result<AssistantRun> {
        let mut cmd = tokio::process::Command::new(&self.binary);
        cmd.current_dir(work_dir)
            .arg("-p")
            .arg(prompt)
            .arg("--model")
            .arg(model.as_str())
            .arg("--output-format")
            .arg("json")
            .args(&self.extra_flags);

        info!(model = %model, work_dir = %work_dir.display(), "Invoking assistant");
        let waited = tokio::time::timeout(
            std::time::Duration::from_secs(TASK_TIMEOUT_SECS),
            cmd.output(),
        )
        .await
        .map_err(|_| {
            MagpieError::TaskExecutionFailure(format!(
                "assistant did not finish within {} minutes",
                TASK_TIMEOUT_SECS / 60
            ))
        })?;
        let output = waited.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                MagpieError::AssistantNotFound(self.binary.clone())
            } else {
                MagpieError::Io(e)
            }
        })?;

        if !output.status.success() {
            let tail = tail_lossy(&output.stderr, STDERR_TAIL_BYTES);
            return Err(MagpieError::TaskExecutionFailure(format!(
                "assistant exited with {}: {tail}",
                output.status
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let parsed: CliOutput = serde_json::from_str(stdout.trim()).map_err(|_| {
            MagpieError::TaskExecutionFailure(format!(
                "unparseable assistant output: {}",
                tail_lossy(output.stdout.as_slice(), 512)
            ))
        })?;

        debug!(cost = ?parsed.total_cost_usd, "Assistant run finished");
        Ok(AssistantRun {
            summary: parsed
                .result
                .unwrap_or_else(|| "(no result text)".to_string()),
            cost_usd: parsed.total_cost_usd,
        })
    }
}

/// Last `max` bytes as lossy UTF-8, trimmed
fn tail_lossy(bytes: &[u8], max: usize) -> String {
    let start = bytes.len().saturating_sub(max);
    String::from_utf8_lossy(&bytes[start..]).trim().to_string()
}
