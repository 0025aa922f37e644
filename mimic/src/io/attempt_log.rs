//! Optional per-attempt logs (`--log-dir`).

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::core::types::{AttemptId, OutcomeKind};

/// Metadata header of an attempt log.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptMeta {
    pub phase: u32,
    pub worker: usize,
    pub timeout_secs: u64,
    pub exit_code: i32,
    pub timed_out: bool,
    /// Killed because another attempt already decided the run.
    pub cancelled: bool,
    pub outcome: Option<OutcomeKind>,
    pub elapsed_ms: u64,
}

pub fn attempt_log_path(dir: &Path, attempt: AttemptId) -> PathBuf {
    dir.join(format!(
        "phase-{}-worker-{}.log",
        attempt.phase, attempt.worker
    ))
}

/// Write one attempt's log: JSON metadata, the command line, then the output.
pub fn write_attempt_log(
    dir: &Path,
    meta: &AttemptMeta,
    command_line: &str,
    output: &str,
) -> Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("create log dir {}", dir.display()))?;
    let path = attempt_log_path(
        dir,
        AttemptId {
            phase: meta.phase,
            worker: meta.worker,
        },
    );

    let mut buf = serde_json::to_string_pretty(meta).context("serialize attempt meta")?;
    buf.push_str("\n=== command ===\n");
    buf.push_str(command_line);
    buf.push_str("\n=== output ===\n");
    buf.push_str(output);
    if !output.ends_with('\n') {
        buf.push('\n');
    }

    fs::write(&path, buf).with_context(|| format!("write attempt log {}", path.display()))?;
    Ok(path)
}
