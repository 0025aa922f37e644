//! Human-readable and JSON summaries of a finished run.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::controller::{AbortReason, RunResult, RunStop, RunTotals};
use crate::core::types::{AttemptId, SuccessReport};

/// Serialized form of a [`RunStop`] (`--summary-json`).
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunSummary<'a> {
    Succeeded {
        elapsed_secs: f64,
        total_attempts: u64,
        total_crashes: u64,
        total_timeouts: u64,
        winner: AttemptId,
        winner_timeout_secs: u64,
        success: &'a SuccessReport,
    },
    Aborted {
        reason: AbortReason,
        diagnostic: &'a str,
        #[serde(flatten)]
        totals: RunTotals,
    },
    PhaseLimitReached {
        #[serde(flatten)]
        totals: RunTotals,
    },
}

impl<'a> RunSummary<'a> {
    pub fn from_stop(stop: &'a RunStop) -> Self {
        match stop {
            RunStop::Succeeded(result) => RunSummary::Succeeded {
                elapsed_secs: result.elapsed.as_secs_f64(),
                total_attempts: result.total_attempts,
                total_crashes: result.total_crashes,
                total_timeouts: result.total_timeouts,
                winner: result.winner,
                winner_timeout_secs: result.winner_timeout_secs,
                success: &result.success,
            },
            RunStop::Aborted {
                reason,
                diagnostic,
                totals,
            } => RunSummary::Aborted {
                reason: *reason,
                diagnostic,
                totals: *totals,
            },
            RunStop::PhaseLimitReached { totals } => {
                RunSummary::PhaseLimitReached { totals: *totals }
            }
        }
    }
}

/// Write the run summary as pretty JSON with a trailing newline.
pub fn write_summary_json(path: &Path, stop: &RunStop) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let mut buf =
        serde_json::to_string_pretty(&RunSummary::from_stop(stop)).context("serialize summary")?;
    buf.push('\n');
    fs::write(path, buf).with_context(|| format!("write {}", path.display()))
}

/// Statistics block printed after a successful run.
pub fn render_success(result: &RunResult, indent: &str) -> String {
    let mut lines = vec![
        format!(
            "{indent}Time required:                              {:.2} seconds",
            result.elapsed.as_secs_f64()
        ),
        format!(
            "{indent}Attempted searches:                         {}",
            result.total_attempts
        ),
        format!("{indent}Successful searches:                        1"),
        format!(
            "{indent}Attempted searches that ended in a timeout: {}",
            result.total_timeouts
        ),
        format!(
            "{indent}Attempted searches that crashed:            {}",
            result.total_crashes
        ),
        format!(
            "{indent}Search iteration of the successful search:  {}",
            result.success.iterations
        ),
        format!(
            "{indent}Search time of the successful search:       {:.2} seconds",
            result.success.core_time_secs
        ),
    ];
    lines.push(match result.success.loop_index {
        Some(index) => format!("{indent}Using loop template with index {index}"),
        None => format!("{indent}Using a loop-free template"),
    });
    lines.join("\n")
}

/// Explanation printed when a run aborts.
pub fn render_abort(reason: AbortReason, diagnostic: &str, totals: &RunTotals) -> String {
    let headline = match reason {
        AbortReason::FatalConfig => "Error in mimic-core:".to_string(),
        AbortReason::CircuitBreaker => format!(
            "Found too many errors ({} of {} attempts crashed). Output from mimic-core:",
            totals.total_crashes, totals.total_attempts
        ),
    };
    format!("{headline}\n{}", diagnostic.trim_end())
}
