//! Deterministic classification of core invocations.
//!
//! The markers parsed here are the compatibility surface with `mimic-core`:
//! changing their format on either side is a breaking change.

use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use regex::Regex;

use crate::core::types::{Outcome, SuccessReport};

/// Exit status reported for an attempt that hit its time limit
/// (the convention of coreutils `timeout`).
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Exit status the core uses when the task itself is malformed.
pub const FATAL_CONFIG_EXIT_CODE: i32 = 2;

static ANSI_ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;]*[A-Za-z]").expect("ansi regex"));
static ITERATIONS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Found in ([0-9]+) iteration").expect("iterations regex"));
static CORE_TIME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Time:\s*([0-9]+(?:\.[0-9]+)?)").expect("core time regex")
});
static LOOP_INDEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Loop index:\s*(-?[0-9]+)").expect("loop index regex"));

/// Classify an attempt by exit code and merged output.
///
/// - `0` is a success; the output must carry the iteration and time markers.
/// - [`TIMEOUT_EXIT_CODE`] is a timeout.
/// - [`FATAL_CONFIG_EXIT_CODE`] is a fatal configuration error.
/// - Anything else is a crash.
///
/// A success whose output cannot be parsed is an error, not a crash.
pub fn classify(exit_code: i32, output: &str, artifact_path: &Path) -> Result<Outcome> {
    match exit_code {
        0 => parse_success(output, artifact_path).map(Outcome::Success),
        TIMEOUT_EXIT_CODE => Ok(Outcome::Timeout),
        FATAL_CONFIG_EXIT_CODE => Ok(Outcome::FatalConfigError {
            raw_output: output.to_string(),
        }),
        code => Ok(Outcome::Crash {
            raw_output: output.to_string(),
            exit_code: code,
        }),
    }
}

fn parse_success(output: &str, artifact_path: &Path) -> Result<SuccessReport> {
    let clean = ANSI_ESCAPE.replace_all(output, "");

    let iterations = last_capture(&ITERATIONS, &clean)
        .ok_or_else(|| anyhow!("successful core run did not report 'Found in <n> iterations'"))?
        .parse::<u64>()
        .context("parse iteration count")?;
    let core_time_secs = last_capture(&CORE_TIME, &clean)
        .ok_or_else(|| anyhow!("successful core run did not report 'Time: <seconds>'"))?
        .parse::<f64>()
        .context("parse core time")?;
    let loop_index = match last_capture(&LOOP_INDEX, &clean) {
        Some(raw) => {
            let index: i64 = raw.parse().context("parse loop index")?;
            // Negative means the loop-free template was used.
            u32::try_from(index).ok()
        }
        None => None,
    };

    Ok(SuccessReport {
        artifact_path: artifact_path.to_path_buf(),
        iterations,
        core_time_secs,
        loop_index,
    })
}

fn last_capture<'a>(re: &Regex, haystack: &'a str) -> Option<&'a str> {
    re.captures_iter(haystack)
        .last()
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}
