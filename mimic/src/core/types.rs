//! Shared deterministic types for the search orchestrator.
//!
//! These types define stable contracts between the controller, the worker
//! pool and the invocation adapter. They carry no I/O handles.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Payload of a successful attempt, parsed from the core's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessReport {
    /// Where the attempt wrote its model.
    pub artifact_path: PathBuf,
    /// Search iterations the core needed.
    pub iterations: u64,
    /// Time spent inside the core's search, as reported by the core.
    pub core_time_secs: f64,
    /// Loop template index used, `None` for a loop-free template.
    pub loop_index: Option<u32>,
}

/// Classified result of a single attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(SuccessReport),
    /// The attempt ran out of time. Expected and retried.
    Timeout,
    /// The core failed for a reason other than time.
    Crash { raw_output: String, exit_code: i32 },
    /// The core rejected the task itself; retrying cannot help.
    FatalConfigError { raw_output: String },
}

impl Outcome {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            Outcome::Success(_) => OutcomeKind::Success,
            Outcome::Timeout => OutcomeKind::Timeout,
            Outcome::Crash { .. } => OutcomeKind::Crash,
            Outcome::FatalConfigError { .. } => OutcomeKind::FatalConfigError,
        }
    }
}

/// Payload-free tag of an [`Outcome`], used for progress events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Success,
    Timeout,
    Crash,
    FatalConfigError,
}

/// Identity of one attempt within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttemptId {
    pub phase: u32,
    pub worker: usize,
}

impl std::fmt::Display for AttemptId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "p{}-w{}", self.phase, self.worker)
    }
}
