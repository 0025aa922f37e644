//! Stable exit codes for the `mimic` CLI.

/// A model was found and written to the output path.
pub const OK: i32 = 0;
/// Invalid input, invalid config, or an infrastructure error.
pub const INVALID: i32 = 1;
/// `mimic-core` rejected the task as malformed.
pub const FATAL_CONFIG: i32 = 2;
/// Too many attempts crashed; the circuit breaker aborted the run.
pub const CIRCUIT_BREAKER: i32 = 3;
/// `--max-phases` was reached without a model.
pub const PHASE_LIMIT: i32 = 4;
