//! Parallel retry-search orchestrator for the `mimic-core` synthesizer.
//!
//! `mimic-core` is a randomized search that may or may not find a model within
//! a time limit. This crate runs it repeatedly across a pool of workers, with
//! per-attempt timeouts that grow phase by phase, until one attempt succeeds.
//! The architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (classification, timeout schedule,
//!   circuit breaker). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (process execution, config, artifacts).
//!   Isolated behind the [`io::invoker::Invoker`] trait to enable scripting in tests.
//!
//! Orchestration modules ([`pool`], [`controller`]) coordinate core logic with
//! I/O to implement a run.

pub mod controller;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod pool;
pub mod report;
pub mod task;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
