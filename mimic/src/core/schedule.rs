//! Phase timeout schedule.

use std::time::Duration;

use anyhow::{Result, bail};

pub const DEFAULT_INITIAL_TIMEOUT_SECS: f64 = 3.0;
pub const DEFAULT_GROWTH_PER_WORKER: f64 = 1.025;

/// Upper bound on a single phase timeout (one year).
const MAX_TIMEOUT_SECS: f64 = 365.0 * 24.0 * 60.0 * 60.0;

/// Geometric timeout schedule: `timeout(p) = round(t0 * (f^W)^p)`.
///
/// The growth per phase is `f` raised to the worker count, so the total
/// compute spent per phase grows at the same rate whatever the parallelism.
/// The schedule is stateless: the timeout depends only on the phase number.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseSchedule {
    initial_secs: f64,
    phase_growth: f64,
}

impl PhaseSchedule {
    pub fn new(initial_secs: f64, growth_per_worker: f64, workers: usize) -> Result<Self> {
        if !initial_secs.is_finite() || initial_secs < 1.0 {
            bail!("initial timeout must be at least 1 second (got {initial_secs})");
        }
        if !growth_per_worker.is_finite() || growth_per_worker < 1.0 {
            bail!("growth factor must be >= 1.0 (got {growth_per_worker})");
        }
        if workers == 0 {
            bail!("worker count must be > 0");
        }
        let exponent = i32::try_from(workers).unwrap_or(i32::MAX);
        Ok(Self {
            initial_secs,
            phase_growth: growth_per_worker.powi(exponent),
        })
    }

    /// Timeout in whole seconds for `phase` (0-based).
    pub fn timeout_secs(&self, phase: u32) -> u64 {
        let exponent = i32::try_from(phase).unwrap_or(i32::MAX);
        let raw = self.initial_secs * self.phase_growth.powi(exponent);
        raw.min(MAX_TIMEOUT_SECS).round() as u64
    }

    pub fn timeout(&self, phase: u32) -> Duration {
        Duration::from_secs(self.timeout_secs(phase))
    }
}
