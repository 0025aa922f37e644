//! Run statistics and the crash-rate circuit breaker.

use std::time::{Duration, Instant};

/// Attempts that must have run before the breaker may trip.
pub const MIN_ATTEMPTS: u64 = 5;
/// Crash ratio at or above which the run is considered broken.
pub const CRASH_RATIO: f64 = 0.5;

/// Counters accumulated over a run. Only ever grow.
///
/// Owned by the run controller; workers never touch it.
#[derive(Debug, Clone)]
pub struct RunStatistics {
    pub started_at: Instant,
    pub total_attempts: u64,
    pub total_crashes: u64,
    pub total_timeouts: u64,
    /// Output of the most recent crash, kept for diagnostics.
    pub last_crash_output: Option<String>,
}

impl RunStatistics {
    pub fn start() -> Self {
        Self {
            started_at: Instant::now(),
            total_attempts: 0,
            total_crashes: 0,
            total_timeouts: 0,
            last_crash_output: None,
        }
    }

    pub fn record_launch(&mut self, attempts: usize) {
        self.total_attempts += attempts as u64;
    }

    pub fn record_crash(&mut self, output: &str) {
        self.total_crashes += 1;
        self.last_crash_output = Some(output.to_string());
    }

    pub fn record_timeout(&mut self) {
        self.total_timeouts += 1;
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Decide whether crashes dominate the run.
///
/// Timeouts do not count: a hard search shows up as timeouts, a broken setup
/// shows up as crashes. Small samples never trip.
pub fn should_trip(total_attempts: u64, total_crashes: u64) -> bool {
    if total_attempts <= MIN_ATTEMPTS {
        return false;
    }
    total_crashes as f64 / total_attempts as f64 >= CRASH_RATIO
}
