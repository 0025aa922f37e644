//! Run controller: drives phases until one attempt succeeds or the run aborts.
//!
//! The controller is single-threaded. It launches a phase through the
//! [`WorkerPool`], then blocks on the phase channel. Each receive cycle takes
//! one report plus every report already queued, so a fatal configuration error
//! that arrives together with a success still wins.

use std::sync::mpsc::{self, Receiver};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::breaker::{RunStatistics, should_trip};
use crate::core::schedule::PhaseSchedule;
use crate::core::types::{AttemptId, Outcome, OutcomeKind, SuccessReport};
use crate::io::artifact::read_artifact;
use crate::io::invoker::Invoker;
use crate::pool::{AttemptReport, PhaseHandle, WorkerPool};

/// Progress notifications for the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    PhaseStarted {
        phase: u32,
        timeout: Duration,
        workers: usize,
    },
    AttemptFinished {
        attempt: AttemptId,
        kind: OutcomeKind,
        elapsed: Duration,
    },
}

/// Why a run gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    /// The core rejected the task. Not retried.
    FatalConfig,
    /// Too many attempts crashed.
    CircuitBreaker,
}

/// Final report of a successful run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    pub elapsed: Duration,
    pub total_attempts: u64,
    pub total_crashes: u64,
    pub total_timeouts: u64,
    pub winner: AttemptId,
    /// Timeout of the phase the winner ran in.
    pub winner_timeout_secs: u64,
    pub success: SuccessReport,
    /// The winning model, read before any sibling was cancelled.
    pub artifact: String,
}

/// Counters reported when a run ends without a winner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunTotals {
    pub phases: u32,
    pub total_attempts: u64,
    pub total_crashes: u64,
    pub total_timeouts: u64,
}

/// Terminal state of a run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunStop {
    Succeeded(RunResult),
    Aborted {
        reason: AbortReason,
        /// Raw core output behind the abort (the last crash for the breaker).
        diagnostic: String,
        totals: RunTotals,
    },
    /// The configured phase limit was hit before any terminal outcome.
    PhaseLimitReached { totals: RunTotals },
}

/// Run-level parameters of the controller.
#[derive(Debug, Clone, Copy)]
pub struct ControllerSettings {
    pub schedule: PhaseSchedule,
    pub max_phases: Option<u32>,
}

/// How one phase ended.
enum PhaseEnd {
    /// All `W` attempts reported without a terminal outcome.
    Drained,
    Terminal(RunStop),
}

pub struct RunController<I: Invoker + 'static> {
    pool: WorkerPool<I>,
    settings: ControllerSettings,
}

impl<I: Invoker + 'static> RunController<I> {
    pub fn new(pool: WorkerPool<I>, settings: ControllerSettings) -> Self {
        Self { pool, settings }
    }

    /// Search until an attempt succeeds or the run aborts.
    ///
    /// Returns `Err` only for infrastructure failures (spawning workers or the
    /// core, reading the winning artifact, unparseable success output).
    #[instrument(skip_all, fields(workers = self.pool.workers(), max_phases = ?self.settings.max_phases))]
    pub fn run<F: FnMut(&RunEvent)>(&self, mut on_event: F) -> Result<RunStop> {
        let mut stats = RunStatistics::start();
        let mut phase = 0u32;
        info!("search started");

        loop {
            if let Some(max) = self.settings.max_phases
                && phase >= max
            {
                info!(phases = phase, "phase limit reached");
                return Ok(RunStop::PhaseLimitReached {
                    totals: totals(&stats, phase),
                });
            }

            let timeout = self.settings.schedule.timeout(phase);
            on_event(&RunEvent::PhaseStarted {
                phase,
                timeout,
                workers: self.pool.workers(),
            });

            let (tx, rx) = mpsc::channel();
            let mut handle = self.pool.launch_phase(phase, timeout, &tx)?;
            // Workers hold the only senders, so a worker dying without a report
            // disconnects the channel instead of hanging the controller.
            drop(tx);
            stats.record_launch(handle.launched);
            debug!(phase, timeout_secs = timeout.as_secs(), "phase started");

            let end = collect_phase(&handle, &rx, &mut stats, timeout, &mut on_event);
            // A terminal outcome has already cancelled the phase; wait until every
            // attempt has killed its core so none outlives the run.
            handle.join();
            match end? {
                PhaseEnd::Terminal(stop) => return Ok(stop),
                PhaseEnd::Drained => {}
            }

            if should_trip(stats.total_attempts, stats.total_crashes) {
                warn!(
                    total_attempts = stats.total_attempts,
                    total_crashes = stats.total_crashes,
                    "crash rate too high, aborting"
                );
                return Ok(RunStop::Aborted {
                    reason: AbortReason::CircuitBreaker,
                    diagnostic: stats.last_crash_output.clone().unwrap_or_default(),
                    totals: totals(&stats, phase + 1),
                });
            }
            phase += 1;
        }
    }
}

/// Receive reports until the phase drains or reaches a terminal outcome.
///
/// Within one receive cycle a worker error wins over a fatal configuration
/// error, which wins over a success. Crashes and timeouts in the cycle are
/// counted first.
fn collect_phase<F: FnMut(&RunEvent)>(
    handle: &PhaseHandle,
    rx: &Receiver<AttemptReport>,
    stats: &mut RunStatistics,
    timeout: Duration,
    on_event: &mut F,
) -> Result<PhaseEnd> {
    let phase = handle.phase;
    let mut pending = handle.launched;

    while pending > 0 {
        let first = rx
            .recv()
            .map_err(|_| anyhow!("workers of phase {phase} exited without reporting"))?;
        let mut cycle = vec![first];
        cycle.extend(rx.try_iter());
        pending = pending.saturating_sub(cycle.len());

        let mut outcomes = Vec::with_capacity(cycle.len());
        for report in cycle {
            match report.result {
                Ok(outcome) => {
                    on_event(&RunEvent::AttemptFinished {
                        attempt: report.attempt,
                        kind: outcome.kind(),
                        elapsed: report.elapsed,
                    });
                    outcomes.push((report.attempt, outcome));
                }
                Err(err) => {
                    handle.cancel_all();
                    return Err(err.context(format!("attempt {} failed", report.attempt)));
                }
            }
        }

        for (_, outcome) in &outcomes {
            match outcome {
                Outcome::Crash { raw_output, .. } => stats.record_crash(raw_output),
                Outcome::Timeout => stats.record_timeout(),
                Outcome::Success(_) | Outcome::FatalConfigError { .. } => {}
            }
        }

        if let Some((attempt, raw_output)) = outcomes.iter().find_map(|(attempt, o)| match o {
            Outcome::FatalConfigError { raw_output } => Some((attempt, raw_output)),
            _ => None,
        }) {
            handle.cancel_all();
            warn!(%attempt, "core reported a fatal configuration error");
            return Ok(PhaseEnd::Terminal(RunStop::Aborted {
                reason: AbortReason::FatalConfig,
                diagnostic: raw_output.clone(),
                totals: totals(stats, phase + 1),
            }));
        }

        if let Some((attempt, success)) = outcomes.into_iter().find_map(|(attempt, o)| match o {
            Outcome::Success(success) => Some((attempt, success)),
            _ => None,
        }) {
            // Read the winner before cancelling anything else.
            let artifact = read_artifact(&success.artifact_path);
            handle.cancel_all();
            let artifact =
                artifact.with_context(|| format!("load artifact of winning attempt {attempt}"))?;
            let result = RunResult {
                elapsed: stats.elapsed(),
                total_attempts: stats.total_attempts,
                total_crashes: stats.total_crashes,
                total_timeouts: stats.total_timeouts,
                winner: attempt,
                winner_timeout_secs: timeout.as_secs(),
                success,
                artifact,
            };
            info!(
                %attempt,
                iterations = result.success.iterations,
                total_attempts = result.total_attempts,
                "search succeeded"
            );
            return Ok(PhaseEnd::Terminal(RunStop::Succeeded(result)));
        }
    }

    Ok(PhaseEnd::Drained)
}

fn totals(stats: &RunStatistics, phases: u32) -> RunTotals {
    RunTotals {
        phases,
        total_attempts: stats.total_attempts,
        total_crashes: stats.total_crashes,
        total_timeouts: stats.total_timeouts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::artifact::ArtifactDir;
    use crate::pool::PoolSettings;
    use crate::test_support::{CANCELLED_ARTIFACT, Scripted, ScriptedInvoker, sample_task};
    use std::sync::Arc;
    use std::time::Instant;

    fn controller(
        invoker: Arc<ScriptedInvoker>,
        workers: usize,
        growth: f64,
        max_phases: Option<u32>,
    ) -> RunController<ScriptedInvoker> {
        let pool = WorkerPool::new(
            invoker,
            Arc::new(sample_task()),
            ArtifactDir::create().expect("artifact dir"),
            PoolSettings {
                workers,
                output_limit_bytes: 10_000,
                log_dir: None,
            },
        )
        .expect("pool");
        RunController::new(
            pool,
            ControllerSettings {
                schedule: PhaseSchedule::new(3.0, growth, workers).expect("schedule"),
                max_phases,
            },
        )
    }

    #[test]
    fn first_phase_success_uses_w_attempts() {
        let invoker = Arc::new(ScriptedInvoker::always(Scripted::success(11, "model")));
        let stop = controller(invoker.clone(), 4, 1.025, None)
            .run(|_| {})
            .expect("run");

        let RunStop::Succeeded(result) = stop else {
            panic!("expected success, got {stop:?}");
        };
        assert_eq!(result.total_attempts, 4);
        assert_eq!(result.winner.phase, 0);
        assert_eq!(result.success.iterations, 11);
        assert_eq!(result.artifact, "model");
        assert!(invoker.calls().iter().all(|c| c.attempt.phase == 0));
    }

    #[test]
    fn persistent_crashes_trip_the_breaker() {
        let invoker = Arc::new(ScriptedInvoker::new(|attempt| {
            Scripted::crash(&format!("crash in {attempt}"))
        }));
        let stop = controller(invoker, 2, 1.025, Some(50))
            .run(|_| {})
            .expect("run");

        let RunStop::Aborted {
            reason,
            diagnostic,
            totals,
        } = stop
        else {
            panic!("expected abort, got {stop:?}");
        };
        assert_eq!(reason, AbortReason::CircuitBreaker);
        assert!(diagnostic.starts_with("crash in p2-"));
        // 2 attempts per phase: the breaker first sees more than 5 attempts after phase 2.
        assert_eq!(totals.phases, 3);
        assert_eq!(totals.total_attempts, 6);
        assert_eq!(totals.total_crashes, 6);
    }

    #[test]
    fn timeouts_never_trip_the_breaker() {
        let invoker = Arc::new(ScriptedInvoker::always(Scripted::Timeout));
        let stop = controller(invoker.clone(), 3, 1.025, Some(20))
            .run(|_| {})
            .expect("run");

        assert_eq!(
            stop,
            RunStop::PhaseLimitReached {
                totals: RunTotals {
                    phases: 20,
                    total_attempts: 60,
                    total_crashes: 0,
                    total_timeouts: 60,
                }
            }
        );
        assert_eq!(invoker.calls().len(), 60);
    }

    #[test]
    fn occasional_crashes_below_ratio_keep_searching() {
        // One crash out of three attempts per phase stays under the ratio.
        let invoker = Arc::new(ScriptedInvoker::new(|attempt| match attempt.worker {
            0 => Scripted::crash("flaky"),
            _ => Scripted::Timeout,
        }));
        let stop = controller(invoker, 3, 1.025, Some(5))
            .run(|_| {})
            .expect("run");
        let RunStop::PhaseLimitReached { totals } = stop else {
            panic!("expected phase limit, got {stop:?}");
        };
        assert_eq!(totals.total_crashes, 5);
        assert_eq!(totals.total_timeouts, 10);
    }

    #[test]
    fn fatal_config_aborts_without_waiting_for_siblings() {
        let invoker = Arc::new(ScriptedInvoker::new(|attempt| match attempt.worker {
            0 => Scripted::Fatal("SyntaxError: bad body".to_string()),
            _ => Scripted::delayed(Duration::from_secs(30), Scripted::Timeout),
        }));
        let start = Instant::now();
        let stop = controller(invoker.clone(), 4, 1.025, None)
            .run(|_| {})
            .expect("run");

        assert!(start.elapsed() < Duration::from_secs(10));
        assert_eq!(invoker.finished(), 4);
        let RunStop::Aborted {
            reason, diagnostic, ..
        } = stop
        else {
            panic!("expected abort, got {stop:?}");
        };
        assert_eq!(reason, AbortReason::FatalConfig);
        assert_eq!(diagnostic, "SyntaxError: bad body");
    }

    #[test]
    fn single_winner_among_delayed_siblings_wins_promptly() {
        let invoker = Arc::new(ScriptedInvoker::new(|attempt| match attempt.worker {
            5 => Scripted::success(9, "function model(x, y) { return x + y }\n"),
            _ => Scripted::delayed(Duration::from_secs(30), Scripted::success(1, "late")),
        }));
        let start = Instant::now();
        let stop = controller(invoker.clone(), 8, 1.025, None)
            .run(|_| {})
            .expect("run");

        assert!(start.elapsed() < Duration::from_secs(10));
        let RunStop::Succeeded(result) = stop else {
            panic!("expected success, got {stop:?}");
        };
        assert_eq!(result.winner, AttemptId { phase: 0, worker: 5 });
        assert_eq!(result.total_attempts, 8);
        assert_eq!(result.artifact, "function model(x, y) { return x + y }\n");
        assert_ne!(result.artifact, CANCELLED_ARTIFACT);
        // Every cancelled sibling has stopped by the time the run returns.
        assert_eq!(invoker.finished(), 8);
    }

    #[test]
    fn escalates_after_timeouts_until_success() {
        let invoker = Arc::new(ScriptedInvoker::new(|attempt| match attempt.phase {
            0 | 1 => Scripted::Timeout,
            _ => Scripted::success(42, "model"),
        }));
        let mut events = Vec::new();
        let stop = controller(invoker.clone(), 1, 1.0, None)
            .run(|event| events.push(event.clone()))
            .expect("run");

        let RunStop::Succeeded(result) = stop else {
            panic!("expected success, got {stop:?}");
        };
        assert_eq!(result.total_attempts, 3);
        assert_eq!(result.total_timeouts, 2);
        assert_eq!(result.success.iterations, 42);
        assert_eq!(result.winner_timeout_secs, 3);
        let calls = invoker.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls.iter().all(|c| c.timeout == Duration::from_secs(3)));

        let phases: Vec<u32> = events
            .iter()
            .filter_map(|e| match e {
                RunEvent::PhaseStarted { phase, .. } => Some(*phase),
                RunEvent::AttemptFinished { .. } => None,
            })
            .collect();
        assert_eq!(phases, vec![0, 1, 2]);
    }

    #[test]
    fn timeouts_grow_between_phases() {
        let invoker = Arc::new(ScriptedInvoker::always(Scripted::Timeout));
        controller(invoker.clone(), 1, 2.0, Some(4))
            .run(|_| {})
            .expect("run");
        let timeouts: Vec<u64> = invoker.calls().iter().map(|c| c.timeout.as_secs()).collect();
        assert_eq!(timeouts, vec![3, 6, 12, 24]);
    }

    #[test]
    fn unparseable_success_is_an_error() {
        let invoker = Arc::new(ScriptedInvoker::always(Scripted::Malformed));
        let err = controller(invoker, 2, 1.025, None)
            .run(|_| {})
            .unwrap_err();
        assert!(format!("{err:#}").contains("Found in"));
    }

    fn report(worker: usize, outcome: Outcome) -> AttemptReport {
        AttemptReport {
            attempt: AttemptId { phase: 0, worker },
            elapsed: Duration::from_millis(5),
            result: Ok(outcome),
        }
    }

    /// Queue every report before the first receive so they land in one cycle.
    fn single_cycle(reports: Vec<AttemptReport>, stats: &mut RunStatistics) -> PhaseEnd {
        let (tx, rx) = mpsc::channel();
        let handle = PhaseHandle::detached(0, reports.len());
        stats.record_launch(reports.len());
        for report in reports {
            tx.send(report).expect("send report");
        }
        drop(tx);
        collect_phase(
            &handle,
            &rx,
            stats,
            Duration::from_secs(3),
            &mut |_: &RunEvent| {},
        )
        .expect("collect phase")
    }

    fn success_at(path: std::path::PathBuf) -> Outcome {
        Outcome::Success(SuccessReport {
            artifact_path: path,
            iterations: 5,
            core_time_secs: 0.1,
            loop_index: None,
        })
    }

    #[test]
    fn fatal_config_beats_success_in_same_cycle() {
        let temp = tempfile::tempdir().expect("tempdir");
        let artifact = temp.path().join("result-p0-w0.js");
        std::fs::write(&artifact, "model").expect("write artifact");
        let mut stats = RunStatistics::start();

        let end = single_cycle(
            vec![
                report(0, success_at(artifact)),
                report(
                    1,
                    Outcome::Crash {
                        raw_output: "boom".to_string(),
                        exit_code: 1,
                    },
                ),
                report(
                    2,
                    Outcome::FatalConfigError {
                        raw_output: "SyntaxError".to_string(),
                    },
                ),
            ],
            &mut stats,
        );

        let PhaseEnd::Terminal(RunStop::Aborted {
            reason,
            diagnostic,
            totals,
        }) = end
        else {
            panic!("expected a fatal abort");
        };
        assert_eq!(reason, AbortReason::FatalConfig);
        assert_eq!(diagnostic, "SyntaxError");
        assert_eq!(totals.total_attempts, 3);
        assert_eq!(totals.total_crashes, 1);
    }

    #[test]
    fn crash_and_timeout_in_winning_cycle_are_counted() {
        let temp = tempfile::tempdir().expect("tempdir");
        let artifact = temp.path().join("result-p0-w1.js");
        std::fs::write(&artifact, "model").expect("write artifact");
        let mut stats = RunStatistics::start();

        let end = single_cycle(
            vec![
                report(
                    0,
                    Outcome::Crash {
                        raw_output: "boom".to_string(),
                        exit_code: 139,
                    },
                ),
                report(1, success_at(artifact)),
                report(2, Outcome::Timeout),
            ],
            &mut stats,
        );

        let PhaseEnd::Terminal(RunStop::Succeeded(result)) = end else {
            panic!("expected success");
        };
        assert_eq!(result.winner, AttemptId { phase: 0, worker: 1 });
        assert_eq!(result.artifact, "model");
        assert_eq!(result.total_crashes, 1);
        assert_eq!(result.total_timeouts, 1);
        assert_eq!(stats.last_crash_output.as_deref(), Some("boom"));
    }
}
