//! Worker pool: one phase of concurrent attempts.
//!
//! Each phase spawns exactly `W` OS threads. Every worker runs one attempt
//! through the [`Invoker`], classifies it, and posts an [`AttemptReport`] on
//! the phase channel. Workers never touch run statistics.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc::Sender;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::core::classifier::classify;
use crate::core::types::{AttemptId, Outcome};
use crate::io::artifact::ArtifactDir;
use crate::io::attempt_log::{AttemptMeta, write_attempt_log};
use crate::io::cancel::CancelToken;
use crate::io::invoker::{AttemptRequest, Invoker};
use crate::task::Task;

/// What a worker hands back to the controller.
#[derive(Debug)]
pub struct AttemptReport {
    pub attempt: AttemptId,
    pub elapsed: Duration,
    /// `Err` for infrastructure failures and unparseable successes.
    pub result: Result<Outcome>,
}

/// Settings shared by every attempt of a run.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub workers: usize,
    pub output_limit_bytes: usize,
    /// Write one log file per attempt here when set.
    pub log_dir: Option<PathBuf>,
}

/// Launches phases of identical attempts against one task.
pub struct WorkerPool<I: Invoker + 'static> {
    invoker: Arc<I>,
    task: Arc<Task>,
    artifacts: ArtifactDir,
    settings: PoolSettings,
}

/// In-flight attempts of one phase.
#[derive(Debug)]
pub struct PhaseHandle {
    pub phase: u32,
    pub launched: usize,
    cancel: CancelToken,
    workers: Vec<JoinHandle<()>>,
}

impl PhaseHandle {
    /// Signal every attempt still running in this phase to stop.
    ///
    /// Returns immediately. Reports from cancelled workers are suppressed, but a
    /// report already in flight may still arrive and must be ignored by the caller.
    /// Call [`PhaseHandle::join`] before exiting so no core outlives the run.
    pub fn cancel_all(&self) {
        debug!(phase = self.phase, "cancelling phase");
        self.cancel.cancel();
    }

    /// Wait for every worker thread of this phase to finish.
    ///
    /// After [`PhaseHandle::cancel_all`] this returns once each worker has killed
    /// and reaped its core, within one cancellation poll interval.
    pub fn join(&mut self) {
        for worker in self.workers.drain(..) {
            let name = worker.thread().name().unwrap_or("attempt").to_string();
            if worker.join().is_err() {
                warn!(worker = %name, "attempt thread panicked");
            }
        }
        debug!(phase = self.phase, "phase workers joined");
    }

    /// Handle with no threads behind it, for driving the controller by hand.
    #[cfg(test)]
    pub(crate) fn detached(phase: u32, launched: usize) -> Self {
        Self {
            phase,
            launched,
            cancel: CancelToken::new(),
            workers: Vec::new(),
        }
    }
}

impl<I: Invoker + 'static> WorkerPool<I> {
    pub fn new(
        invoker: Arc<I>,
        task: Arc<Task>,
        artifacts: ArtifactDir,
        settings: PoolSettings,
    ) -> Result<Self> {
        if settings.workers == 0 {
            return Err(anyhow!("worker pool needs at least one worker"));
        }
        Ok(Self {
            invoker,
            task,
            artifacts,
            settings,
        })
    }

    pub fn workers(&self) -> usize {
        self.settings.workers
    }

    /// Spawn `W` attempts for `phase`, each bounded by `timeout`.
    #[instrument(skip_all, fields(phase = phase, timeout_secs = timeout.as_secs(), workers = self.settings.workers))]
    pub fn launch_phase(
        &self,
        phase: u32,
        timeout: Duration,
        reports: &Sender<AttemptReport>,
    ) -> Result<PhaseHandle> {
        let cancel = CancelToken::new();
        let mut handle = PhaseHandle {
            phase,
            launched: self.settings.workers,
            cancel: cancel.clone(),
            workers: Vec::with_capacity(self.settings.workers),
        };
        for worker in 0..self.settings.workers {
            let attempt = AttemptId { phase, worker };
            let request = AttemptRequest {
                attempt,
                artifact_path: self.artifacts.path_for(attempt),
                timeout,
                output_limit_bytes: self.settings.output_limit_bytes,
            };
            let job = AttemptJob {
                invoker: self.invoker.clone(),
                task: self.task.clone(),
                request,
                cancel: cancel.clone(),
                log_dir: self.settings.log_dir.clone(),
                reports: reports.clone(),
            };
            let spawned = thread::Builder::new()
                .name(format!("attempt-{attempt}"))
                .spawn(move || job.run());
            match spawned {
                Ok(thread) => handle.workers.push(thread),
                Err(e) => {
                    handle.cancel_all();
                    handle.join();
                    return Err(e).with_context(|| format!("spawn worker for attempt {attempt}"));
                }
            }
        }
        debug!("phase launched");
        Ok(handle)
    }
}

/// Everything one worker thread owns.
struct AttemptJob<I: Invoker> {
    invoker: Arc<I>,
    task: Arc<Task>,
    request: AttemptRequest,
    cancel: CancelToken,
    log_dir: Option<PathBuf>,
    reports: Sender<AttemptReport>,
}

impl<I: Invoker> AttemptJob<I> {
    fn run(self) {
        let attempt = self.request.attempt;
        let started = Instant::now();
        let result = self.attempt();
        let elapsed = started.elapsed();

        if self.cancel.is_cancelled() {
            debug!(%attempt, "attempt finished after cancellation, dropping report");
            return;
        }
        let report = AttemptReport {
            attempt,
            elapsed,
            result,
        };
        // The controller may already have stopped listening.
        if self.reports.send(report).is_err() {
            debug!(%attempt, "controller gone, dropping report");
        }
    }

    fn attempt(&self) -> Result<Outcome> {
        let started = Instant::now();
        let invocation = self
            .invoker
            .invoke(&self.task, &self.request, &self.cancel)?;
        if invocation.cancelled {
            debug!(attempt = %self.request.attempt, "core killed after cancellation");
        }
        let outcome = classify(
            invocation.exit_code,
            &invocation.output,
            &self.request.artifact_path,
        )
        .with_context(|| format!("classify attempt {}", self.request.attempt));

        if let Some(dir) = &self.log_dir {
            let meta = AttemptMeta {
                phase: self.request.attempt.phase,
                worker: self.request.attempt.worker,
                timeout_secs: self.request.timeout.as_secs(),
                exit_code: invocation.exit_code,
                timed_out: invocation.timed_out,
                cancelled: invocation.cancelled,
                outcome: outcome.as_ref().ok().map(Outcome::kind),
                elapsed_ms: started.elapsed().as_millis() as u64,
            };
            if let Err(e) =
                write_attempt_log(dir, &meta, &invocation.command_line, &invocation.output)
            {
                warn!(err = %e, "failed to write attempt log");
            }
        }

        outcome
    }
}
