//! Test-only helpers: a scripted invoker and sample tasks.

use std::fs;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::core::classifier::{FATAL_CONFIG_EXIT_CODE, TIMEOUT_EXIT_CODE};
use crate::core::types::AttemptId;
use crate::io::cancel::CancelToken;
use crate::io::invoker::{AttemptRequest, Invocation, Invoker};
use crate::task::Task;

/// Text a cancelled scripted attempt scribbles into its own artifact.
pub const CANCELLED_ARTIFACT: &str = "// written by a cancelled attempt\n";

/// Scripted behavior for one attempt.
#[derive(Debug, Clone)]
pub enum Scripted {
    /// Write `artifact` and report success after `iterations`.
    Success { iterations: u64, artifact: String },
    Timeout,
    Crash { output: String, exit_code: i32 },
    Fatal(String),
    /// Exit 0 without the markers the classifier needs.
    Malformed,
    /// Block for `delay` (or until cancelled), then behave like `then`.
    Delayed { delay: Duration, then: Box<Scripted> },
}

impl Scripted {
    pub fn success(iterations: u64, artifact: &str) -> Self {
        Scripted::Success {
            iterations,
            artifact: artifact.to_string(),
        }
    }

    pub fn crash(output: &str) -> Self {
        Scripted::Crash {
            output: output.to_string(),
            exit_code: 1,
        }
    }

    pub fn delayed(delay: Duration, then: Scripted) -> Self {
        Scripted::Delayed {
            delay,
            then: Box::new(then),
        }
    }
}

/// One recorded call to [`ScriptedInvoker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvokeCall {
    pub attempt: AttemptId,
    pub timeout: Duration,
}

type Script = Box<dyn Fn(AttemptId) -> Scripted + Send + Sync>;

/// Invoker whose behavior is a function of the attempt id.
pub struct ScriptedInvoker {
    script: Script,
    calls: Mutex<Vec<InvokeCall>>,
    finished: AtomicUsize,
}

impl ScriptedInvoker {
    pub fn new(script: impl Fn(AttemptId) -> Scripted + Send + Sync + 'static) -> Self {
        Self {
            script: Box::new(script),
            calls: Mutex::new(Vec::new()),
            finished: AtomicUsize::new(0),
        }
    }

    pub fn always(behavior: Scripted) -> Self {
        Self::new(move |_| behavior.clone())
    }

    /// Calls recorded so far, sorted by phase then worker.
    pub fn calls(&self) -> Vec<InvokeCall> {
        let mut calls = self.calls.lock().expect("calls lock").clone();
        calls.sort_by_key(|c| (c.attempt.phase, c.attempt.worker));
        calls
    }

    /// Number of invocations that have returned, cancelled ones included.
    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    fn perform(
        &self,
        behavior: Scripted,
        request: &AttemptRequest,
        cancel: &CancelToken,
    ) -> Result<Invocation> {
        let invocation = |exit_code: i32, output: String| Invocation {
            exit_code,
            output,
            command_line: format!("scripted {}", request.attempt),
            timed_out: exit_code == TIMEOUT_EXIT_CODE,
            cancelled: false,
        };
        match behavior {
            Scripted::Success {
                iterations,
                artifact,
            } => {
                fs::write(&request.artifact_path, artifact)?;
                Ok(invocation(
                    0,
                    format!("Found in {iterations} iterations:\nTime: 0.25\nLoop index: -1\n"),
                ))
            }
            Scripted::Timeout => Ok(invocation(TIMEOUT_EXIT_CODE, String::new())),
            Scripted::Crash { output, exit_code } => Ok(invocation(exit_code, output)),
            Scripted::Fatal(output) => Ok(invocation(FATAL_CONFIG_EXIT_CODE, output)),
            Scripted::Malformed => Ok(invocation(0, "done".to_string())),
            Scripted::Delayed { delay, then } => {
                let deadline = Instant::now() + delay;
                while Instant::now() < deadline {
                    if cancel.is_cancelled() {
                        fs::write(&request.artifact_path, CANCELLED_ARTIFACT)?;
                        return Ok(Invocation {
                            cancelled: true,
                            ..invocation(137, String::new())
                        });
                    }
                    thread::sleep(Duration::from_millis(10));
                }
                self.perform(*then, request, cancel)
            }
        }
    }
}

impl Invoker for ScriptedInvoker {
    fn invoke(
        &self,
        _task: &Task,
        request: &AttemptRequest,
        cancel: &CancelToken,
    ) -> Result<Invocation> {
        self.calls.lock().expect("calls lock").push(InvokeCall {
            attempt: request.attempt,
            timeout: request.timeout,
        });
        let behavior = (self.script)(request.attempt);
        let result = self.perform(behavior, request, cancel);
        self.finished.fetch_add(1, Ordering::SeqCst);
        result
    }
}

/// A small valid task.
pub fn sample_task() -> Task {
    Task::anonymous("x, y", vec!["[1, 2]".to_string()], "return x + y")
}
