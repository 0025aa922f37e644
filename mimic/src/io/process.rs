//! Helpers for running child processes with timeouts, cancellation and bounded output.

use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::io::cancel::CancelToken;

/// How often a waiting caller re-checks its cancel token.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Captured child process output (stdout and stderr merged).
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub output: Vec<u8>,
    pub truncated: usize,
    pub timed_out: bool,
    pub cancelled: bool,
}

impl CommandOutput {
    pub fn output_lossy(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.output).into_owned();
        if self.truncated > 0 {
            text.push_str(&format!("\n[output truncated {} bytes]\n", self.truncated));
        }
        text
    }
}

/// Bytes kept so far plus the count of bytes dropped past the limit.
#[derive(Debug, Default)]
struct LimitedBuffer {
    bytes: Vec<u8>,
    truncated: usize,
}

type SharedBuffer = Arc<Mutex<LimitedBuffer>>;

/// Run a command until it exits, `timeout` elapses, or `cancel` fires.
///
/// stdout and stderr are drained concurrently into one buffer bounded by
/// `output_limit_bytes`. A timed-out or cancelled child is killed; in that case
/// the readers are left to finish on their own and whatever was captured so far
/// is returned, so a grandchild holding the pipes open cannot stall the caller.
/// `timeout: None` waits without a time limit.
#[instrument(skip_all, fields(timeout_secs = timeout.map(|t| t.as_secs()), output_limit_bytes = output_limit_bytes))]
pub fn run_command_cancellable(
    mut cmd: Command,
    timeout: Option<Duration>,
    output_limit_bytes: usize,
    cancel: &CancelToken,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let buffer: SharedBuffer = Arc::default();
    let stdout_buffer = buffer.clone();
    let stderr_buffer = buffer.clone();
    let stdout_handle =
        thread::spawn(move || read_stream_limited(stdout, output_limit_bytes, &stdout_buffer));
    let stderr_handle =
        thread::spawn(move || read_stream_limited(stderr, output_limit_bytes, &stderr_buffer));

    let waited = wait_or_cancel(&mut child, timeout, cancel)?;
    let (status, timed_out, cancelled) = match waited {
        Waited::Exited(status) => (status, false, false),
        Waited::TimedOut => {
            warn!(timeout_secs = timeout.map(|t| t.as_secs()), "command timed out, killing");
            (kill_and_reap(&mut child)?, true, false)
        }
        Waited::Cancelled => {
            debug!("command cancelled, killing");
            (kill_and_reap(&mut child)?, false, true)
        }
    };

    if !timed_out && !cancelled {
        join_reader(stdout_handle).context("join stdout")?;
        join_reader(stderr_handle).context("join stderr")?;
    }

    let (output, truncated) = {
        let guard = buffer
            .lock()
            .map_err(|_| anyhow!("output buffer poisoned"))?;
        (guard.bytes.clone(), guard.truncated)
    };
    if truncated > 0 {
        warn!(truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, cancelled, "command finished");
    Ok(CommandOutput {
        status,
        output,
        truncated,
        timed_out,
        cancelled,
    })
}

enum Waited {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
}

fn wait_or_cancel(
    child: &mut Child,
    timeout: Option<Duration>,
    cancel: &CancelToken,
) -> Result<Waited> {
    let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
    loop {
        if cancel.is_cancelled() {
            return Ok(Waited::Cancelled);
        }
        let slice = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Ok(Waited::TimedOut);
                }
                remaining.min(POLL_INTERVAL)
            }
            None => POLL_INTERVAL,
        };
        if let Some(status) = child.wait_timeout(slice).context("wait for command")? {
            return Ok(Waited::Exited(status));
        }
    }
}

/// Kill a child that may already have exited on its own.
fn kill_and_reap(child: &mut Child) -> Result<ExitStatus> {
    if let Err(e) = child.kill() {
        debug!(err = %e, "kill failed, child already gone");
    }
    child.wait().context("wait command after kill")
}

fn join_reader(handle: thread::JoinHandle<Result<()>>) -> Result<()> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize, buffer: &SharedBuffer) -> Result<()> {
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let mut guard = buffer
            .lock()
            .map_err(|_| anyhow!("output buffer poisoned"))?;
        let remaining = limit.saturating_sub(guard.bytes.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            guard.bytes.extend_from_slice(&chunk[..keep]);
            guard.truncated += n.saturating_sub(keep);
        } else {
            guard.truncated += n;
        }
    }

    Ok(())
}

/// Exit code of a finished child, mapping signal deaths to `128 + signal`.
pub fn exit_code_of(status: &ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_merged_output_and_status() {
        let out = run_command_cancellable(
            sh("echo out; echo err 1>&2; exit 3"),
            Some(Duration::from_secs(10)),
            1000,
            &CancelToken::new(),
        )
        .expect("run");
        let text = out.output_lossy();
        assert!(text.contains("out"));
        assert!(text.contains("err"));
        assert_eq!(exit_code_of(&out.status), 3);
        assert!(!out.timed_out);
        assert!(!out.cancelled);
    }

    #[test]
    fn truncates_beyond_limit() {
        let out = run_command_cancellable(
            sh("printf 'abcdefghij'"),
            Some(Duration::from_secs(10)),
            4,
            &CancelToken::new(),
        )
        .expect("run");
        assert_eq!(out.output, b"abcd");
        assert_eq!(out.truncated, 6);
        assert!(out.output_lossy().contains("truncated 6 bytes"));
    }

    #[test]
    fn kills_on_timeout() {
        let start = Instant::now();
        let out = run_command_cancellable(
            sh("exec sleep 30"),
            Some(Duration::from_millis(200)),
            1000,
            &CancelToken::new(),
        )
        .expect("run");
        assert!(out.timed_out);
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn kills_on_cancel() {
        let token = CancelToken::new();
        let trigger = token.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            trigger.cancel();
        });
        let start = Instant::now();
        let out = run_command_cancellable(sh("exec sleep 30"), None, 1000, &token).expect("run");
        canceller.join().expect("join canceller");
        assert!(out.cancelled);
        assert!(!out.timed_out);
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn spawn_failure_is_an_error() {
        let err = run_command_cancellable(
            Command::new("/definitely/not/a/binary"),
            None,
            10,
            &CancelToken::new(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("spawn command"));
    }
}
