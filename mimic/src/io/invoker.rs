//! Invocation adapter for the opaque search procedure.
//!
//! The [`Invoker`] trait is the only boundary between the orchestrator and
//! `mimic-core`. Tests use scripted invokers that return predetermined exit
//! codes and output without spawning processes.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, info, instrument, warn};

use crate::core::classifier::TIMEOUT_EXIT_CODE;
use crate::core::types::AttemptId;
use crate::io::cancel::CancelToken;
use crate::io::process::{exit_code_of, run_command_cancellable};
use crate::task::Task;

/// Parameters for one attempt.
#[derive(Debug, Clone)]
pub struct AttemptRequest {
    pub attempt: AttemptId,
    /// Where the core must write its model. Distinct per attempt.
    pub artifact_path: PathBuf,
    /// Hard wall-clock bound for the attempt.
    pub timeout: Duration,
    /// Keep at most this many bytes of merged output.
    pub output_limit_bytes: usize,
}

/// Raw result of one invocation, before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub exit_code: i32,
    /// Merged stdout and stderr.
    pub output: String,
    /// Human-readable command line, for logs.
    pub command_line: String,
    pub timed_out: bool,
    pub cancelled: bool,
}

/// Abstraction over ways to run one attempt.
pub trait Invoker: Send + Sync {
    /// Run one attempt of `task`. Blocks until it exits, times out, or `cancel`
    /// fires. A timeout must be reported as [`TIMEOUT_EXIT_CODE`].
    fn invoke(
        &self,
        task: &Task,
        request: &AttemptRequest,
        cancel: &CancelToken,
    ) -> Result<Invocation>;
}

/// Invoker that spawns the `mimic-core` executable.
#[derive(Debug, Clone)]
pub struct CoreInvoker {
    /// Executable followed by any fixed leading arguments.
    pub command: Vec<String>,
    /// Iteration cap handed to the core's search.
    pub iterations: u64,
    /// Forwarded verbatim after the fixed arguments.
    pub extra_args: Vec<String>,
}

impl CoreInvoker {
    fn base_command(&self) -> Result<Command> {
        let (program, leading) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("core command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(leading);
        Ok(cmd)
    }

    /// The command line a verbose single attempt would run.
    pub fn verbose_command_line(&self, task: &Task, artifact_path: &Path) -> String {
        render_command_line(&self.command, &core_args(self, task, artifact_path, true))
    }

    /// Run a single verbose attempt with no time limit and inherited stdio.
    ///
    /// Returns the core's exit code.
    #[instrument(skip_all, fields(artifact = %artifact_path.display()))]
    pub fn run_verbose(&self, task: &Task, artifact_path: &Path) -> Result<i32> {
        let mut cmd = self.base_command()?;
        cmd.args(core_args(self, task, artifact_path, true));
        let status = cmd
            .stdin(Stdio::null())
            .status()
            .context("run core in debug mode")?;
        Ok(exit_code_of(&status))
    }
}

impl Invoker for CoreInvoker {
    #[instrument(skip_all, fields(attempt = %request.attempt, timeout_secs = request.timeout.as_secs()))]
    fn invoke(
        &self,
        task: &Task,
        request: &AttemptRequest,
        cancel: &CancelToken,
    ) -> Result<Invocation> {
        let args = core_args(self, task, &request.artifact_path, false);
        let command_line = render_command_line(&self.command, &args);
        debug!(command = %command_line, "starting core");

        let mut cmd = self.base_command()?;
        cmd.args(&args);
        let output = run_command_cancellable(
            cmd,
            Some(request.timeout),
            request.output_limit_bytes,
            cancel,
        )
        .with_context(|| format!("run core for attempt {}", request.attempt))?;

        let exit_code = if output.timed_out {
            TIMEOUT_EXIT_CODE
        } else {
            exit_code_of(&output.status)
        };
        if output.cancelled {
            debug!("core attempt cancelled");
        } else if exit_code != 0 && exit_code != TIMEOUT_EXIT_CODE {
            warn!(exit_code, "core attempt failed");
        } else {
            info!(exit_code, "core attempt finished");
        }

        Ok(Invocation {
            exit_code,
            output: output.output_lossy(),
            command_line,
            timed_out: output.timed_out,
            cancelled: output.cancelled,
        })
    }
}

/// Arguments after the core executable for one attempt.
pub fn core_args(
    core: &CoreInvoker,
    task: &Task,
    artifact_path: &Path,
    verbose: bool,
) -> Vec<String> {
    let mut args = vec![
        "synth".to_string(),
        "--iterations".to_string(),
        core.iterations.to_string(),
    ];
    args.extend(core.extra_args.iter().cloned());
    if verbose {
        args.push("--verbose".to_string());
    } else {
        args.push("--colors".to_string());
        args.push("0".to_string());
    }
    args.push("--out".to_string());
    args.push(artifact_path.display().to_string());
    if let Some(metric) = task.metric {
        args.push("--metric".to_string());
        args.push(metric.to_string());
    }
    if let Some(index) = task.loop_index {
        args.push("--loop".to_string());
        args.push(index.to_string());
    }
    args.push(task.argnames_arg());
    args.push(task.body.clone());
    args.extend(task.arguments.iter().cloned());
    args
}

/// Split `--args` the way a POSIX shell would group words.
///
/// Supports single quotes, double quotes (with `\"` and `\\` escapes) and
/// backslash escapes outside quotes. No expansion of any kind.
pub fn split_extra_args(raw: &str) -> Result<Vec<String>> {
    let mut args = Vec::new();
    let mut word = String::new();
    let mut in_word = false;
    let mut chars = raw.chars();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {
                if in_word {
                    args.push(std::mem::take(&mut word));
                    in_word = false;
                }
            }
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => word.push(c),
                        None => bail!("unterminated single quote in core arguments: {raw}"),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(c @ ('"' | '\\')) => word.push(c),
                            Some(c) => {
                                word.push('\\');
                                word.push(c);
                            }
                            None => bail!("unterminated double quote in core arguments: {raw}"),
                        },
                        Some(c) => word.push(c),
                        None => bail!("unterminated double quote in core arguments: {raw}"),
                    }
                }
            }
            '\\' => {
                in_word = true;
                match chars.next() {
                    Some(c) => word.push(c),
                    None => bail!("trailing backslash in core arguments: {raw}"),
                }
            }
            c => {
                in_word = true;
                word.push(c);
            }
        }
    }
    if in_word {
        args.push(word);
    }
    Ok(args)
}

fn render_command_line(command: &[String], args: &[String]) -> String {
    command
        .iter()
        .chain(args)
        .map(|part| {
            if part.is_empty() || part.contains(char::is_whitespace) || part.contains('"') {
                format!("\"{}\"", part.replace('"', "\\\""))
            } else {
                part.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;

    fn core(command: Vec<&str>) -> CoreInvoker {
        CoreInvoker {
            command: command.into_iter().map(str::to_string).collect(),
            iterations: 100,
            extra_args: vec!["--cleanup".to_string(), "700".to_string()],
        }
    }

    fn task() -> Task {
        let mut task = Task::anonymous(
            "x, y",
            vec!["[1, 2]".to_string(), "[3, 4]".to_string()],
            "return x+y",
        );
        task.metric = Some(1);
        task.loop_index = Some(0);
        task
    }

    #[test]
    fn core_args_follow_core_cli_layout() {
        let args = core_args(&core(vec!["mimic-core"]), &task(), Path::new("/tmp/r.js"), false);
        assert_eq!(
            args,
            vec![
                "synth", "--iterations", "100", "--cleanup", "700", "--colors", "0", "--out",
                "/tmp/r.js", "--metric", "1", "--loop", "0", "x,y", "return x+y", "[1, 2]",
                "[3, 4]",
            ]
        );
    }

    #[test]
    fn verbose_args_replace_color_flag() {
        let args = core_args(&core(vec!["mimic-core"]), &task(), Path::new("/tmp/r.js"), true);
        assert!(args.contains(&"--verbose".to_string()));
        assert!(!args.contains(&"--colors".to_string()));
    }

    #[test]
    fn command_line_quotes_spaced_parts() {
        let line = render_command_line(
            &["core".to_string()],
            &["return x+y".to_string(), "plain".to_string(), "say \"hi\"".to_string()],
        );
        assert_eq!(line, "core \"return x+y\" plain \"say \\\"hi\\\"\"");
    }

    #[test]
    fn empty_core_command_is_an_error() {
        let invoker = core(Vec::new());
        let request = AttemptRequest {
            attempt: AttemptId { phase: 0, worker: 0 },
            artifact_path: PathBuf::from("/tmp/r.js"),
            timeout: Duration::from_secs(1),
            output_limit_bytes: 100,
        };
        let err = invoker
            .invoke(&task(), &request, &CancelToken::new())
            .unwrap_err();
        assert!(err.to_string().contains("core command is empty"));
    }

    #[cfg(unix)]
    #[test]
    fn timeout_reports_conventional_exit_code() {
        let invoker = core(vec!["sh", "-c", "exec sleep 30", "core"]);
        let request = AttemptRequest {
            attempt: AttemptId { phase: 0, worker: 0 },
            artifact_path: PathBuf::from("/tmp/r.js"),
            timeout: Duration::from_millis(200),
            output_limit_bytes: 100,
        };
        let invocation = invoker
            .invoke(&task(), &request, &CancelToken::new())
            .expect("invoke");
        assert!(invocation.timed_out);
        assert_eq!(invocation.exit_code, TIMEOUT_EXIT_CODE);
    }

    #[test]
    fn extra_args_keep_quoted_groups() {
        let args = split_extra_args(r#"--seed '1 2'  --name "a \"b\"" plain\ word ''"#)
            .expect("split");
        assert_eq!(
            args,
            vec!["--seed", "1 2", "--name", "a \"b\"", "plain word", ""]
        );
        assert!(split_extra_args("   ").expect("split").is_empty());
    }

    #[test]
    fn extra_args_reject_unterminated_quotes() {
        let err = split_extra_args("--seed '1 2").unwrap_err();
        assert!(err.to_string().contains("unterminated single quote"));
        assert!(split_extra_args("\"open").is_err());
    }
}
