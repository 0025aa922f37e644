use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::debug;

use mimic::controller::{AbortReason, ControllerSettings, RunController, RunEvent, RunStop};
use mimic::core::schedule::PhaseSchedule;
use mimic::core::types::{AttemptId, OutcomeKind};
use mimic::exit_codes;
use mimic::io::artifact::{ArtifactDir, persist_artifact};
use mimic::io::config::{DEFAULT_CONFIG_PATH, MimicConfig, load_config, write_config};
use mimic::io::invoker::{CoreInvoker, split_extra_args};
use mimic::logging;
use mimic::pool::{PoolSettings, WorkerPool};
use mimic::report::{render_abort, render_success, write_summary_json};
use mimic::task::{DEFAULT_ARGNAMES, Task};

const LINE: &str = "--------------------------------------------------------------------------------";

#[derive(Parser, Debug)]
#[command(
    name = "mimic",
    version,
    about = "Compute models for opaque code by running mimic-core until a search succeeds"
)]
struct Cli {
    /// Number of worker threads (negative = half of the available cores).
    #[arg(short = 't', long, allow_negative_numbers = true)]
    threads: Option<i64>,

    /// The function body of the opaque code.
    #[arg(long = "function", required_unless_present = "init_config")]
    body: Option<String>,

    /// The names of the arguments, comma-separated.
    #[arg(long, default_value = DEFAULT_ARGNAMES)]
    argnames: String,

    /// Argument tuples to record the function with (each an array literal).
    #[arg(
        long,
        num_args = 1..,
        required_unless_present = "init_config",
        allow_hyphen_values = true
    )]
    arguments: Vec<String>,

    /// Extra arguments for mimic-core, split like a shell would (quotes group words).
    #[arg(long = "args", default_value = "", allow_hyphen_values = true)]
    core_args: String,

    /// Where the resulting model is written.
    #[arg(long, default_value = "result.js")]
    out: PathBuf,

    /// Scoring function used inside mimic-core.
    #[arg(long)]
    metric: Option<u32>,

    /// Loop template index hint for mimic-core.
    #[arg(long)]
    loop_index: Option<u32>,

    /// Timeout of the first phase, in seconds.
    #[arg(long)]
    t0: Option<f64>,

    /// Per-worker timeout growth factor between phases.
    #[arg(long)]
    factor: Option<f64>,

    /// Stop after this many phases.
    #[arg(long)]
    max_phases: Option<u32>,

    /// mimic-core executable (overrides `core_command` from the config).
    #[arg(long)]
    core: Option<String>,

    /// Configuration file.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Write one log file per attempt into this directory.
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Write a JSON summary of the run to this path.
    #[arg(long)]
    summary_json: Option<PathBuf>,

    /// Write the effective configuration to `--config` and exit.
    #[arg(long)]
    init_config: bool,

    /// Run a single verbose instance of mimic-core without a time limit.
    #[arg(long)]
    debug: bool,
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let cfg = resolve_config(&cli)?;
    if cli.init_config {
        write_config(&cli.config, &cfg)?;
        println!("Wrote {}", cli.config.display());
        return Ok(exit_codes::OK);
    }
    let task = build_task(&cli);
    task.validate()?;

    let workers = cfg.worker_count();
    let invoker = CoreInvoker {
        command: cfg.core_command.clone(),
        iterations: cfg.core_iterations,
        extra_args: cfg.extra_args.clone(),
    };

    println!("mimic - computing models for opaque code");
    println!("{LINE}");
    println!("Configuration:");
    println!("  Number of threads: {workers}");
    if !cli.debug {
        println!(
            "  Phase timeouts:    {}s, growing by {} per worker",
            cfg.initial_timeout_secs, cfg.growth_per_worker
        );
    }
    println!("{LINE}");

    if cli.debug {
        return run_debug(&invoker, &task, &cli.out);
    }

    let schedule = PhaseSchedule::new(cfg.initial_timeout_secs, cfg.growth_per_worker, workers)?;
    let pool = WorkerPool::new(
        Arc::new(invoker),
        Arc::new(task),
        ArtifactDir::create()?,
        PoolSettings {
            workers,
            output_limit_bytes: cfg.output_limit_bytes,
            log_dir: cli.log_dir.clone(),
        },
    )?;
    let controller = RunController::new(
        pool,
        ControllerSettings {
            schedule,
            max_phases: cfg.max_phases,
        },
    );

    let stop = controller.run(print_event)?;

    if let Some(path) = &cli.summary_json {
        write_summary_json(path, &stop)?;
    }

    match &stop {
        RunStop::Succeeded(result) => {
            persist_artifact(&cli.out, &result.artifact)?;
            println!("{LINE}");
            println!("Successfully found a model");
            println!("{}", render_success(result, "  "));
            println!();
            println!("Model (also stored in '{}'):", cli.out.display());
            println!("{}", result.artifact.trim_end());
            Ok(exit_codes::OK)
        }
        RunStop::Aborted {
            reason,
            diagnostic,
            totals,
        } => {
            eprintln!("{}", render_abort(*reason, diagnostic, totals));
            Ok(match reason {
                AbortReason::FatalConfig => exit_codes::FATAL_CONFIG,
                AbortReason::CircuitBreaker => exit_codes::CIRCUIT_BREAKER,
            })
        }
        RunStop::PhaseLimitReached { totals } => {
            eprintln!(
                "No model found after {} phases ({} attempts, {} timeouts, {} crashes)",
                totals.phases, totals.total_attempts, totals.total_timeouts, totals.total_crashes
            );
            Ok(exit_codes::PHASE_LIMIT)
        }
    }
}

/// Load the config file and apply command-line overrides.
fn resolve_config(cli: &Cli) -> Result<MimicConfig> {
    let mut cfg = load_config(&cli.config)?;
    match cli.threads {
        Some(t) if t < 0 => cfg.workers = None,
        Some(t) => cfg.workers = Some(usize::try_from(t).context("thread count")?),
        None => {}
    }
    if let Some(core) = &cli.core {
        cfg.core_command = vec![core.clone()];
    }
    cfg.extra_args.extend(split_extra_args(&cli.core_args)?);
    if let Some(t0) = cli.t0 {
        cfg.initial_timeout_secs = t0;
    }
    if let Some(factor) = cli.factor {
        cfg.growth_per_worker = factor;
    }
    if cli.max_phases.is_some() {
        cfg.max_phases = cli.max_phases;
    }
    cfg.validate().context("invalid configuration")?;
    debug!(?cfg, "configuration resolved");
    Ok(cfg)
}

fn build_task(cli: &Cli) -> Task {
    let body = cli.body.clone().unwrap_or_default();
    let mut task = Task::anonymous(&cli.argnames, cli.arguments.clone(), body);
    task.metric = cli.metric;
    task.loop_index = cli.loop_index;
    task
}

/// Hand control to a single instance of mimic-core, which may or may not succeed.
fn run_debug(invoker: &CoreInvoker, task: &Task, out: &Path) -> Result<i32> {
    let artifacts = ArtifactDir::create()?;
    let artifact_path = artifacts.path_for(AttemptId {
        phase: 0,
        worker: 0,
    });

    println!("Running in debug mode");
    println!("Command to run:");
    println!("{}", invoker.verbose_command_line(task, &artifact_path));
    println!("{LINE}");

    let code = invoker.run_verbose(task, &artifact_path)?;
    if code == exit_codes::OK && artifact_path.is_file() {
        let contents = std::fs::read_to_string(&artifact_path)
            .with_context(|| format!("read {}", artifact_path.display()))?;
        persist_artifact(out, &contents)?;
    }
    Ok(code)
}

fn print_event(event: &RunEvent) {
    match event {
        RunEvent::PhaseStarted { phase, timeout, .. } => {
            eprintln!(
                "Starting phase {} with a timeout of {} seconds...",
                phase + 1,
                timeout.as_secs()
            );
        }
        RunEvent::AttemptFinished {
            attempt,
            kind: OutcomeKind::Crash,
            elapsed,
        } => {
            eprintln!(
                "  attempt {attempt} crashed after {:.1} seconds",
                elapsed.as_secs_f64()
            );
        }
        RunEvent::AttemptFinished { .. } => {}
    }
}
