//! Orchestrator configuration, read from `mimic.toml` by default.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::schedule::{DEFAULT_GROWTH_PER_WORKER, DEFAULT_INITIAL_TIMEOUT_SECS};

pub const DEFAULT_CONFIG_PATH: &str = "mimic.toml";

/// Orchestrator configuration (TOML).
///
/// Every field has a default, so a missing file or a partial file is fine.
/// Command-line flags override whatever is loaded here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MimicConfig {
    /// Core executable followed by fixed leading arguments.
    pub core_command: Vec<String>,

    /// Iteration cap passed to every core search.
    pub core_iterations: u64,

    /// Extra arguments appended to every core invocation.
    pub extra_args: Vec<String>,

    /// Worker count; `None` means half the available cores.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,

    /// Timeout of the first phase, in seconds.
    pub initial_timeout_secs: f64,

    /// Per-worker timeout growth rate between phases.
    pub growth_per_worker: f64,

    /// Stop after this many phases; `None` searches until success or abort.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_phases: Option<u32>,

    /// Truncate captured core output beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for MimicConfig {
    fn default() -> Self {
        Self {
            core_command: vec!["mimic-core".to_string()],
            core_iterations: 100_000_000,
            extra_args: Vec::new(),
            workers: None,
            initial_timeout_secs: DEFAULT_INITIAL_TIMEOUT_SECS,
            growth_per_worker: DEFAULT_GROWTH_PER_WORKER,
            max_phases: None,
            output_limit_bytes: 1_000_000,
        }
    }
}

impl MimicConfig {
    pub fn validate(&self) -> Result<()> {
        if self.core_command.is_empty() || self.core_command[0].trim().is_empty() {
            return Err(anyhow!("core_command must be a non-empty array"));
        }
        if self.core_iterations == 0 {
            return Err(anyhow!("core_iterations must be > 0"));
        }
        if self.workers == Some(0) {
            return Err(anyhow!("workers must be > 0"));
        }
        if !self.initial_timeout_secs.is_finite() || self.initial_timeout_secs < 1.0 {
            return Err(anyhow!("initial_timeout_secs must be >= 1"));
        }
        if !self.growth_per_worker.is_finite() || self.growth_per_worker < 1.0 {
            return Err(anyhow!("growth_per_worker must be >= 1.0"));
        }
        if self.max_phases == Some(0) {
            return Err(anyhow!("max_phases must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        Ok(())
    }

    /// Resolved worker count.
    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(default_workers)
    }
}

/// Half of the available processing units, at least one.
pub fn default_workers() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2);
    (cores / 2).max(1)
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `MimicConfig::default()`.
pub fn load_config(path: &Path) -> Result<MimicConfig> {
    if !path.exists() {
        let cfg = MimicConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: MimicConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &MimicConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
