use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// Parameter names used when none are given on the command line.
pub const DEFAULT_ARGNAMES: &str = "arg0, arg1, arg2, arg3, arg4, arg5, arg6";

/// The opaque function to model, as handed to `mimic-core`.
///
/// Built once per run and shared read-only by every worker.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
    pub name: String,
    pub param_names: Vec<String>,
    /// Argument tuples as source text, e.g. `[1, 2]`.
    pub arguments: Vec<String>,
    pub body: String,
    /// Loop template index hint forwarded as `--loop`.
    pub loop_index: Option<u32>,
    /// Selects the scoring function inside the core (`--metric`).
    pub metric: Option<u32>,
}

impl Task {
    /// Build an anonymous task from command-line style inputs.
    pub fn anonymous(argnames: &str, arguments: Vec<String>, body: impl Into<String>) -> Self {
        Self {
            name: "anon".to_string(),
            param_names: parse_argnames(argnames),
            arguments,
            body: body.into(),
            loop_index: None,
            metric: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.body.trim().is_empty() {
            bail!("task {} has an empty function body", self.name);
        }
        if self.arguments.is_empty() {
            bail!("task {} needs at least one argument tuple", self.name);
        }
        if self.param_names.is_empty() {
            bail!("task {} has no parameter names", self.name);
        }
        if let Some(bad) = self.param_names.iter().find(|n| !is_identifier(n)) {
            bail!("task {} has an invalid parameter name '{bad}'", self.name);
        }
        Ok(())
    }

    /// Parameter names in the comma-joined form the core expects.
    pub fn argnames_arg(&self) -> String {
        self.param_names.join(",")
    }
}

/// Split `"x, y ,z"` into `["x", "y", "z"]`, dropping empty entries.
pub fn parse_argnames(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_' || c == '$')
}
