//! Per-run artifact storage.
//!
//! Every attempt writes its model to its own file inside a private temporary
//! directory, so cancelling one attempt can never touch another's artifact.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tempfile::TempDir;
use tracing::debug;

use crate::core::types::AttemptId;

/// Temporary directory holding the artifacts of one run.
///
/// Removed when dropped.
#[derive(Debug)]
pub struct ArtifactDir {
    dir: TempDir,
}

impl ArtifactDir {
    pub fn create() -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("mimic-")
            .tempdir()
            .context("create artifact directory")?;
        debug!(dir = %dir.path().display(), "artifact directory created");
        Ok(Self { dir })
    }

    /// Artifact location for one attempt. Unique per `(phase, worker)`.
    pub fn path_for(&self, attempt: AttemptId) -> PathBuf {
        self.dir
            .path()
            .join(format!("result-p{}-w{}.js", attempt.phase, attempt.worker))
    }
}

/// Read a finished attempt's artifact.
pub fn read_artifact(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("read artifact {}", path.display()))
}

/// Atomically write the winning artifact to its destination (temp file + rename).
pub fn persist_artifact(dest: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = dest.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    }
    let mut tmp_name = dest.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp artifact {}", tmp_path.display()))?;
    fs::rename(&tmp_path, dest).with_context(|| format!("replace artifact {}", dest.display()))?;
    Ok(())
}
