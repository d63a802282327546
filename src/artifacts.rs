use anyhow::Context;
use chrono::Utc;
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::debug;

/// The directory receiving job files, raw tool output and the final report. It is created on
/// first write.
#[derive(Debug, Clone)]
pub struct OutputDir {
    path: PathBuf,
}
impl OutputDir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persists raw tool output as `<unix timestamp>_<label>.json`.
    ///
    /// # Arguments
    ///
    /// * `label` - Role qualified label, keeps concurrent writers on separate paths.
    /// * `contents` - The text exactly as captured.
    ///
    /// # Returns
    ///
    /// The path of the written artifact.
    pub fn persist_raw(&self, label: &str, contents: &str) -> anyhow::Result<PathBuf> {
        let timestamp = Utc::now().timestamp();
        self.write(&format!("{}_{}.json", timestamp, label), contents)
    }

    /// Persists diagnostic text (stderr, timeouts) as `<unix timestamp>_<label>.log`.
    pub fn persist_log(&self, label: &str, contents: &str) -> anyhow::Result<PathBuf> {
        let timestamp = Utc::now().timestamp();
        self.write(&format!("{}_{}.log", timestamp, label), contents)
    }

    pub fn write(&self, file_name: &str, contents: &str) -> anyhow::Result<PathBuf> {
        fs::create_dir_all(&self.path).with_context(|| {
            format!("Unable to create output directory {}", self.path.display())
        })?;

        let file_path = self.path.join(file_name);
        fs::write(&file_path, contents)
            .with_context(|| format!("Unable to write {}", file_path.display()))?;
        debug!("wrote {}", file_path.display());

        Ok(file_path)
    }
}
