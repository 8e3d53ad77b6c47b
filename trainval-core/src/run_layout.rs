//! Per-run directory tree under `results_root/train_id`.

use std::io;
use std::path::{Path, PathBuf};

use crate::config::TrainingConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLayout {
    root: PathBuf,
}

impl RunLayout {
    pub fn new(results_root: &Path, train_id: &str) -> Self {
        Self {
            root: results_root.join(train_id),
        }
    }

    pub fn from_config(config: &TrainingConfig) -> Self {
        Self::new(&config.results_root, &config.train_id)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("log")
    }

    pub fn model_dir(&self) -> PathBuf {
        self.root.join("model")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.root.join("output")
    }

    /// Create any missing directory of the layout.
    pub fn ensure(&self) -> io::Result<()> {
        for dir in [self.log_dir(), self.model_dir(), self.output_dir()] {
            if !dir.exists() {
                tracing::debug!(dir = %dir.display(), "creating run directory");
                std::fs::create_dir_all(&dir)?;
            }
        }
        Ok(())
    }
}
