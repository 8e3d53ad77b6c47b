//! Checkpoint persistence for resumable training.
//!
//! One artifact per completed epoch, never overwritten:
//!
//! ```text
//! {results_root}/{train_id}/model/
//!   checkpoint1_101.json
//!   checkpoint2_201.json
//! ```
//!
//! The file name carries `(epoch, global_iteration)`. `epoch` is the number
//! of completed epochs, i.e. the index of the epoch a resumed session starts
//! with. Each artifact stores a SHA-256 digest of its two state blobs.
//!
//! Name and stored `epoch` agree, so the first epoch's artifact is
//! `checkpoint1_*`. Files named after the 0-based loop epoch instead
//! (`checkpoint0_4.json` holding `"epoch": 1`) still resume correctly when
//! passed as `model_name`, because resume reads the stored field; only
//! [`CheckpointStore::list`] ordering goes by the name.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::config::TrainingConfig;
use crate::error::CheckpointError;
use crate::model::StateBlob;
use crate::persistence;
use crate::run_layout::RunLayout;

const REQUIRED_FIELDS: [&str; 3] = ["epoch", "model_state", "optimizer_state"];

/// A persisted snapshot of training state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(default)]
    pub train_id: String,
    pub epoch: u32,
    /// Value of the global iteration counter at save time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_iteration: Option<u64>,
    /// Effective base learning rate at save time. Informational; resume
    /// reads the rate back out of `optimizer_state`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub learning_rate: Option<f64>,
    /// Cumulative training wall time in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub train_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    pub model_state: StateBlob,
    pub optimizer_state: StateBlob,
}

impl Checkpoint {
    pub fn new(
        train_id: &str,
        epoch: u32,
        global_iteration: u64,
        model_state: StateBlob,
        optimizer_state: StateBlob,
    ) -> Self {
        let digest = state_digest(&model_state, &optimizer_state);
        Self {
            train_id: train_id.to_string(),
            epoch,
            global_iteration: Some(global_iteration),
            learning_rate: None,
            train_seconds: None,
            saved_at: Some(Utc::now()),
            digest: Some(digest),
            model_state,
            optimizer_state,
        }
    }

    pub fn with_accounting(mut self, learning_rate: f64, train_seconds: f64) -> Self {
        self.learning_rate = Some(learning_rate);
        self.train_seconds = Some(train_seconds);
        self
    }

    /// `true` when there is no stored digest or it matches the blobs.
    pub fn digest_matches(&self) -> bool {
        match &self.digest {
            Some(stored) => *stored == state_digest(&self.model_state, &self.optimizer_state),
            None => true,
        }
    }
}

/// SHA-256 hex digest over the serialized model and optimizer state.
pub fn state_digest(model_state: &StateBlob, optimizer_state: &StateBlob) -> String {
    let mut hasher = Sha256::new();
    hasher.update(model_state.to_string().as_bytes());
    hasher.update(b"\n");
    hasher.update(optimizer_state.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// A checkpoint artifact found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointEntry {
    pub path: PathBuf,
    pub epoch: u32,
    pub global_iteration: u64,
}

/// Owns the on-disk checkpoint format.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    results_root: PathBuf,
}

impl CheckpointStore {
    pub fn new(results_root: impl Into<PathBuf>) -> Self {
        Self {
            results_root: results_root.into(),
        }
    }

    pub fn from_config(config: &TrainingConfig) -> Self {
        Self::new(config.results_root.clone())
    }

    pub fn model_dir(&self, train_id: &str) -> PathBuf {
        RunLayout::new(&self.results_root, train_id).model_dir()
    }

    pub fn artifact_name(epoch: u32, global_iteration: u64) -> String {
        format!("checkpoint{epoch}_{global_iteration}.json")
    }

    /// Write `checkpoint` under its run's model directory. Fails rather than
    /// replace an existing artifact.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<PathBuf, CheckpointError> {
        let iteration = checkpoint.global_iteration.ok_or_else(|| {
            CheckpointError::corrupt(
                self.model_dir(&checkpoint.train_id),
                "cannot name a checkpoint without global_iteration",
            )
        })?;
        let path = self
            .model_dir(&checkpoint.train_id)
            .join(Self::artifact_name(checkpoint.epoch, iteration));

        persistence::create_json(&path, checkpoint).map_err(|e| {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                CheckpointError::AlreadyExists { path: path.clone() }
            } else {
                CheckpointError::io(&path, e)
            }
        })?;

        tracing::debug!(path = %path.display(), epoch = checkpoint.epoch, "checkpoint written");
        Ok(path)
    }

    /// Read a checkpoint back. Missing required fields, malformed JSON and
    /// digest mismatches are all reported as corrupt.
    pub fn load(&self, path: &Path) -> Result<Checkpoint, CheckpointError> {
        let content = std::fs::read_to_string(path).map_err(|e| CheckpointError::io(path, e))?;

        let value: serde_json::Value = serde_json::from_str(&content)
            .map_err(|e| CheckpointError::corrupt(path, format!("not valid JSON: {e}")))?;
        let object = value
            .as_object()
            .ok_or_else(|| CheckpointError::corrupt(path, "top level is not an object"))?;

        for field in REQUIRED_FIELDS {
            match object.get(field) {
                Some(v) if !v.is_null() => {}
                _ => {
                    return Err(CheckpointError::corrupt(
                        path,
                        format!("missing required field `{field}`"),
                    ));
                }
            }
        }

        let checkpoint: Checkpoint = serde_json::from_value(value)
            .map_err(|e| CheckpointError::corrupt(path, e.to_string()))?;

        if !checkpoint.digest_matches() {
            return Err(CheckpointError::corrupt(path, "state digest mismatch"));
        }
        Ok(checkpoint)
    }

    /// Checkpoints of a run, oldest first by `(epoch, global_iteration)`.
    pub fn list(&self, train_id: &str) -> Result<Vec<CheckpointEntry>, CheckpointError> {
        let dir = self.model_dir(train_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let read_dir = std::fs::read_dir(&dir).map_err(|e| CheckpointError::io(&dir, e))?;
        let mut entries = Vec::new();
        for entry in read_dir {
            let entry = entry.map_err(|e| CheckpointError::io(&dir, e))?;
            let name = entry.file_name();
            if let Some((epoch, global_iteration)) = name.to_str().and_then(parse_artifact_name) {
                entries.push(CheckpointEntry {
                    path: entry.path(),
                    epoch,
                    global_iteration,
                });
            }
        }
        entries.sort_by_key(|e| (e.epoch, e.global_iteration));
        Ok(entries)
    }

    pub fn latest(&self, train_id: &str) -> Result<Option<CheckpointEntry>, CheckpointError> {
        Ok(self.list(train_id)?.pop())
    }

    /// Path to resume from: `model_name` inside the run's model directory,
    /// or the latest checkpoint when no name is given.
    pub fn resolve(
        &self,
        train_id: &str,
        model_name: Option<&str>,
    ) -> Result<PathBuf, CheckpointError> {
        match model_name {
            Some(name) => Ok(self.model_dir(train_id).join(name)),
            None => self
                .latest(train_id)?
                .map(|entry| entry.path)
                .ok_or_else(|| CheckpointError::NotFound {
                    train_id: train_id.to_string(),
                }),
        }
    }
}

fn parse_artifact_name(name: &str) -> Option<(u32, u64)> {
    let stem = name.strip_prefix("checkpoint")?.strip_suffix(".json")?;
    let (epoch, iteration) = stem.split_once('_')?;
    Some((epoch.parse().ok()?, iteration.parse().ok()?))
}
