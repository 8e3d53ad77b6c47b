//! Error types for the trainval core.
//!
//! Uses `thiserror` for the public taxonomy. Collaborator traits (model,
//! optimizer, producer, scorer) return `anyhow::Result` so implementations
//! can attach context; the controller folds those into [`TrainError`] with
//! the [`Phase`] that failed.

use std::fmt;
use std::path::PathBuf;

/// Session phase in which a fatal error happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Startup,
    Resume,
    Training,
    Evaluation,
    Checkpoint,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Startup => "startup",
            Phase::Resume => "resume",
            Phase::Training => "training step",
            Phase::Evaluation => "evaluation",
            Phase::Checkpoint => "checkpoint",
        };
        f.write_str(name)
    }
}

/// Top-level error type for a training session.
#[derive(Debug, thiserror::Error)]
pub enum TrainError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Loading or locating the checkpoint to resume from failed.
    #[error("Resume failed: {0}")]
    Resume(#[from] CheckpointError),

    #[error("Computation failed during {phase}: {message}")]
    Computation { phase: Phase, message: String },

    #[error("Evaluation failed at epoch {epoch}: {message}")]
    Evaluation { epoch: u32, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TrainError {
    pub fn computation(phase: Phase, err: impl fmt::Display) -> Self {
        Self::Computation {
            phase,
            message: err.to_string(),
        }
    }

    pub fn evaluation(epoch: u32, msg: impl Into<String>) -> Self {
        Self::Evaluation {
            epoch,
            message: msg.into(),
        }
    }

    /// The phase a fatal error should be reported under.
    pub fn phase(&self) -> Phase {
        match self {
            TrainError::Config(_) => Phase::Startup,
            TrainError::Resume(_) => Phase::Resume,
            TrainError::Computation { phase, .. } => *phase,
            TrainError::Evaluation { .. } => Phase::Evaluation,
            TrainError::Io(_) => Phase::Startup,
        }
    }
}

/// Errors from the configuration layer. All of them are raised before any
/// model or optimizer is constructed.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("batch size must be 1, got {batch_size}")]
    UnsupportedBatchSize { batch_size: usize },

    #[error("unknown optimizer kind: {kind}")]
    UnknownOptimizer { kind: String },

    #[error("unknown network kind: {kind}")]
    UnknownNetwork { kind: String },

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("configuration parse error: {message}")]
    Parse { message: String },
}

/// Errors from the checkpoint store.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("corrupt checkpoint {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("checkpoint already exists: {path}")]
    AlreadyExists { path: PathBuf },

    #[error("no checkpoint found for run '{train_id}'")]
    NotFound { train_id: String },

    #[error("checkpoint IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl CheckpointError {
    pub fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors from a telemetry sink. Always recovered by the controller.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("telemetry write failed: {0}")]
    Write(#[from] std::io::Error),

    #[error("telemetry sink rejected '{key}': {reason}")]
    Rejected { key: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_named_in_message() {
        let err = TrainError::computation(Phase::Training, "backward produced NaN");
        assert_eq!(
            err.to_string(),
            "Computation failed during training step: backward produced NaN"
        );
        assert_eq!(err.phase(), Phase::Training);
    }

    #[test]
    fn test_corrupt_checkpoint_reports_resume() {
        let err: TrainError = CheckpointError::corrupt("/tmp/ck.json", "missing field `epoch`").into();
        assert_eq!(err.phase(), Phase::Resume);
        assert!(err.to_string().contains("missing field `epoch`"));
    }

    #[test]
    fn test_unreadable_checkpoint_reports_resume() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "No such file or directory");
        let err: TrainError = CheckpointError::io("/tmp/run/model/nope.json", io).into();
        assert_eq!(err.phase(), Phase::Resume);
        assert!(err.to_string().starts_with("Resume failed:"), "{err}");
    }

    #[test]
    fn test_config_error_reports_startup() {
        let err: TrainError = ConfigError::UnsupportedBatchSize { batch_size: 4 }.into();
        assert_eq!(err.phase(), Phase::Startup);
        assert!(err.to_string().contains("batch size must be 1"));
    }
}
