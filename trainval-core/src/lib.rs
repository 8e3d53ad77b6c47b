//! # trainval-core: resumable train/validate orchestration
//!
//! Drives an iterative optimizer over a detection model: epoch and
//! iteration bookkeeping, stepped learning-rate decay, per-epoch evaluation
//! on a held-out split, and checkpoints that a later session resumes from.
//!
//! The model, optimizer, batch producers and scorer are collaborators behind
//! traits; [`synthetic`] provides a self-contained set used by the CLI and
//! the tests.

// Foundation
pub mod config;
pub mod error;
pub mod persistence;
pub mod run_layout;
pub mod telemetry;

// Collaborator contracts
pub mod batch;
pub mod model;
pub mod optim;

// Training components
pub mod checkpoint;
pub mod clip;
pub mod controller;
pub mod evaluation;
pub mod params;
pub mod schedule;
pub mod summary;

// Reference collaborators
pub mod synthetic;

// Re-exports
pub use batch::{Batch, BatchHolder, BatchProducer, InMemoryProducer, Placement};
pub use checkpoint::{Checkpoint, CheckpointEntry, CheckpointStore};
pub use config::{ConfigOverrides, NetKind, OptimizerKind, TrainingConfig, load_config};
pub use controller::{Collaborators, LoopPhase, TrainingLoopController, TrainingState};
pub use error::{CheckpointError, ConfigError, Phase, TelemetryError, TrainError};
pub use evaluation::{EvaluationPass, EvaluationReport, ScoreBuffer, ScoreSummary, Scorer};
pub use model::{GradientContext, Model, StateBlob};
pub use optim::{Optimizer, Sgd};
pub use params::{GroupKind, ParameterGroup, ParameterGroupPolicy};
pub use run_layout::RunLayout;
pub use schedule::LearningRateSchedule;
pub use summary::{Termination, TrainingSummary};
pub use telemetry::{CsvScalarSink, MemorySink, NullSink, TelemetrySink};
