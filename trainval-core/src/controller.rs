//! The training loop controller.
//!
//! Drives the session state machine:
//!
//! ```text
//! Idle -> Running(epoch, step) -> Evaluating(epoch) -> Checkpointing(epoch)
//!      -> Running(epoch + 1, 0) -> ... -> Terminated
//! ```
//!
//! The controller exclusively owns the model, the optimizer and the
//! producers for the lifetime of a session.

use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{info, trace, warn};

use crate::batch::{BatchHolder, BatchProducer, Placement};
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::clip::clip_grad_norm;
use crate::config::{NetKind, TrainingConfig};
use crate::error::{ConfigError, Phase, TrainError};
use crate::evaluation::{EvaluationPass, EvaluationReport, Scorer};
use crate::model::Model;
use crate::optim::Optimizer;
use crate::params::{ParameterGroup, ParameterGroupPolicy};
use crate::run_layout::RunLayout;
use crate::schedule::LearningRateSchedule;
use crate::summary::{Termination, TrainingSummary};
use crate::telemetry::TelemetrySink;

/// Mutable session counters. Only the controller writes these.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingState {
    pub current_epoch: u32,
    pub global_iteration: u64,
    /// `global_iteration` when this session began.
    pub start_iteration: u64,
    pub learning_rate: f64,
    pub max_epochs: u32,
    pub max_iterations: u64,
    pub iterations_per_epoch: u64,
    /// Cumulative training wall time, evaluation excluded.
    pub train_seconds: f64,
    /// Optimizer steps whose time is included in `train_seconds`.
    pub timed_iterations: u64,
    /// Completed epochs whose time is included in `train_seconds`.
    pub timed_epochs: u32,
    /// Share of `train_seconds` spent in completed epochs.
    pub epoch_seconds: f64,
}

impl TrainingState {
    fn fresh(config: &TrainingConfig, iterations_per_epoch: u64, learning_rate: f64) -> Self {
        Self {
            current_epoch: 0,
            global_iteration: 1,
            start_iteration: 1,
            learning_rate,
            max_epochs: config.max_epochs,
            max_iterations: config.max_iterations,
            iterations_per_epoch,
            train_seconds: 0.0,
            timed_iterations: 0,
            timed_epochs: 0,
            epoch_seconds: 0.0,
        }
    }

    pub fn iterations_run(&self) -> u64 {
        self.global_iteration - self.start_iteration
    }

    fn cap_reached(&self) -> bool {
        self.global_iteration > self.max_iterations
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopPhase {
    Idle,
    Running { epoch: u32, step: u64 },
    Evaluating { epoch: u32 },
    Checkpointing { epoch: u32 },
    Terminated(Termination),
}

/// Producers, scorer and optional telemetry handed to the controller.
pub struct Collaborators<P> {
    pub train: Box<dyn BatchProducer>,
    pub val: Box<dyn BatchProducer>,
    pub scorer: Box<dyn Scorer<P>>,
    pub telemetry: Option<Box<dyn TelemetrySink>>,
}

enum EpochOutcome {
    Completed,
    Truncated,
}

pub struct TrainingLoopController<'cfg, M: Model, O: Optimizer> {
    config: &'cfg TrainingConfig,
    net: NetKind,
    placement: Placement,
    schedule: LearningRateSchedule,
    evaluation: EvaluationPass,
    store: CheckpointStore,
    model: M,
    optimizer: O,
    train: Box<dyn BatchProducer>,
    val: Box<dyn BatchProducer>,
    scorer: Box<dyn Scorer<M::Prediction>>,
    telemetry: Option<Box<dyn TelemetrySink>>,
    state: TrainingState,
    phase: LoopPhase,
}

impl<'cfg, M: Model, O: Optimizer> TrainingLoopController<'cfg, M, O> {
    /// Validate `config`, then construct the model and optimizer through the
    /// factories. Neither factory runs if validation fails. Resumes from a
    /// checkpoint when `config.resume` is set.
    pub fn build<FM, FO>(
        config: &'cfg TrainingConfig,
        make_model: FM,
        make_optimizer: FO,
        collaborators: Collaborators<M::Prediction>,
    ) -> Result<Self, TrainError>
    where
        FM: FnOnce(&TrainingConfig) -> anyhow::Result<M>,
        FO: FnOnce(Vec<ParameterGroup>, &TrainingConfig) -> anyhow::Result<O>,
    {
        config.validate()?;
        let net = config.net_kind()?;

        let iterations_per_epoch = collaborators.train.len() as u64;
        if iterations_per_epoch == 0 {
            return Err(ConfigError::Invalid {
                field: "train split",
                reason: "the training producer yields no batches".to_string(),
            }
            .into());
        }

        RunLayout::from_config(config).ensure()?;

        let model = make_model(config)
            .map_err(|e| TrainError::computation(Phase::Startup, format!("{e:#}")))?;
        let groups = ParameterGroupPolicy::new(config).partition(&model.parameters_named());
        let optimizer = make_optimizer(groups, config)
            .map_err(|e| TrainError::computation(Phase::Startup, format!("{e:#}")))?;
        let learning_rate = optimizer.learning_rate().unwrap_or(config.learning_rate);

        info!(
            train_id = %config.train_id,
            net = %net,
            iterations_per_epoch,
            max_epochs = config.max_epochs,
            max_iterations = config.max_iterations,
            num_workers = config.num_workers,
            learning_rate,
            "training session initialised"
        );

        let mut controller = Self {
            config,
            net,
            placement: Placement::from_flag(config.use_accelerator),
            schedule: LearningRateSchedule::from_config(config),
            evaluation: EvaluationPass::new(config),
            store: CheckpointStore::from_config(config),
            model,
            optimizer,
            train: collaborators.train,
            val: collaborators.val,
            scorer: collaborators.scorer,
            telemetry: collaborators.telemetry,
            state: TrainingState::fresh(config, iterations_per_epoch, learning_rate),
            phase: LoopPhase::Idle,
        };

        if config.resume {
            let path = controller
                .store
                .resolve(&config.train_id, config.model_name.as_deref())?;
            controller.resume_from(&path)?;
        }
        Ok(controller)
    }

    /// Restore model and optimizer state from `path`. The learning rate is
    /// read back from the restored optimizer.
    pub fn resume_from(&mut self, path: &Path) -> Result<(), TrainError> {
        info!(path = %path.display(), "loading checkpoint");
        let checkpoint = self.store.load(path)?;

        self.model
            .restore_state(&checkpoint.model_state)
            .map_err(|e| TrainError::computation(Phase::Resume, format!("{e:#}")))?;
        self.optimizer
            .restore_state(&checkpoint.optimizer_state)
            .map_err(|e| TrainError::computation(Phase::Resume, format!("{e:#}")))?;

        let state = &mut self.state;
        state.current_epoch = checkpoint.epoch;
        state.learning_rate = self
            .optimizer
            .learning_rate()
            .unwrap_or(state.learning_rate);
        state.global_iteration = checkpoint.global_iteration.unwrap_or_else(|| {
            u64::from(checkpoint.epoch) * state.iterations_per_epoch + 1
        });
        state.start_iteration = state.global_iteration;
        // Checkpoints are only written at epoch boundaries, so stored time
        // covers exactly the completed epochs and their iterations.
        match checkpoint.train_seconds {
            Some(seconds) => {
                state.train_seconds = seconds;
                state.epoch_seconds = seconds;
                state.timed_iterations = state.global_iteration.saturating_sub(1);
                state.timed_epochs = state.current_epoch;
            }
            None => {
                state.train_seconds = 0.0;
                state.epoch_seconds = 0.0;
                state.timed_iterations = 0;
                state.timed_epochs = 0;
            }
        }

        info!(
            epoch = state.current_epoch,
            global_iteration = state.global_iteration,
            lr = state.learning_rate,
            "resumed from checkpoint"
        );
        Ok(())
    }

    /// Run epochs until `max_epochs` is reached or the iteration cap trips.
    pub fn run(&mut self) -> Result<TrainingSummary, TrainError> {
        let session_start_epoch = self.state.current_epoch;
        let mut checkpoints = Vec::new();
        let mut reports = Vec::new();

        let termination = loop {
            if self.state.current_epoch >= self.state.max_epochs {
                break Termination::EpochLimit;
            }
            let epoch = self.state.current_epoch;

            if let EpochOutcome::Truncated = self.train_epoch(epoch)? {
                info!(
                    epoch,
                    global_iteration = self.state.global_iteration,
                    "iteration cap reached mid-epoch"
                );
                break Termination::IterationCap;
            }

            self.phase = LoopPhase::Evaluating { epoch };
            let report = self.evaluation.run(
                &mut self.model,
                self.val.as_mut(),
                self.scorer.as_mut(),
                epoch,
                self.state.global_iteration,
                self.placement,
            )?;
            self.log_report(&report);
            reports.push(report);

            self.state.current_epoch += 1;
            self.phase = LoopPhase::Checkpointing { epoch };
            if let Some(path) = self.save_checkpoint() {
                checkpoints.push(path);
            }

            if self.state.cap_reached() {
                break Termination::IterationCap;
            }
        };
        self.phase = LoopPhase::Terminated(termination);

        if let Some(sink) = self.telemetry.as_mut() {
            if let Err(e) = sink.flush() {
                warn!(error = %e, "failed to flush telemetry");
            }
        }

        let summary = TrainingSummary {
            termination,
            epochs_completed: self.state.current_epoch - session_start_epoch,
            final_epoch: self.state.current_epoch,
            start_iteration: self.state.start_iteration,
            global_iteration: self.state.global_iteration,
            iterations_run: self.state.iterations_run(),
            train_seconds: self.state.train_seconds,
            timed_iterations: self.state.timed_iterations,
            timed_epochs: self.state.timed_epochs,
            epoch_seconds: self.state.epoch_seconds,
            checkpoints,
            reports,
        };

        info!(termination = ?termination, "training finished");
        info!("Total training time: {:.3}s", summary.train_seconds);
        if let Some(per_epoch) = summary.seconds_per_epoch() {
            info!("Time per epoch: {per_epoch:.3}s");
        }
        if let Some(per_iteration) = summary.seconds_per_iteration() {
            info!("Time per iteration: {per_iteration:.6}s");
        }
        Ok(summary)
    }

    fn train_epoch(&mut self, epoch: u32) -> Result<EpochOutcome, TrainError> {
        self.model.train_mode();
        self.train
            .start_epoch()
            .map_err(|e| TrainError::computation(Phase::Training, format!("{e:#}")))?;

        let started = Instant::now();
        let disp_interval = self.config.disp_interval.max(1);

        for step in 0..self.state.iterations_per_epoch {
            if self.state.cap_reached() {
                self.state.train_seconds += started.elapsed().as_secs_f64();
                return Ok(EpochOutcome::Truncated);
            }
            self.phase = LoopPhase::Running { epoch, step };

            let loss = self.train_step(step)?;
            self.state.timed_iterations += 1;

            // Only the displayed step's own loss is reported.
            if step % disp_interval == 0 {
                info!(
                    epoch,
                    step,
                    iterations_per_epoch = self.state.iterations_per_epoch,
                    global_iteration = self.state.global_iteration,
                    loss,
                    lr = self.state.learning_rate,
                    "train"
                );
                self.emit("loss", loss);
                self.emit("lr", self.state.learning_rate);
            }
        }

        let elapsed = started.elapsed().as_secs_f64();
        self.state.train_seconds += elapsed;
        self.state.epoch_seconds += elapsed;
        self.state.timed_epochs += 1;
        Ok(EpochOutcome::Completed)
    }

    /// One optimization step. Returns the mean loss of the batch.
    fn train_step(&mut self, step: u64) -> Result<f64, TrainError> {
        let fail = |e: anyhow::Error| TrainError::computation(Phase::Training, format!("{e:#}"));

        if self
            .schedule
            .apply(self.state.global_iteration, self.optimizer.param_groups_mut())
        {
            self.state.learning_rate = self
                .optimizer
                .learning_rate()
                .unwrap_or(self.state.learning_rate * self.schedule.gamma());
            info!(
                global_iteration = self.state.global_iteration,
                lr = self.state.learning_rate,
                "learning rate decayed"
            );
        }

        let batch = self.train.next_batch().map_err(fail)?.ok_or_else(|| {
            TrainError::computation(
                Phase::Training,
                format!(
                    "training producer ran dry at step {step} of {}",
                    self.state.iterations_per_epoch
                ),
            )
        })?;
        let holder = BatchHolder::new(batch, self.placement);

        self.optimizer.zero_gradients(&mut self.model);
        let output = self.model.forward_and_loss(&holder).map_err(fail)?;
        let loss = output.mean_loss().ok_or_else(|| {
            TrainError::computation(Phase::Training, "model produced no loss elements")
        })?;
        self.model.backward().map_err(fail)?;

        if self.net.requires_gradient_clipping() {
            let norm = clip_grad_norm(&mut self.model, self.config.clip_norm);
            trace!(norm, "gradient norm before clipping");
        }
        self.optimizer.step(&mut self.model).map_err(fail)?;
        self.state.global_iteration += 1;
        Ok(loss)
    }

    fn log_report(&mut self, report: &EvaluationReport) {
        let [mcls_sc, mcls_ac, mcls_ap, mins_sc, mins_ac, mins_ap] =
            report.metrics().map(|(_, v)| v);
        info!(
            epoch = report.epoch,
            global_iteration = report.global_iteration,
            eval_loss = report.mean_loss,
            mcls_sc,
            mcls_ac,
            mcls_ap,
            mins_sc,
            mins_ac,
            mins_ap,
            "evaluation"
        );
        self.emit("eval_loss", report.mean_loss);
        for (key, value) in report.metrics() {
            self.emit(key, value);
        }
    }

    /// Persist the current state. Failures are logged and training goes on.
    fn save_checkpoint(&mut self) -> Option<PathBuf> {
        let model_state = match self.model.state_snapshot() {
            Ok(s) => s,
            Err(e) => {
                warn!(
                    phase = %Phase::Checkpoint,
                    error = %format!("{e:#}"),
                    "could not snapshot model, skipping checkpoint"
                );
                return None;
            }
        };
        let optimizer_state = match self.optimizer.state_snapshot() {
            Ok(s) => s,
            Err(e) => {
                warn!(
                    phase = %Phase::Checkpoint,
                    error = %format!("{e:#}"),
                    "could not snapshot optimizer, skipping checkpoint"
                );
                return None;
            }
        };

        let checkpoint = Checkpoint::new(
            &self.config.train_id,
            self.state.current_epoch,
            self.state.global_iteration,
            model_state,
            optimizer_state,
        )
        .with_accounting(self.state.learning_rate, self.state.train_seconds);

        match self.store.save(&checkpoint) {
            Ok(path) => {
                info!(path = %path.display(), "saved checkpoint");
                Some(path)
            }
            Err(e) => {
                warn!(
                    phase = %Phase::Checkpoint,
                    error = %e,
                    "failed to save checkpoint, continuing"
                );
                None
            }
        }
    }

    fn emit(&mut self, key: &str, value: f64) {
        let step = self.state.global_iteration;
        if let Some(sink) = self.telemetry.as_mut() {
            if let Err(e) = sink.record(key, value, step) {
                warn!(key, error = %e, "telemetry record dropped");
            }
        }
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn phase(&self) -> LoopPhase {
        self.phase
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn optimizer(&self) -> &O {
        &self.optimizer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::InMemoryProducer;
    use crate::optim::Sgd;
    use crate::synthetic::{SyntheticDetector, SyntheticScorer, synthetic_split};
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> TrainingConfig {
        TrainingConfig {
            train_id: "unit".to_string(),
            results_root: dir.path().to_path_buf(),
            max_epochs: 1,
            disp_interval: 1,
            ..TrainingConfig::default()
        }
    }

    fn collaborators(train_len: usize) -> Collaborators<Vec<f32>> {
        let split = synthetic_split(5, 3, 2, train_len, 2).unwrap();
        Collaborators {
            train: Box::new(InMemoryProducer::sequential(split.train)),
            val: Box::new(InMemoryProducer::sequential(split.val)),
            scorer: Box::new(SyntheticScorer::new(split.val_labels, 2)),
            telemetry: None,
        }
    }

    type Controller<'a> = TrainingLoopController<'a, SyntheticDetector, Sgd>;

    fn build<'a>(cfg: &'a TrainingConfig, c: Collaborators<Vec<f32>>) -> Result<Controller<'a>, TrainError> {
        TrainingLoopController::build(
            cfg,
            |_| Ok(SyntheticDetector::new(3, 2)),
            |groups, cfg| Ok(Sgd::new(groups, cfg.momentum)),
            c,
        )
    }

    #[test]
    fn test_fresh_state() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir);
        let controller = build(&cfg, collaborators(4)).unwrap();
        let state = controller.state();
        assert_eq!(state.current_epoch, 0);
        assert_eq!(state.global_iteration, 1);
        assert_eq!(state.iterations_per_epoch, 4);
        assert_eq!(state.learning_rate, cfg.learning_rate);
        assert_eq!(controller.phase(), LoopPhase::Idle);
        assert!(dir.path().join("unit/log").is_dir());
    }

    #[test]
    fn test_empty_training_split_rejected() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir);
        let err = build(&cfg, collaborators(0)).err().unwrap();
        assert!(matches!(err, TrainError::Config(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_run_reaches_epoch_limit() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir);
        let mut controller = build(&cfg, collaborators(3)).unwrap();
        let summary = controller.run().unwrap();

        assert_eq!(summary.termination, Termination::EpochLimit);
        assert_eq!(summary.iterations_run, 3);
        assert_eq!(summary.checkpoints.len(), 1);
        assert_eq!(
            controller.phase(),
            LoopPhase::Terminated(Termination::EpochLimit)
        );
        assert!(!controller.model().is_training());
    }

    #[test]
    fn test_resume_without_checkpoint_fails() {
        let dir = TempDir::new().unwrap();
        let cfg = TrainingConfig {
            resume: true,
            ..config(&dir)
        };
        let err = build(&cfg, collaborators(3)).err().unwrap();
        assert_eq!(err.phase(), Phase::Resume);
    }
}
