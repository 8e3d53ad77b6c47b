//! Held-out evaluation: one inference pass over the validation split,
//! then a single scoring call over the collected predictions.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::batch::{BatchHolder, BatchProducer, Placement};
use crate::config::TrainingConfig;
use crate::error::TrainError;
use crate::model::Model;

/// Index-aligned prediction slots, one per validation sample.
#[derive(Debug, Clone)]
pub struct ScoreBuffer<P> {
    slots: Vec<Option<P>>,
}

impl<P> ScoreBuffer<P> {
    pub fn with_len(len: usize) -> Self {
        Self {
            slots: std::iter::repeat_with(|| None).take(len).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Store the prediction for sample `index`. Each slot is written once.
    pub fn insert(&mut self, index: usize, prediction: P) -> anyhow::Result<()> {
        let len = self.slots.len();
        let slot = self
            .slots
            .get_mut(index)
            .ok_or_else(|| anyhow::anyhow!("sample index {index} outside buffer of {len}"))?;
        anyhow::ensure!(slot.is_none(), "sample {index} was already scored");
        *slot = Some(prediction);
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    /// Predictions in sample order. Fails if any slot is still empty.
    pub fn into_vec(self) -> anyhow::Result<Vec<P>> {
        self.slots
            .into_iter()
            .enumerate()
            .map(|(i, slot)| slot.ok_or_else(|| anyhow::anyhow!("sample {i} has no prediction")))
            .collect()
    }
}

/// Score, accuracy and average precision at one granularity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreAggregate {
    pub score: f64,
    pub accuracy: f64,
    pub precision: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreSummary {
    pub per_class: ScoreAggregate,
    pub per_instance: ScoreAggregate,
}

/// Outcome of one evaluation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub epoch: u32,
    pub global_iteration: u64,
    pub samples: usize,
    pub mean_loss: f64,
    pub scores: ScoreSummary,
}

impl EvaluationReport {
    /// Scorer metrics under their telemetry keys.
    pub fn metrics(&self) -> [(&'static str, f64); 6] {
        let c = &self.scores.per_class;
        let i = &self.scores.per_instance;
        [
            ("mcls_sc", c.score),
            ("mcls_ac", c.accuracy),
            ("mcls_ap", c.precision),
            ("mins_sc", i.score),
            ("mins_ac", i.accuracy),
            ("mins_ap", i.precision),
        ]
    }
}

/// Turns the filled buffer into aggregate scores. Called once per pass.
pub trait Scorer<P> {
    fn evaluate(&mut self, buffer: ScoreBuffer<P>, clip_region: bool)
    -> anyhow::Result<ScoreSummary>;
}

#[derive(Debug, Clone, Copy)]
pub struct EvaluationPass {
    disp_interval: u64,
    clip_region: bool,
}

impl EvaluationPass {
    pub fn new(config: &TrainingConfig) -> Self {
        Self {
            disp_interval: config.disp_interval.max(1),
            clip_region: true,
        }
    }

    /// Run the model over every sample of `producer`, in order, and score
    /// the result. The model is left in inference mode.
    pub fn run<M: Model>(
        &self,
        model: &mut M,
        producer: &mut dyn BatchProducer,
        scorer: &mut dyn Scorer<M::Prediction>,
        epoch: u32,
        global_iteration: u64,
        placement: Placement,
    ) -> Result<EvaluationReport, TrainError> {
        let fail = |msg: String| TrainError::evaluation(epoch, msg);

        let expected = producer.len();
        if expected == 0 {
            return Err(fail("validation split is empty".to_string()));
        }

        model.eval_mode();
        producer
            .start_epoch()
            .map_err(|e| fail(format!("cannot rewind validation producer: {e:#}")))?;

        let mut buffer = ScoreBuffer::with_len(expected);
        let mut loss_sum = 0.0f64;
        let mut seen = 0usize;

        while let Some(batch) = producer
            .next_batch()
            .map_err(|e| fail(format!("validation producer failed at sample {seen}: {e:#}")))?
        {
            if seen >= expected {
                return Err(fail(format!(
                    "validation producer yielded more than its declared {expected} samples"
                )));
            }

            let holder = BatchHolder::new(batch, placement);
            let output = model
                .forward_and_loss(&holder)
                .map_err(|e| fail(format!("forward pass failed at sample {seen}: {e:#}")))?;
            let loss = output
                .mean_loss()
                .ok_or_else(|| fail(format!("model produced no loss for sample {seen}")))?;
            if seen as u64 % self.disp_interval == 0 {
                info!(epoch, sample = seen, total = expected, loss, "evaluating");
            }
            loss_sum += loss;
            buffer
                .insert(seen, output.prediction)
                .map_err(|e| fail(format!("{e:#}")))?;
            seen += 1;
        }

        if seen != expected {
            return Err(fail(format!(
                "validation producer yielded {seen} of {expected} samples"
            )));
        }

        let scores = scorer
            .evaluate(buffer, self.clip_region)
            .map_err(|e| fail(format!("scoring failed: {e:#}")))?;
        let mean_loss = loss_sum / expected as f64;
        debug!(epoch, mean_loss, "evaluation pass complete");

        Ok(EvaluationReport {
            epoch,
            global_iteration,
            samples: expected,
            mean_loss,
            scores,
        })
    }
}
