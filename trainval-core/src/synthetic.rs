//! Self-contained reference collaborators: a softmax region classifier,
//! a matching scorer, and a seeded synthetic dataset. They drive the CLI
//! and the end-to-end tests without an external tensor runtime.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::batch::{Batch, BatchHolder, GroundTruthBox, ImageInfo, Tensor};
use crate::evaluation::{ScoreAggregate, ScoreBuffer, ScoreSummary, Scorer};
use crate::model::{
    ForwardOutput, GradientContext, Model, NamedParameter, ParamId, ParamSlot, StateBlob,
};

const SCALE: usize = 0;
const WEIGHT: usize = 1;
const BIAS: usize = 2;
const PARAM_NAMES: [&str; 3] = ["backbone.scale", "cls_score.weight", "cls_score.bias"];

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DetectorState {
    num_features: usize,
    num_classes: usize,
    values: Vec<Vec<f32>>,
}

/// Cached activations of the last training-mode forward pass.
#[derive(Debug, Clone)]
struct ForwardCache {
    input: Vec<f32>,
    probabilities: Vec<f32>,
    targets: Vec<usize>,
}

/// Linear softmax classifier over a flat feature vector, with one frozen
/// backbone scale in front. Each ground-truth box contributes one
/// cross-entropy loss element against its class.
#[derive(Debug, Clone)]
pub struct SyntheticDetector {
    num_features: usize,
    num_classes: usize,
    values: Vec<Vec<f32>>,
    grads: Vec<Vec<f32>>,
    training: bool,
    cache: Option<ForwardCache>,
}

impl SyntheticDetector {
    pub fn new(num_features: usize, num_classes: usize) -> Self {
        let values = vec![
            vec![1.0],
            vec![0.0; num_features * num_classes],
            vec![0.0; num_classes],
        ];
        let grads = values.iter().map(|v| vec![0.0; v.len()]).collect();
        Self {
            num_features,
            num_classes,
            values,
            grads,
            training: true,
            cache: None,
        }
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Class probabilities for one feature vector.
    pub fn predict(&self, features: &[f32]) -> anyhow::Result<Vec<f32>> {
        anyhow::ensure!(
            features.len() == self.num_features,
            "expected {} features, got {}",
            self.num_features,
            features.len()
        );
        let scale = self.values[SCALE][0];
        let weight = &self.values[WEIGHT];
        let bias = &self.values[BIAS];

        let logits: Vec<f32> = (0..self.num_classes)
            .map(|c| {
                let row = &weight[c * self.num_features..(c + 1) * self.num_features];
                row.iter().zip(features).map(|(w, x)| w * x * scale).sum::<f32>() + bias[c]
            })
            .collect();
        Ok(softmax(&logits))
    }
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
    let total: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / total).collect()
}

impl GradientContext for SyntheticDetector {
    fn parameter_ids(&self) -> Vec<ParamId> {
        vec![ParamId(WEIGHT), ParamId(BIAS)]
    }

    fn slot_mut(&mut self, id: ParamId) -> Option<ParamSlot<'_>> {
        if id.0 == SCALE {
            return None;
        }
        Some(ParamSlot {
            value: self.values.get_mut(id.0)?,
            grad: self.grads.get_mut(id.0)?,
        })
    }
}

impl Model for SyntheticDetector {
    type Prediction = Vec<f32>;

    fn train_mode(&mut self) {
        self.training = true;
    }

    fn eval_mode(&mut self) {
        self.training = false;
        self.cache = None;
    }

    fn forward_and_loss(&mut self, input: &BatchHolder) -> anyhow::Result<ForwardOutput<Vec<f32>>> {
        let features = input.batch.image.as_slice();
        let probabilities = self.predict(features)?;

        let mut targets = Vec::with_capacity(input.batch.gt_boxes.len());
        let mut loss = Vec::with_capacity(input.batch.gt_boxes.len());
        for gt in &input.batch.gt_boxes {
            let p = probabilities.get(gt.class).ok_or_else(|| {
                anyhow::anyhow!("box class {} outside {} classes", gt.class, self.num_classes)
            })?;
            loss.push(-p.max(f32::MIN_POSITIVE).ln());
            targets.push(gt.class);
        }

        self.cache = self.training.then(|| ForwardCache {
            input: features.to_vec(),
            probabilities: probabilities.clone(),
            targets,
        });
        Ok(ForwardOutput {
            prediction: probabilities,
            loss,
        })
    }

    fn backward(&mut self) -> anyhow::Result<()> {
        let cache = self
            .cache
            .take()
            .ok_or_else(|| anyhow::anyhow!("backward called without a training forward pass"))?;
        anyhow::ensure!(!cache.targets.is_empty(), "no loss elements to backpropagate");

        let n = cache.targets.len() as f32;
        let mut delta = cache.probabilities;
        for &t in &cache.targets {
            delta[t] -= 1.0 / n;
        }

        let scale = self.values[SCALE][0];
        for (c, d) in delta.iter().enumerate() {
            let row = &mut self.grads[WEIGHT][c * self.num_features..(c + 1) * self.num_features];
            for (g, x) in row.iter_mut().zip(&cache.input) {
                *g += d * x * scale;
            }
            self.grads[BIAS][c] += d;
        }
        Ok(())
    }

    fn parameters_named(&self) -> Vec<NamedParameter> {
        PARAM_NAMES
            .iter()
            .enumerate()
            .map(|(i, name)| NamedParameter {
                name: (*name).to_string(),
                id: ParamId(i),
                requires_grad: i != SCALE,
            })
            .collect()
    }

    fn state_snapshot(&self) -> anyhow::Result<StateBlob> {
        let state = DetectorState {
            num_features: self.num_features,
            num_classes: self.num_classes,
            values: self.values.clone(),
        };
        Ok(serde_json::to_value(state)?)
    }

    fn restore_state(&mut self, blob: &StateBlob) -> anyhow::Result<()> {
        let state: DetectorState = serde_json::from_value(blob.clone())?;
        anyhow::ensure!(
            state.num_features == self.num_features && state.num_classes == self.num_classes,
            "model state is {}x{}, expected {}x{}",
            state.num_classes,
            state.num_features,
            self.num_classes,
            self.num_features
        );
        anyhow::ensure!(
            state.values.len() == self.values.len()
                && state.values.iter().zip(&self.values).all(|(a, b)| a.len() == b.len()),
            "model state parameter shapes do not match"
        );
        self.values = state.values;
        self.zero_gradients();
        self.cache = None;
        Ok(())
    }
}

/// Scores class-probability predictions against known labels.
///
/// Per instance: mean probability of the true class, top-1 accuracy, and
/// average precision of instances ranked by confidence. Per class: the same
/// three figures computed one class at a time and averaged over the classes
/// present in the labels.
#[derive(Debug, Clone)]
pub struct SyntheticScorer {
    labels: Vec<usize>,
    num_classes: usize,
}

impl SyntheticScorer {
    pub fn new(labels: Vec<usize>, num_classes: usize) -> Self {
        Self {
            labels,
            num_classes,
        }
    }
}

impl Scorer<Vec<f32>> for SyntheticScorer {
    fn evaluate(
        &mut self,
        buffer: ScoreBuffer<Vec<f32>>,
        clip_region: bool,
    ) -> anyhow::Result<ScoreSummary> {
        anyhow::ensure!(
            buffer.len() == self.labels.len(),
            "buffer holds {} samples, have {} labels",
            buffer.len(),
            self.labels.len()
        );
        let mut predictions = buffer.into_vec()?;
        for p in &predictions {
            anyhow::ensure!(
                p.len() == self.num_classes,
                "prediction has {} classes, expected {}",
                p.len(),
                self.num_classes
            );
        }
        if clip_region {
            for p in &mut predictions {
                p.iter_mut().for_each(|v| *v = v.clamp(0.0, 1.0));
            }
        }

        let predicted: Vec<usize> = predictions.iter().map(|p| argmax(p)).collect();

        let per_instance = {
            let n = self.labels.len() as f64;
            let score = self
                .labels
                .iter()
                .zip(&predictions)
                .map(|(&l, p)| f64::from(p[l]))
                .sum::<f64>()
                / n;
            let correct: Vec<bool> = self
                .labels
                .iter()
                .zip(&predicted)
                .map(|(l, p)| l == p)
                .collect();
            let accuracy = correct.iter().filter(|&&c| c).count() as f64 / n;
            let confidence: Vec<f32> = predictions
                .iter()
                .zip(&predicted)
                .map(|(p, &k)| p[k])
                .collect();
            ScoreAggregate {
                score,
                accuracy,
                precision: average_precision(&confidence, &correct),
            }
        };

        let mut class_scores = Vec::new();
        for class in 0..self.num_classes {
            let members: Vec<usize> = (0..self.labels.len())
                .filter(|&i| self.labels[i] == class)
                .collect();
            if members.is_empty() {
                continue;
            }
            let m = members.len() as f64;
            let score = members
                .iter()
                .map(|&i| f64::from(predictions[i][class]))
                .sum::<f64>()
                / m;
            let accuracy = members.iter().filter(|&&i| predicted[i] == class).count() as f64 / m;
            let confidence: Vec<f32> = predictions.iter().map(|p| p[class]).collect();
            let relevant: Vec<bool> = self.labels.iter().map(|&l| l == class).collect();
            class_scores.push(ScoreAggregate {
                score,
                accuracy,
                precision: average_precision(&confidence, &relevant),
            });
        }
        let k = class_scores.len().max(1) as f64;
        let per_class = ScoreAggregate {
            score: class_scores.iter().map(|s| s.score).sum::<f64>() / k,
            accuracy: class_scores.iter().map(|s| s.accuracy).sum::<f64>() / k,
            precision: class_scores.iter().map(|s| s.precision).sum::<f64>() / k,
        };

        Ok(ScoreSummary {
            per_class,
            per_instance,
        })
    }
}

fn argmax(values: &[f32]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (i, &v)| {
            if v > best.1 { (i, v) } else { best }
        })
        .0
}

/// Mean of precision@k over the ranks k of relevant items, ranking by
/// descending confidence. Zero when nothing is relevant.
fn average_precision(confidence: &[f32], relevant: &[bool]) -> f64 {
    let mut order: Vec<usize> = (0..confidence.len()).collect();
    order.sort_by(|&a, &b| confidence[b].total_cmp(&confidence[a]));

    let mut hits = 0usize;
    let mut sum = 0.0f64;
    for (rank, &i) in order.iter().enumerate() {
        if relevant[i] {
            hits += 1;
            sum += hits as f64 / (rank + 1) as f64;
        }
    }
    if hits == 0 { 0.0 } else { sum / hits as f64 }
}

/// Train and validation batches plus the validation labels.
#[derive(Debug, Clone)]
pub struct SyntheticSplit {
    pub train: Vec<Batch>,
    pub val: Vec<Batch>,
    pub val_labels: Vec<usize>,
}

/// Gaussian-ish class clusters: each class gets a random centre in
/// `[-1, 1]^num_features`, and each sample is its class centre plus
/// uniform noise. Every sample carries one box labelled with its class.
pub fn synthetic_split(
    seed: u64,
    num_features: usize,
    num_classes: usize,
    train_len: usize,
    val_len: usize,
) -> anyhow::Result<SyntheticSplit> {
    anyhow::ensure!(num_features > 0, "num_features must be positive");
    anyhow::ensure!(num_classes > 0, "num_classes must be positive");

    let mut rng = StdRng::seed_from_u64(seed);
    let centres: Vec<Vec<f32>> = (0..num_classes)
        .map(|_| (0..num_features).map(|_| rng.gen_range(-1.0f32..1.0)).collect())
        .collect();

    let sample = |rng: &mut StdRng| -> (Batch, usize) {
        let class = rng.gen_range(0..num_classes);
        let features: Vec<f32> = centres[class]
            .iter()
            .map(|c| c + rng.gen_range(-0.3f32..0.3))
            .collect();
        let x1 = rng.gen_range(0.0f32..32.0);
        let y1 = rng.gen_range(0.0f32..32.0);
        let batch = Batch {
            image: Tensor::vector(features),
            info: ImageInfo {
                height: 64.0,
                width: 64.0,
                scale: 1.0,
            },
            gt_boxes: vec![GroundTruthBox {
                x1,
                y1,
                x2: x1 + rng.gen_range(4.0f32..32.0),
                y2: y1 + rng.gen_range(4.0f32..32.0),
                class,
            }],
        };
        (batch, class)
    };

    let train = (0..train_len).map(|_| sample(&mut rng).0).collect();
    let (val, val_labels): (Vec<Batch>, Vec<usize>) = (0..val_len).map(|_| sample(&mut rng)).unzip();
    Ok(SyntheticSplit {
        train,
        val,
        val_labels,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::Placement;
    use crate::optim::{Optimizer, Sgd};
    use crate::params::{GroupKind, ParameterGroup};

    fn holder(features: Vec<f32>, class: usize) -> BatchHolder {
        BatchHolder::new(
            Batch {
                image: Tensor::vector(features),
                info: ImageInfo {
                    height: 1.0,
                    width: 1.0,
                    scale: 1.0,
                },
                gt_boxes: vec![GroundTruthBox {
                    x1: 0.0,
                    y1: 0.0,
                    x2: 1.0,
                    y2: 1.0,
                    class,
                }],
            },
            Placement::Host,
        )
    }

    #[test]
    fn test_initial_loss_is_uniform() {
        let mut model = SyntheticDetector::new(3, 4);
        let out = model.forward_and_loss(&holder(vec![1.0, 2.0, 3.0], 1)).unwrap();
        assert_eq!(out.loss.len(), 1);
        assert!((out.mean_loss().unwrap() - 4f64.ln()).abs() < 1e-5);
    }

    #[test]
    fn test_backward_fills_gradients() {
        let mut model = SyntheticDetector::new(2, 2);
        model.forward_and_loss(&holder(vec![1.0, 0.5], 0)).unwrap();
        model.backward().unwrap();
        // p = [0.5, 0.5], target 0 -> delta = [-0.5, 0.5]
        assert_eq!(model.grads[BIAS], vec![-0.5, 0.5]);
        assert_eq!(model.grads[WEIGHT], vec![-0.5, -0.25, 0.5, 0.25]);
        assert!(model.backward().is_err());
    }

    #[test]
    fn test_frozen_scale_is_not_trainable() {
        let mut model = SyntheticDetector::new(2, 2);
        let named = model.parameters_named();
        assert_eq!(named[0].name, "backbone.scale");
        assert!(!named[0].requires_grad);
        assert!(model.slot_mut(ParamId(SCALE)).is_none());
        assert_eq!(model.parameter_ids(), vec![ParamId(WEIGHT), ParamId(BIAS)]);
    }

    #[test]
    fn test_sgd_reduces_loss() {
        let mut model = SyntheticDetector::new(2, 2);
        let mut sgd = Sgd::new(
            vec![
                ParameterGroup {
                    kind: GroupKind::Weight,
                    parameters: vec![ParamId(WEIGHT)],
                    base_learning_rate: 0.5,
                    weight_decay: 0.0,
                },
                ParameterGroup {
                    kind: GroupKind::Bias,
                    parameters: vec![ParamId(BIAS)],
                    base_learning_rate: 0.5,
                    weight_decay: 0.0,
                },
            ],
            0.0,
        );
        let input = holder(vec![1.0, -1.0], 1);
        let first = model.forward_and_loss(&input).unwrap().mean_loss().unwrap();
        for _ in 0..10 {
            sgd.zero_gradients(&mut model);
            model.forward_and_loss(&input).unwrap();
            model.backward().unwrap();
            sgd.step(&mut model).unwrap();
        }
        let last = model.forward_and_loss(&input).unwrap().mean_loss().unwrap();
        assert!(last < first, "{last} !< {first}");
    }

    #[test]
    fn test_eval_mode_disables_backward() {
        let mut model = SyntheticDetector::new(2, 2);
        model.eval_mode();
        model.forward_and_loss(&holder(vec![1.0, 0.5], 0)).unwrap();
        assert!(model.backward().is_err());
    }

    #[test]
    fn test_snapshot_restore() {
        let mut model = SyntheticDetector::new(2, 3);
        model.values[WEIGHT][4] = 0.75;
        let blob = model.state_snapshot().unwrap();

        let mut other = SyntheticDetector::new(2, 3);
        other.restore_state(&blob).unwrap();
        assert_eq!(other.values, model.values);

        let mut wrong = SyntheticDetector::new(3, 3);
        assert!(wrong.restore_state(&blob).is_err());
    }

    #[test]
    fn test_scorer_perfect_predictions() {
        let mut buffer = ScoreBuffer::with_len(3);
        buffer.insert(0, vec![1.0, 0.0]).unwrap();
        buffer.insert(1, vec![0.0, 1.0]).unwrap();
        buffer.insert(2, vec![1.0, 0.0]).unwrap();
        let mut scorer = SyntheticScorer::new(vec![0, 1, 0], 2);
        let summary = scorer.evaluate(buffer, true).unwrap();

        let perfect = ScoreAggregate {
            score: 1.0,
            accuracy: 1.0,
            precision: 1.0,
        };
        assert_eq!(summary.per_instance, perfect);
        assert_eq!(summary.per_class, perfect);
    }

    #[test]
    fn test_scorer_clips_region_scores() {
        let mut buffer = ScoreBuffer::with_len(1);
        buffer.insert(0, vec![1.5, -0.5]).unwrap();
        let mut scorer = SyntheticScorer::new(vec![0], 2);
        let summary = scorer.evaluate(buffer, true).unwrap();
        assert_eq!(summary.per_instance.score, 1.0);
    }

    #[test]
    fn test_scorer_length_mismatch() {
        let buffer: ScoreBuffer<Vec<f32>> = ScoreBuffer::with_len(2);
        let mut scorer = SyntheticScorer::new(vec![0], 2);
        assert!(scorer.evaluate(buffer, true).is_err());
    }

    #[test]
    fn test_average_precision() {
        assert_eq!(average_precision(&[0.9, 0.8, 0.1], &[true, false, true]), (1.0 + 2.0 / 3.0) / 2.0);
        assert_eq!(average_precision(&[0.5], &[false]), 0.0);
    }

    #[test]
    fn test_split_is_seeded() {
        let a = synthetic_split(3, 4, 3, 5, 2).unwrap();
        let b = synthetic_split(3, 4, 3, 5, 2).unwrap();
        assert_eq!(a.train, b.train);
        assert_eq!(a.val_labels, b.val_labels);
        assert_eq!(a.train.len(), 5);
        assert_eq!(a.val.len(), 2);
        assert_eq!(a.val[0].gt_boxes[0].class, a.val_labels[0]);
        assert!(synthetic_split(3, 0, 3, 5, 2).is_err());
    }
}
