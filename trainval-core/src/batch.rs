//! Batches, the current-batch holder, and the batch producer contract.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

/// Dense row-major `f32` tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl Tensor {
    pub fn vector(data: Vec<f32>) -> Self {
        Self {
            shape: vec![data.len()],
            data,
        }
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }
}

/// Per-image metadata: height, width and the resize scale applied.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub height: f32,
    pub width: f32,
    pub scale: f32,
}

/// One annotated box in image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GroundTruthBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub class: usize,
}

/// A single image with its metadata and annotations. Batch size is always 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub image: Tensor,
    pub info: ImageInfo,
    pub gt_boxes: Vec<GroundTruthBox>,
}

/// Where the current batch is expected to live when the model consumes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Placement {
    #[default]
    Host,
    Accelerator,
}

impl Placement {
    pub fn from_flag(use_accelerator: bool) -> Self {
        if use_accelerator {
            Placement::Accelerator
        } else {
            Placement::Host
        }
    }
}

/// The batch being consumed this iteration. Replaced wholesale each step,
/// never mutated in place.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchHolder {
    pub batch: Batch,
    pub placement: Placement,
}

impl BatchHolder {
    pub fn new(batch: Batch, placement: Placement) -> Self {
        Self { batch, placement }
    }
}

/// Lazy, finite, restartable-per-epoch source of batches.
///
/// The controller only sees a blocking `next_batch`; implementations may
/// prefetch on worker threads internally.
pub trait BatchProducer {
    /// Number of batches one epoch yields.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rewind to the start of a new epoch.
    fn start_epoch(&mut self) -> anyhow::Result<()>;

    /// Next batch of the current epoch, `None` once exhausted.
    fn next_batch(&mut self) -> anyhow::Result<Option<Batch>>;
}

/// Producer over batches held in memory. Sequential producers keep a fixed
/// order across epochs; shuffled producers draw a fresh permutation per
/// epoch from a seeded RNG.
pub struct InMemoryProducer {
    batches: Vec<Batch>,
    order: Vec<usize>,
    cursor: usize,
    rng: Option<StdRng>,
}

impl InMemoryProducer {
    pub fn sequential(batches: Vec<Batch>) -> Self {
        let order = (0..batches.len()).collect();
        Self {
            batches,
            order,
            cursor: 0,
            rng: None,
        }
    }

    pub fn shuffled(batches: Vec<Batch>, seed: u64) -> Self {
        let mut producer = Self::sequential(batches);
        producer.rng = Some(StdRng::seed_from_u64(seed));
        producer
    }
}

impl BatchProducer for InMemoryProducer {
    fn len(&self) -> usize {
        self.batches.len()
    }

    fn start_epoch(&mut self) -> anyhow::Result<()> {
        self.cursor = 0;
        if let Some(rng) = self.rng.as_mut() {
            self.order.shuffle(rng);
        }
        Ok(())
    }

    fn next_batch(&mut self) -> anyhow::Result<Option<Batch>> {
        let Some(&index) = self.order.get(self.cursor) else {
            return Ok(None);
        };
        self.cursor += 1;
        Ok(Some(self.batches[index].clone()))
    }
}
