//! Model contract and the opaque gradient context.

use serde::{Deserialize, Serialize};

use crate::batch::BatchHolder;

/// Opaque serialized state of a model or optimizer.
pub type StateBlob = serde_json::Value;

/// Stable handle of one parameter tensor within a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParamId(pub usize);

/// A named parameter as reported by [`Model::parameters_named`].
#[derive(Debug, Clone, PartialEq)]
pub struct NamedParameter {
    pub name: String,
    pub id: ParamId,
    pub requires_grad: bool,
}

/// Mutable view of one parameter's values and accumulated gradient.
pub struct ParamSlot<'a> {
    pub value: &'a mut [f32],
    pub grad: &'a mut [f32],
}

/// Access to parameters and gradients, owned by the model. The optimizer
/// and gradient clipping go through this; the controller never inspects it.
pub trait GradientContext {
    /// Ids of every trainable parameter.
    fn parameter_ids(&self) -> Vec<ParamId>;

    fn slot_mut(&mut self, id: ParamId) -> Option<ParamSlot<'_>>;

    fn zero_gradients(&mut self) {
        for id in self.parameter_ids() {
            if let Some(slot) = self.slot_mut(id) {
                slot.grad.fill(0.0);
            }
        }
    }
}

/// Result of one forward pass: the prediction and the per-element loss.
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardOutput<P> {
    pub prediction: P,
    pub loss: Vec<f32>,
}

impl<P> ForwardOutput<P> {
    /// Mean of the per-element loss, `None` when the model produced no
    /// loss elements.
    pub fn mean_loss(&self) -> Option<f64> {
        if self.loss.is_empty() {
            return None;
        }
        let sum: f64 = self.loss.iter().map(|&l| f64::from(l)).sum();
        Some(sum / self.loss.len() as f64)
    }
}

/// A detection model as seen by the training loop.
pub trait Model: GradientContext {
    /// Per-sample inference output collected into the score buffer.
    type Prediction;

    fn train_mode(&mut self);

    fn eval_mode(&mut self);

    fn forward_and_loss(
        &mut self,
        input: &BatchHolder,
    ) -> anyhow::Result<ForwardOutput<Self::Prediction>>;

    /// Backpropagate the mean of the last forward pass's loss into the
    /// accumulated gradients.
    fn backward(&mut self) -> anyhow::Result<()>;

    fn parameters_named(&self) -> Vec<NamedParameter>;

    fn state_snapshot(&self) -> anyhow::Result<StateBlob>;

    fn restore_state(&mut self, blob: &StateBlob) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_loss_reduces_elements() {
        let out = ForwardOutput {
            prediction: (),
            loss: vec![1.0, 2.0, 3.0, 6.0],
        };
        assert_eq!(out.mean_loss(), Some(3.0));
    }

    #[test]
    fn test_mean_loss_empty() {
        let out = ForwardOutput {
            prediction: (),
            loss: Vec::new(),
        };
        assert_eq!(out.mean_loss(), None);
    }
}
