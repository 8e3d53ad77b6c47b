//! Optimizer contract and the SGD implementation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::model::{GradientContext, StateBlob};
use crate::params::{GroupKind, ParameterGroup};

pub trait Optimizer {
    fn param_groups(&self) -> &[ParameterGroup];

    fn param_groups_mut(&mut self) -> &mut [ParameterGroup];

    fn zero_gradients(&mut self, ctx: &mut dyn GradientContext) {
        ctx.zero_gradients();
    }

    /// Apply one update from the gradients accumulated in `ctx`.
    fn step(&mut self, ctx: &mut dyn GradientContext) -> anyhow::Result<()>;

    fn state_snapshot(&self) -> anyhow::Result<StateBlob>;

    fn restore_state(&mut self, blob: &StateBlob) -> anyhow::Result<()>;

    /// Current base learning rate: the weight group's rate, or the first
    /// group's when there is no weight group.
    fn learning_rate(&self) -> Option<f64> {
        let groups = self.param_groups();
        groups
            .iter()
            .find(|g| g.kind == GroupKind::Weight)
            .or_else(|| groups.first())
            .map(|g| g.base_learning_rate)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SgdState {
    momentum: f64,
    groups: Vec<ParameterGroup>,
    momentum_buffers: BTreeMap<usize, Vec<f32>>,
}

/// Stochastic gradient descent with momentum and per-group weight decay.
///
/// Per parameter: `d = g + wd * p`; `buf = momentum * buf + d` (the first
/// step seeds `buf = d`); `p -= lr * buf`.
#[derive(Debug, Clone)]
pub struct Sgd {
    momentum: f64,
    groups: Vec<ParameterGroup>,
    momentum_buffers: BTreeMap<usize, Vec<f32>>,
}

impl Sgd {
    pub fn new(groups: Vec<ParameterGroup>, momentum: f64) -> Self {
        Self {
            momentum,
            groups,
            momentum_buffers: BTreeMap::new(),
        }
    }
}

impl Optimizer for Sgd {
    fn param_groups(&self) -> &[ParameterGroup] {
        &self.groups
    }

    fn param_groups_mut(&mut self) -> &mut [ParameterGroup] {
        &mut self.groups
    }

    fn step(&mut self, ctx: &mut dyn GradientContext) -> anyhow::Result<()> {
        for group in &self.groups {
            let lr = group.base_learning_rate as f32;
            let wd = group.weight_decay as f32;
            for &id in &group.parameters {
                let slot = ctx
                    .slot_mut(id)
                    .ok_or_else(|| anyhow::anyhow!("parameter {} is not in the model", id.0))?;
                anyhow::ensure!(
                    slot.value.len() == slot.grad.len(),
                    "parameter {} has {} values but {} gradients",
                    id.0,
                    slot.value.len(),
                    slot.grad.len()
                );

                let mut update: Vec<f32> = slot
                    .grad
                    .iter()
                    .zip(slot.value.iter())
                    .map(|(g, p)| g + wd * p)
                    .collect();

                if self.momentum != 0.0 {
                    let momentum = self.momentum as f32;
                    match self.momentum_buffers.get_mut(&id.0) {
                        Some(buf) if buf.len() == update.len() => {
                            for (b, d) in buf.iter_mut().zip(&update) {
                                *b = momentum * *b + d;
                            }
                            update.copy_from_slice(buf);
                        }
                        _ => {
                            self.momentum_buffers.insert(id.0, update.clone());
                        }
                    }
                }

                for (p, d) in slot.value.iter_mut().zip(&update) {
                    *p -= lr * d;
                }
            }
        }
        Ok(())
    }

    fn state_snapshot(&self) -> anyhow::Result<StateBlob> {
        let state = SgdState {
            momentum: self.momentum,
            groups: self.groups.clone(),
            momentum_buffers: self.momentum_buffers.clone(),
        };
        Ok(serde_json::to_value(state)?)
    }

    fn restore_state(&mut self, blob: &StateBlob) -> anyhow::Result<()> {
        let state: SgdState = serde_json::from_value(blob.clone())?;
        anyhow::ensure!(
            state.groups.len() == self.groups.len(),
            "optimizer state has {} parameter groups, expected {}",
            state.groups.len(),
            self.groups.len()
        );
        for (saved, current) in state.groups.iter().zip(&self.groups) {
            anyhow::ensure!(
                saved.kind == current.kind && saved.parameters == current.parameters,
                "optimizer state does not match the model's {:?} parameter group",
                current.kind
            );
        }
        self.momentum = state.momentum;
        self.groups = state.groups;
        self.momentum_buffers = state.momentum_buffers;
        Ok(())
    }
}
