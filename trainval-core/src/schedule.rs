//! Stepped learning-rate decay driven by the global iteration counter.
//!
//! Decay fires when `iteration % (decay_step + 1) == 0`, checked once per
//! iteration before the optimizer step. There is no floor on the rate.

use crate::config::TrainingConfig;
use crate::params::ParameterGroup;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LearningRateSchedule {
    period: u64,
    gamma: f64,
}

impl LearningRateSchedule {
    pub fn new(decay_step: u64, gamma: f64) -> Self {
        Self {
            period: decay_step.saturating_add(1),
            gamma,
        }
    }

    pub fn from_config(config: &TrainingConfig) -> Self {
        Self::new(config.lr_decay_step, config.lr_decay_gamma)
    }

    pub fn gamma(&self) -> f64 {
        self.gamma
    }

    pub fn should_decay(&self, global_iteration: u64) -> bool {
        global_iteration % self.period == 0
    }

    /// Scale every group's rate by gamma if decay fires at
    /// `global_iteration`. Returns whether it fired.
    pub fn apply(&self, global_iteration: u64, groups: &mut [ParameterGroup]) -> bool {
        if !self.should_decay(global_iteration) {
            return false;
        }
        for group in groups.iter_mut() {
            group.base_learning_rate *= self.gamma;
        }
        true
    }
}
