//! Partitioning of trainable parameters into learning-rate/decay groups.

use serde::{Deserialize, Serialize};

use crate::config::TrainingConfig;
use crate::model::{NamedParameter, ParamId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupKind {
    Weight,
    Bias,
}

/// Parameters sharing a learning rate and weight decay. Only
/// `base_learning_rate` changes after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterGroup {
    pub kind: GroupKind,
    pub parameters: Vec<ParamId>,
    pub base_learning_rate: f64,
    pub weight_decay: f64,
}

/// Builds the weight and bias groups once at session start.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterGroupPolicy {
    learning_rate: f64,
    weight_decay: f64,
    double_bias: bool,
    bias_decay: bool,
}

impl ParameterGroupPolicy {
    pub fn new(config: &TrainingConfig) -> Self {
        Self {
            learning_rate: config.learning_rate,
            weight_decay: config.weight_decay,
            double_bias: config.double_bias,
            bias_decay: config.bias_decay,
        }
    }

    /// Multiplier applied to the base rate for bias parameters.
    pub fn bias_multiplier(&self) -> f64 {
        if self.double_bias { 2.0 } else { 1.0 }
    }

    /// Partition into exactly two groups, weight group first. Frozen
    /// parameters are left out.
    pub fn partition(&self, params: &[NamedParameter]) -> Vec<ParameterGroup> {
        let (bias, weight): (Vec<&NamedParameter>, Vec<&NamedParameter>) = params
            .iter()
            .filter(|p| p.requires_grad)
            .partition(|p| p.name.contains("bias"));

        vec![
            ParameterGroup {
                kind: GroupKind::Weight,
                parameters: weight.iter().map(|p| p.id).collect(),
                base_learning_rate: self.learning_rate,
                weight_decay: self.weight_decay,
            },
            ParameterGroup {
                kind: GroupKind::Bias,
                parameters: bias.iter().map(|p| p.id).collect(),
                base_learning_rate: self.learning_rate * self.bias_multiplier(),
                weight_decay: if self.bias_decay { self.weight_decay } else { 0.0 },
            },
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn param(name: &str, id: usize, requires_grad: bool) -> NamedParameter {
        NamedParameter {
            name: name.to_string(),
            id: ParamId(id),
            requires_grad,
        }
    }

    fn sample_params() -> Vec<NamedParameter> {
        vec![
            param("base.conv1.weight", 0, false),
            param("base.conv1.bias", 1, false),
            param("rcnn.fc6.weight", 2, true),
            param("rcnn.fc6.bias", 3, true),
            param("cls_score.weight", 4, true),
            param("cls_score.bias", 5, true),
        ]
    }

    #[test]
    fn test_double_bias_without_bias_decay() {
        let cfg = TrainingConfig {
            learning_rate: 0.01,
            weight_decay: 5e-4,
            double_bias: true,
            bias_decay: false,
            ..Default::default()
        };
        let groups = ParameterGroupPolicy::new(&cfg).partition(&sample_params());

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].kind, GroupKind::Weight);
        assert_eq!(groups[0].parameters, vec![ParamId(2), ParamId(4)]);
        assert_eq!(groups[0].base_learning_rate, 0.01);
        assert_eq!(groups[0].weight_decay, 5e-4);

        assert_eq!(groups[1].kind, GroupKind::Bias);
        assert_eq!(groups[1].parameters, vec![ParamId(3), ParamId(5)]);
        assert_eq!(groups[1].base_learning_rate, 0.02);
        assert_eq!(groups[1].weight_decay, 0.0);
    }

    #[test]
    fn test_single_bias_with_bias_decay() {
        let cfg = TrainingConfig {
            learning_rate: 0.01,
            weight_decay: 1e-4,
            double_bias: false,
            bias_decay: true,
            ..Default::default()
        };
        let groups = ParameterGroupPolicy::new(&cfg).partition(&sample_params());
        assert_eq!(groups[1].base_learning_rate, 0.01);
        assert_eq!(groups[1].weight_decay, 1e-4);
    }

    #[test]
    fn test_frozen_parameters_excluded() {
        let cfg = TrainingConfig::default();
        let groups = ParameterGroupPolicy::new(&cfg).partition(&sample_params());
        let all: Vec<ParamId> = groups.iter().flat_map(|g| g.parameters.clone()).collect();
        assert!(!all.contains(&ParamId(0)));
        assert!(!all.contains(&ParamId(1)));
        assert_eq!(all.len(), 4);
    }

    #[test]
    fn test_empty_groups_still_present() {
        let cfg = TrainingConfig::default();
        let groups = ParameterGroupPolicy::new(&cfg).partition(&[param("fc.weight", 0, true)]);
        assert_eq!(groups.len(), 2);
        assert!(groups[1].parameters.is_empty());
    }
}
