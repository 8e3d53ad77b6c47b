//! Training session configuration.
//!
//! Uses `figment` for layered configuration: defaults -> config file ->
//! environment (`TRAINVAL_*`) -> explicit overrides (normally CLI flags).
//! One immutable [`TrainingConfig`] is passed by reference into every
//! component constructor; nothing reads ambient configuration.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::ConfigError;

/// Network architecture variant. Only used to decide whether gradients are
/// clipped; the architecture itself lives behind the `Model` trait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetKind {
    Vgg16,
    Res50,
}

impl NetKind {
    pub fn requires_gradient_clipping(self) -> bool {
        matches!(self, NetKind::Vgg16)
    }
}

impl FromStr for NetKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vgg16" => Ok(NetKind::Vgg16),
            "res50" => Ok(NetKind::Res50),
            other => Err(ConfigError::UnknownNetwork {
                kind: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for NetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetKind::Vgg16 => f.write_str("vgg16"),
            NetKind::Res50 => f.write_str("res50"),
        }
    }
}

/// Optimizer family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerKind {
    Sgd,
}

impl FromStr for OptimizerKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sgd" => Ok(OptimizerKind::Sgd),
            other => Err(ConfigError::UnknownOptimizer {
                kind: other.to_string(),
            }),
        }
    }
}

/// Every option a training session recognises.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Run namespace; checkpoints and logs live under `results_root/train_id`.
    pub train_id: String,
    /// Network variant (`vgg16` or `res50`).
    pub net: String,
    /// Optimizer kind (`sgd`).
    pub optimizer: String,
    /// Must be 1.
    pub batch_size: usize,
    pub max_epochs: u32,
    /// Hard cap on the global iteration counter.
    pub max_iterations: u64,
    pub learning_rate: f64,
    /// Decay fires when `global_iteration % (lr_decay_step + 1) == 0`.
    pub lr_decay_step: u64,
    pub lr_decay_gamma: f64,
    pub momentum: f64,
    pub weight_decay: f64,
    /// Bias parameters train at twice the base rate.
    pub double_bias: bool,
    /// Apply weight decay to bias parameters.
    pub bias_decay: bool,
    /// Log and record telemetry every this many steps.
    pub disp_interval: u64,
    pub num_workers: usize,
    pub resume: bool,
    /// Checkpoint file name to resume from; the latest one when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    pub use_accelerator: bool,
    pub rng_seed: u64,
    pub results_root: PathBuf,
    /// Max global gradient norm for networks that clip.
    pub clip_norm: f64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            train_id: "default".to_string(),
            net: "vgg16".to_string(),
            optimizer: "sgd".to_string(),
            batch_size: 1,
            max_epochs: 20,
            max_iterations: 200_000,
            learning_rate: 1e-3,
            lr_decay_step: 50_000,
            lr_decay_gamma: 0.1,
            momentum: 0.9,
            weight_decay: 5e-4,
            double_bias: true,
            bias_decay: false,
            disp_interval: 100,
            num_workers: 1,
            resume: false,
            model_name: None,
            use_accelerator: false,
            rng_seed: 3,
            results_root: PathBuf::from("data/results"),
            clip_norm: 10.0,
        }
    }
}

impl TrainingConfig {
    /// Check every constraint that must hold before any session state is
    /// built. The batch-size check comes first.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size != 1 {
            return Err(ConfigError::UnsupportedBatchSize {
                batch_size: self.batch_size,
            });
        }
        self.optimizer_kind()?;
        self.net_kind()?;

        if self.train_id.is_empty() || self.train_id.contains(['/', '\\']) || self.train_id == ".." {
            return Err(ConfigError::Invalid {
                field: "train_id",
                reason: format!("'{}' is not a valid directory name", self.train_id),
            });
        }
        if self.disp_interval == 0 {
            return Err(ConfigError::Invalid {
                field: "disp_interval",
                reason: "must be at least 1".to_string(),
            });
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(ConfigError::Invalid {
                field: "learning_rate",
                reason: format!("must be a positive number, got {}", self.learning_rate),
            });
        }
        if !(self.lr_decay_gamma.is_finite() && self.lr_decay_gamma > 0.0) {
            return Err(ConfigError::Invalid {
                field: "lr_decay_gamma",
                reason: format!("must be a positive number, got {}", self.lr_decay_gamma),
            });
        }
        if !(0.0..1.0).contains(&self.momentum) {
            return Err(ConfigError::Invalid {
                field: "momentum",
                reason: format!("must be in [0, 1), got {}", self.momentum),
            });
        }
        if !(self.weight_decay.is_finite() && self.weight_decay >= 0.0) {
            return Err(ConfigError::Invalid {
                field: "weight_decay",
                reason: format!("must be non-negative, got {}", self.weight_decay),
            });
        }
        if !(self.clip_norm.is_finite() && self.clip_norm > 0.0) {
            return Err(ConfigError::Invalid {
                field: "clip_norm",
                reason: format!("must be a positive number, got {}", self.clip_norm),
            });
        }
        Ok(())
    }

    pub fn net_kind(&self) -> Result<NetKind, ConfigError> {
        self.net.parse()
    }

    pub fn optimizer_kind(&self) -> Result<OptimizerKind, ConfigError> {
        self.optimizer.parse()
    }
}

/// Explicit overrides, typically built from CLI flags. Unset fields leave the
/// lower layers untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub train_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub net: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub optimizer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_epochs: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub learning_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lr_decay_step: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lr_decay_gamma: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub momentum: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight_decay: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub double_bias: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bias_decay: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disp_interval: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_workers: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_accelerator: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rng_seed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results_root: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clip_norm: Option<f64>,
}

/// Load configuration with layered merging.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides
/// 2. Environment variables (`TRAINVAL_MAX_EPOCHS`, `TRAINVAL_LEARNING_RATE`, ...)
/// 3. The TOML file at `file`, when given
/// 4. Built-in defaults
///
/// The result is not validated; call [`TrainingConfig::validate`].
pub fn load_config(
    file: Option<&Path>,
    overrides: Option<&ConfigOverrides>,
) -> Result<TrainingConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(TrainingConfig::default()));

    if let Some(path) = file {
        if !path.exists() {
            return Err(ConfigError::Parse {
                message: format!("config file not found: {}", path.display()),
            });
        }
        figment = figment.merge(Toml::file(path));
    }

    figment = figment.merge(Env::prefixed("TRAINVAL_"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(|e| ConfigError::Parse {
        message: e.to_string(),
    })
}
