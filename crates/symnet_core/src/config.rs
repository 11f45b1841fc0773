use crate::error::{config_err, Result};
use crate::primitives::Catalogue;
use crate::regularization::HardConcreteParams;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Standard deviations of the truncated-normal weight initialization.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InitConfig {
    /// First hidden layer.
    pub sd_first: f64,
    /// Hidden layers after the first.
    pub sd_middle: f64,
    /// Output layer.
    pub sd_last: f64,
}

impl Default for InitConfig {
    fn default() -> Self {
        Self {
            sd_first: 0.1,
            sd_middle: 0.5,
            sd_last: 1.0,
        }
    }
}

/// Hyper-parameters of one training trial. Every field has a default, so a config file only
/// needs to list what it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub n_layers: usize,
    pub catalogue: Catalogue,
    /// Weight of the expected-active-gate penalty in the loss.
    pub reg_weight: f64,
    /// Learning rate of the warmup stage.
    pub learning_rate: f64,
    pub warmup_epochs: usize,
    /// Length of the stage after the one-off learning-rate decay.
    pub n_epochs1: usize,
    /// Length of the fine-tune stage.
    pub n_epochs2: usize,
    pub decay_factor: f64,
    pub fine_tune_factor: f64,
    /// Checkpoint interval in epochs.
    pub summary_step: usize,
    pub init: InitConfig,
    pub gate: HardConcreteParams,
    /// Restarts allowed after a diverged attempt before the trial fails.
    pub max_restarts: usize,
    /// `None` seeds from entropy.
    pub seed: Option<u64>,
    /// Coefficients at or below this magnitude are left out of the extracted expression.
    pub prune_threshold: f64,
    pub var_names: Vec<String>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            n_layers: 2,
            catalogue: Catalogue::standard(),
            reg_weight: 5e-3,
            learning_rate: 1e-1,
            warmup_epochs: 2000,
            n_epochs1: 10001,
            n_epochs2: 10001,
            decay_factor: 0.1,
            fine_tune_factor: 1.0,
            summary_step: 1000,
            init: InitConfig::default(),
            gate: HardConcreteParams::default(),
            max_restarts: 10,
            seed: None,
            prune_threshold: 0.0,
            var_names: vec!["x".into(), "y".into(), "z".into()],
        }
    }
}

impl TrainConfig {
    /// Reads a TOML file and validates it.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config = Self::from_toml(&text)
            .with_context(|| format!("invalid config file {}", path.display()))?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(text).context("failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> anyhow::Result<String> {
        toml::to_string(self).context("failed to serialize config")
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("learning_rate", self.learning_rate),
            ("decay_factor", self.decay_factor),
            ("fine_tune_factor", self.fine_tune_factor),
            ("init.sd_first", self.init.sd_first),
            ("init.sd_middle", self.init.sd_middle),
            ("init.sd_last", self.init.sd_last),
        ];
        for (name, value) in positive {
            if !(value > 0.0 && value.is_finite()) {
                return Err(config_err(format!("{name} must be positive and finite, got {value}")));
            }
        }
        if !(self.reg_weight >= 0.0 && self.reg_weight.is_finite()) {
            return Err(config_err(format!(
                "reg_weight must be non-negative, got {}",
                self.reg_weight
            )));
        }
        if !(self.prune_threshold >= 0.0) {
            return Err(config_err("prune_threshold must be non-negative"));
        }
        if self.summary_step == 0 {
            return Err(config_err("summary_step must be at least 1"));
        }
        if self.var_names.is_empty() {
            return Err(config_err("var_names must not be empty"));
        }
        self.gate.validate()
    }

    /// Flat key/value view for result tables.
    pub fn to_record(&self) -> BTreeMap<String, serde_json::Value> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map.into_iter().collect(),
            _ => BTreeMap::new(),
        }
    }
}
