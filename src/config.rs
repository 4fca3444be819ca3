use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Printable ASCII without the trailing whitespace controls: digits, letters,
/// punctuation and the space character.
pub const DEFAULT_CHARSET: &str = "0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ!\"#$%&'()*+,-./:;<=>?@[\\]^_`{|}~ ";

/// Hyperparameters of the encoder-decoder network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Number of stacked encoder layers (and decoder layers).
    pub num_layers: i64,
    /// Inner dimension of the position-wise feed-forward network.
    pub units: i64,
    pub d_model: i64,
    pub num_heads: i64,
    pub dropout: f64,
    pub warmup_steps: f64,
    /// Size of the positional-encoding table; the tokenizer's `maxlen` when unset.
    pub max_position: Option<i64>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            num_layers: 6,
            units: 512,
            d_model: 256,
            num_heads: 8,
            dropout: 0.1,
            warmup_steps: 4000.0,
            max_position: None,
        }
    }
}

impl ModelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_layers <= 0 || self.units <= 0 || self.d_model <= 0 || self.num_heads <= 0 {
            return Err(Error::Config(
                "num_layers, units, d_model and num_heads must be positive".to_string(),
            ));
        }
        if self.d_model % self.num_heads != 0 {
            return Err(Error::Config(format!(
                "d_model ({}) must be divisible by num_heads ({})",
                self.d_model, self.num_heads
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(Error::Config(format!("dropout {} is outside [0, 1)", self.dropout)));
        }
        if self.warmup_steps <= 0.0 {
            return Err(Error::Config("warmup_steps must be positive".to_string()));
        }
        if let Some(max_position) = self.max_position {
            if max_position <= 0 {
                return Err(Error::Config("max_position must be positive".to_string()));
            }
        }
        Ok(())
    }
}

/// Options of the training and prediction drivers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub batch_size: usize,
    pub epochs: usize,
    pub max_text_length: usize,
    pub max_queue_size: usize,
    /// Fixed Adam learning rate. `None` selects the warmup schedule.
    pub learning_rate: Option<f64>,
    pub noise_max_prob: f64,
    pub monitor: String,
    pub checkpoint: String,
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            epochs: 1000,
            max_text_length: 128,
            max_queue_size: 10,
            learning_rate: None,
            noise_max_prob: 0.1,
            monitor: "val_loss".to_string(),
            checkpoint: "checkpoint_weights.ot".to_string(),
            seed: 42,
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 || self.max_text_length == 0 || self.max_queue_size == 0 {
            return Err(Error::Config(
                "batch_size, max_text_length and max_queue_size must be positive".to_string(),
            ));
        }
        if let Some(lr) = self.learning_rate {
            if lr <= 0.0 {
                return Err(Error::Config(format!("learning rate {} must be positive", lr)));
            }
        }
        if !(0.0..=1.0).contains(&self.noise_max_prob) {
            return Err(Error::Config(format!(
                "noise_max_prob {} is outside [0, 1]",
                self.noise_max_prob
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub model: ModelConfig,
    pub training: TrainingConfig,
    pub charset: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            training: TrainingConfig::default(),
            charset: DEFAULT_CHARSET.to_string(),
        }
    }
}

impl Config {
    /// Reads a JSON configuration; missing fields fall back to defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.model.validate()?;
        self.training.validate()?;
        if self.charset.is_empty() {
            return Err(Error::Config("charset must not be empty".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
        assert_eq!(DEFAULT_CHARSET.chars().count(), 95);
    }

    #[test]
    fn test_indivisible_heads_rejected() {
        let config = ModelConfig {
            d_model: 10,
            num_heads: 3,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"model": {"d_model": 64, "num_heads": 4}, "training": {"epochs": 3}}"#).unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.model.d_model, 64);
        assert_eq!(config.model.num_layers, 6);
        assert_eq!(config.training.epochs, 3);
        assert_eq!(config.training.batch_size, 32);
        assert_eq!(config.charset, DEFAULT_CHARSET);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = Config::default();
        config.training.learning_rate = Some(1e-3);
        config.save(&path).unwrap();
        assert_eq!(Config::from_file(&path).unwrap(), config);
    }
}
