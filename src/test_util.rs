use std::sync::Arc;

use tch::{Device, Tensor};

use crate::config::ModelConfig;
use crate::error::{Error, Result};
use crate::model::Transformer;
use crate::tokenizer::TextTokenizer;

/// Tokenizer over bare ids: `encode("4 5 6") == [4, 5, 6]`, `decode` prints them back.
/// SOS is 1 and EOS is 2 unless overridden.
#[derive(Debug, Clone)]
pub(crate) struct DigitTokenizer {
    pub vocab_size: i64,
    pub maxlen: usize,
    pub sos: i64,
    pub eos: i64,
}

impl DigitTokenizer {
    pub fn new(vocab_size: i64, maxlen: usize) -> Self {
        Self {
            vocab_size,
            maxlen,
            sos: 1,
            eos: 2,
        }
    }
}

impl TextTokenizer for DigitTokenizer {
    fn vocab_size(&self) -> i64 {
        self.vocab_size
    }

    fn maxlen(&self) -> usize {
        self.maxlen
    }

    fn sos(&self) -> i64 {
        self.sos
    }

    fn eos(&self) -> i64 {
        self.eos
    }

    fn encode(&self, text: &str) -> Result<Vec<i64>> {
        text.split_whitespace()
            .map(|t| t.parse::<i64>().map_err(|e| Error::Tokenizer(e.to_string())))
            .collect()
    }

    fn decode(&self, ids: &[i64]) -> Result<String> {
        Ok(ids.iter().map(|id| format!(" {} ", id)).collect())
    }
}

pub(crate) fn tiny_config() -> ModelConfig {
    ModelConfig {
        num_layers: 1,
        units: 16,
        d_model: 8,
        num_heads: 2,
        dropout: 0.0,
        warmup_steps: 4000.0,
        max_position: None,
    }
}

/// A compiled single-layer model with a fixed seed and a constant learning rate.
pub(crate) fn tiny_transformer(vocab_size: i64, maxlen: usize) -> Result<Transformer<DigitTokenizer>> {
    tch::manual_seed(0);
    let tokenizer = Arc::new(DigitTokenizer::new(vocab_size, maxlen));
    let mut model = Transformer::new(tiny_config(), tokenizer, Device::Cpu)?;
    model.compile(Some(1e-2))?;
    Ok(model)
}

pub(crate) fn tensor_to_vec(t: &Tensor) -> Vec<f64> {
    let flat = t.flatten(0, -1);
    (0..flat.size()[0]).map(|i| flat.double_value(&[i])).collect()
}
