use std::borrow::Borrow;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use tch::{nn, nn::OptimizerConfig, Device, Kind, Tensor};
use tracing::{debug, info};

use crate::config::ModelConfig;
use crate::error::{Error, Result};
use crate::layers::{DecoderLayer, EncoderLayer, PositionalEncoding};
use crate::schedule::{ConstantLearningRate, CustomSchedule, LearningRateSchedule};
use crate::tokenizer::{TextTokenizer, PAD_ID};

/// Mask of the pad positions of `x` (`[batch_size, seq_len]`).
///
/// Returns a float tensor `[batch_size, 1, 1, seq_len]` with 1 where `x` is
/// the pad id, broadcast over heads and query positions.
pub fn create_padding_mask(x: &Tensor) -> Tensor {
    x.eq(PAD_ID).to_kind(Kind::Float).unsqueeze(1).unsqueeze(1)
}

/// Mask for decoder self-attention: blocks future positions and pad positions.
///
/// Returns `[batch_size, 1, seq_len, seq_len]`, the elementwise maximum of the
/// strict upper triangle and the padding mask of `x`.
pub fn create_look_ahead_mask(x: &Tensor) -> Tensor {
    let seq_len = x.size()[1];
    let look_ahead = Tensor::ones([seq_len, seq_len], (Kind::Float, x.device())).triu(1);
    look_ahead.maximum(&create_padding_mask(x))
}

#[derive(Debug)]
pub struct Encoder {
    embedding: nn::Embedding,
    pos_encoding: PositionalEncoding,
    layers: Vec<EncoderLayer>,
    d_model: i64,
    dropout: f64,
}

impl Encoder {
    /// Creates the encoder stack.
    ///
    /// Args:
    ///   vs: The `nn::Path` for `VarStore` ownership.
    ///   vocab_size: The size of the vocabulary.
    ///   max_position: Rows of the positional-encoding table.
    ///   config: Layer count and layer sizes.
    pub fn new<'a, P: Borrow<nn::Path<'a>>>(
        vs: P,
        vocab_size: i64,
        max_position: i64,
        config: &ModelConfig,
    ) -> Result<Self> {
        let vs = vs.borrow();
        let embedding = nn::embedding(vs / "embedding", vocab_size, config.d_model, Default::default());
        let pos_encoding = PositionalEncoding::new(max_position, config.d_model, vs.device());
        let layers = (0..config.num_layers)
            .map(|i| {
                EncoderLayer::new(
                    vs / format!("encoder_layer_{}", i),
                    config.d_model,
                    config.num_heads,
                    config.units,
                    config.dropout,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            embedding,
            pos_encoding,
            layers,
            d_model: config.d_model,
            dropout: config.dropout,
        })
    }

    /// Encodes token ids `[batch_size, seq_len]`.
    ///
    /// Returns the hidden state `[batch_size, seq_len, d_model]` and the
    /// padding mask `[batch_size, 1, 1, seq_len]` for the decoder's cross-attention.
    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<(Tensor, Tensor)> {
        let padding_mask = create_padding_mask(xs);

        let embeddings = xs.apply(&self.embedding) * (self.d_model as f64).sqrt();
        let mut outputs = self
            .pos_encoding
            .forward(&embeddings)?
            .dropout(self.dropout, train);

        for layer in self.layers.iter() {
            outputs = layer.forward_t(&outputs, &padding_mask, train)?;
        }
        Ok((outputs, padding_mask))
    }
}

#[derive(Debug)]
pub struct Decoder {
    embedding: nn::Embedding,
    pos_encoding: PositionalEncoding,
    layers: Vec<DecoderLayer>,
    outputs: nn::Linear,
    d_model: i64,
    dropout: f64,
}

impl Decoder {
    /// Creates the decoder stack and its vocabulary projection.
    ///
    /// Args:
    ///   vs: The `nn::Path` for `VarStore` ownership.
    ///   vocab_size: The size of the vocabulary.
    ///   max_position: Rows of the positional-encoding table.
    ///   config: Layer count and layer sizes.
    pub fn new<'a, P: Borrow<nn::Path<'a>>>(
        vs: P,
        vocab_size: i64,
        max_position: i64,
        config: &ModelConfig,
    ) -> Result<Self> {
        let vs = vs.borrow();
        let embedding = nn::embedding(vs / "embedding", vocab_size, config.d_model, Default::default());
        let pos_encoding = PositionalEncoding::new(max_position, config.d_model, vs.device());
        let layers = (0..config.num_layers)
            .map(|i| {
                DecoderLayer::new(
                    vs / format!("decoder_layer_{}", i),
                    config.d_model,
                    config.num_heads,
                    config.units,
                    config.dropout,
                )
            })
            .collect::<Result<Vec<_>>>()?;
        let outputs = nn::linear(vs / "outputs", config.d_model, vocab_size, Default::default());

        Ok(Self {
            embedding,
            pos_encoding,
            layers,
            outputs,
            d_model: config.d_model,
            dropout: config.dropout,
        })
    }

    /// Decodes target ids `[batch_size, target_len]` against the encoder output.
    ///
    /// Returns raw vocabulary logits `[batch_size, target_len, vocab_size]`.
    pub fn forward_t(
        &self,
        xs: &Tensor,
        enc_outputs: &Tensor,
        padding_mask: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        let look_ahead_mask = create_look_ahead_mask(xs);

        let embeddings = xs.apply(&self.embedding) * (self.d_model as f64).sqrt();
        let mut outputs = self
            .pos_encoding
            .forward(&embeddings)?
            .dropout(self.dropout, train);

        for layer in self.layers.iter() {
            outputs = layer.forward_t(&outputs, enc_outputs, &look_ahead_mask, padding_mask, train)?;
        }
        Ok(outputs.apply(&self.outputs))
    }
}

/// Everything `compile` builds. The encoder and decoder register their
/// parameters in the one `VarStore`, so the training graph, the encode-only
/// graph and the decode-only graph all read the same weights.
pub(crate) struct CompiledModel {
    pub(crate) var_store: nn::VarStore,
    pub(crate) encoder: Encoder,
    pub(crate) decoder: Decoder,
    pub(crate) optimizer: nn::Optimizer,
    pub(crate) schedule: Box<dyn LearningRateSchedule>,
    /// Optimizer steps taken so far.
    pub(crate) step: usize,
    /// Multiplier applied on top of the schedule by plateau reduction.
    pub(crate) lr_scale: f64,
}

impl CompiledModel {
    pub(crate) fn forward_t(&self, enc_inputs: &Tensor, dec_inputs: &Tensor, train: bool) -> Result<Tensor> {
        let (enc_outputs, enc_padding_mask) = self.encoder.forward_t(enc_inputs, train)?;
        self.decoder
            .forward_t(dec_inputs, &enc_outputs, &enc_padding_mask, train)
    }

    pub(crate) fn current_learning_rate(&self) -> f64 {
        self.schedule.learning_rate(self.step.max(1)) * self.lr_scale
    }
}

/// The encoder-decoder Transformer orchestrator.
///
/// Owns the tokenizer handle and, once compiled, the parameter store,
/// the encoder and decoder graphs and the optimizer.
pub struct Transformer<T: TextTokenizer> {
    pub(crate) config: ModelConfig,
    pub(crate) tokenizer: Arc<T>,
    pub(crate) device: Device,
    pub(crate) model: Option<CompiledModel>,
}

impl<T: TextTokenizer> Transformer<T> {
    /// Creates an uncompiled model. Fails fast on an invalid configuration.
    pub fn new(config: ModelConfig, tokenizer: Arc<T>, device: Device) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            tokenizer,
            device,
            model: None,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn tokenizer(&self) -> &Arc<T> {
        &self.tokenizer
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn is_compiled(&self) -> bool {
        self.model.is_some()
    }

    /// Builds the encoder, decoder and Adam optimizer.
    ///
    /// With `learning_rate = None` the optimizer follows [`CustomSchedule`].
    /// Recompiling discards the current weights.
    pub fn compile(&mut self, learning_rate: Option<f64>) -> Result<()> {
        let vocab_size = self.tokenizer.vocab_size();
        let max_position = self
            .config
            .max_position
            .unwrap_or(self.tokenizer.maxlen() as i64);

        let var_store = nn::VarStore::new(self.device);
        let root = var_store.root();
        let encoder = Encoder::new(&root / "encoder", vocab_size, max_position, &self.config)?;
        let decoder = Decoder::new(&root / "decoder", vocab_size, max_position, &self.config)?;

        let schedule: Box<dyn LearningRateSchedule> = match learning_rate {
            Some(lr) => Box::new(ConstantLearningRate(lr)),
            None => Box::new(CustomSchedule::with_warmup(self.config.d_model, self.config.warmup_steps)),
        };
        let optimizer = nn::Adam::default().build(&var_store, schedule.learning_rate(1))?;

        info!(
            vocab_size,
            max_position,
            parameters = count_parameters(&var_store),
            "compiled transformer"
        );

        self.model = Some(CompiledModel {
            var_store,
            encoder,
            decoder,
            optimizer,
            schedule,
            step: 0,
            lr_scale: 1.0,
        });
        Ok(())
    }

    pub(crate) fn compiled(&self) -> Result<&CompiledModel> {
        self.model.as_ref().ok_or(Error::NotCompiled)
    }

    pub(crate) fn compiled_mut(&mut self) -> Result<&mut CompiledModel> {
        self.model.as_mut().ok_or(Error::NotCompiled)
    }

    /// Restores weights saved by [`save_weights`](Self::save_weights) or the checkpoint callback.
    ///
    /// Compiles first if needed. Variables are matched by name, so the
    /// encoder-only and decoder-only graphs are restored together with the
    /// combined one. Returns `Ok(false)` without touching the model when the
    /// file does not exist.
    pub fn load_checkpoint<P: AsRef<Path>>(&mut self, path: P) -> Result<bool> {
        let path = path.as_ref();
        if !path.is_file() {
            debug!(path = %path.display(), "no checkpoint found, keeping fresh weights");
            return Ok(false);
        }
        if self.model.is_none() {
            self.compile(None)?;
        }
        self.compiled_mut()?.var_store.load(path)?;
        info!(path = %path.display(), "restored checkpoint");
        Ok(true)
    }

    pub fn save_weights<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.compiled()?.var_store.save(path)?;
        Ok(())
    }

    /// Training-graph forward pass: `(encoder ids, decoder ids)` to logits
    /// `[batch_size, target_len, vocab_size]`.
    pub fn forward_t(&self, enc_inputs: &Tensor, dec_inputs: &Tensor, train: bool) -> Result<Tensor> {
        self.compiled()?.forward_t(enc_inputs, dec_inputs, train)
    }

    /// Encode-only graph.
    pub fn encode(&self, enc_inputs: &Tensor) -> Result<(Tensor, Tensor)> {
        self.compiled()?.encoder.forward_t(enc_inputs, false)
    }

    /// Decode-only graph.
    pub fn decode(&self, dec_inputs: &Tensor, enc_outputs: &Tensor, enc_padding_mask: &Tensor) -> Result<Tensor> {
        self.compiled()?
            .decoder
            .forward_t(dec_inputs, enc_outputs, enc_padding_mask, false)
    }

    /// Lists every trainable variable with its shape, followed by the total.
    pub fn summary(&self) -> Result<String> {
        let var_store = &self.compiled()?.var_store;
        let mut variables: Vec<(String, Tensor)> = var_store.variables().into_iter().collect();
        variables.sort_by(|a, b| a.0.cmp(&b.0));

        let width = variables.iter().map(|(name, _)| name.len()).max().unwrap_or(0);
        let mut out = String::new();
        for (name, tensor) in &variables {
            let shape = tensor.size();
            let count: i64 = shape.iter().product();
            out.push_str(&format!("{:<width$}  {:?}  {}\n", name, shape, count, width = width));
        }
        out.push_str(&format!("Total params: {}\n", count_parameters(var_store)));
        Ok(out)
    }

    /// Writes [`summary`](Self::summary) to `output/target`, creating `output` if needed.
    pub fn write_summary<P: AsRef<Path>>(&self, output: P, target: &str) -> Result<()> {
        fs::create_dir_all(output.as_ref())?;
        fs::write(output.as_ref().join(target), self.summary()?)?;
        Ok(())
    }
}

fn count_parameters(var_store: &nn::VarStore) -> i64 {
    var_store
        .trainable_variables()
        .iter()
        .map(|t| t.size().iter().product::<i64>())
        .sum()
}
