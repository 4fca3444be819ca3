use std::borrow::Borrow;

use tch::{nn, Device, Kind, Tensor};

use crate::error::{Error, Result};

/// Added to masked attention logits before the softmax.
const MASK_PENALTY: f64 = -1e9;

#[derive(Debug)]
pub struct PositionalEncoding {
    pe: Tensor,
    max_position: i64,
}

impl PositionalEncoding {
    /// Creates a new PositionalEncoding layer.
    ///
    /// Args:
    ///   max_position: The number of positions covered by the table.
    ///   d_model: The dimensionality of the input embeddings.
    ///   device: The device the table lives on.
    pub fn new(max_position: i64, d_model: i64, device: Device) -> Self {
        // Positions [0, 1, ..., max_position - 1] as a column: [max_position, 1]
        let position = Tensor::arange(max_position, (Kind::Float, device)).unsqueeze(-1);

        // Dimension i shares its frequency with its pair: 1 / 10000^(2 * (i div 2) / d_model).
        // Shape: [1, d_model]
        let exponents: Vec<f32> = (0..d_model)
            .map(|i| (2 * (i / 2)) as f32 / d_model as f32)
            .collect();
        let rates = (Tensor::from_slice(&exponents).to_device(device) * -(10000f64.ln()))
            .exp()
            .unsqueeze(0);

        // [max_position, d_model]
        let angle_rads = &position * &rates;

        // Sines of the even columns first, then cosines of the odd columns.
        // The two halves are concatenated rather than interleaved.
        let sines = angle_rads.slice(1, 0, d_model, 2).sin();
        let cosines = angle_rads.slice(1, 1, d_model, 2).cos();
        let pe = Tensor::cat(&[sines, cosines], 1);

        Self { pe, max_position }
    }

    /// Adds the positional signal to embeddings of shape `[batch_size, seq_len, d_model]`.
    ///
    /// Fails if `seq_len` exceeds the table.
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let seq_len = xs.size()[1];
        if seq_len > self.max_position {
            return Err(Error::SequenceTooLong {
                len: seq_len,
                max: self.max_position,
            });
        }
        // [1, seq_len, d_model], broadcast over the batch.
        Ok(xs + self.pe.narrow(0, 0, seq_len).unsqueeze(0))
    }

    /// The full `[max_position, d_model]` table.
    pub fn table(&self) -> &Tensor {
        &self.pe
    }
}

/// Scaled dot-product attention over already split heads.
///
/// Args:
///   q: `[batch_size, num_heads, query_len, depth]`.
///   k: `[batch_size, num_heads, key_len, depth]`.
///   v: `[batch_size, num_heads, key_len, depth]`.
///   mask: Optional 0/1 mask (1 = blocked) broadcastable to
///         `[batch_size, num_heads, query_len, key_len]`.
///
/// Returns:
///   The attended values `[batch_size, num_heads, query_len, depth]` and the
///   attention weights `[batch_size, num_heads, query_len, key_len]`.
pub fn scaled_dot_product_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    mask: Option<&Tensor>,
) -> Result<(Tensor, Tensor)> {
    let depth = *k.size().last().ok_or_else(|| Error::ShapeMismatch {
        expected: vec![-1, -1, -1, -1],
        got: k.size(),
    })?;

    let logits = q.matmul(&k.transpose(-2, -1)) / (depth as f64).sqrt();

    let logits = match mask {
        Some(m) => {
            check_mask_broadcast(m, &logits.size())?;
            logits + m * MASK_PENALTY
        }
        None => logits,
    };

    // Normalised over the key axis.
    let weights = logits.softmax(-1, Kind::Float);
    let output = weights.matmul(v);
    Ok((output, weights))
}

fn check_mask_broadcast(mask: &Tensor, scores: &[i64]) -> Result<()> {
    let shape = mask.size();
    // Shapes are right-aligned; missing leading mask dims count as 1.
    let broadcastable = shape.len() <= scores.len()
        && shape
            .iter()
            .rev()
            .zip(scores.iter().rev())
            .all(|(&m, &s)| m == 1 || m == s);
    if broadcastable {
        Ok(())
    } else {
        Err(Error::ShapeMismatch {
            expected: scores.to_vec(),
            got: shape,
        })
    }
}

#[derive(Debug)]
pub struct MultiHeadAttention {
    query_dense: nn::Linear,
    key_dense: nn::Linear,
    value_dense: nn::Linear,
    dense: nn::Linear,
    num_heads: i64,
    depth: i64,
    d_model: i64,
}

impl MultiHeadAttention {
    /// Creates a new MultiHeadAttention layer.
    ///
    /// Args:
    ///   vs: The `nn::Path` for `VarStore` ownership, used to create trainable layers.
    ///   d_model: The dimensionality of the input and output.
    ///   num_heads: The number of attention heads. Must divide `d_model`.
    pub fn new<'a, P: Borrow<nn::Path<'a>>>(vs: P, d_model: i64, num_heads: i64) -> Result<Self> {
        let vs = vs.borrow();
        if num_heads <= 0 || d_model % num_heads != 0 {
            return Err(Error::Config(format!(
                "d_model ({}) must be divisible by num_heads ({})",
                d_model, num_heads
            )));
        }
        let depth = d_model / num_heads;

        let query_dense = nn::linear(vs / "query_dense", d_model, d_model, Default::default());
        let key_dense = nn::linear(vs / "key_dense", d_model, d_model, Default::default());
        let value_dense = nn::linear(vs / "value_dense", d_model, d_model, Default::default());
        let dense = nn::linear(vs / "dense", d_model, d_model, Default::default());

        Ok(Self {
            query_dense,
            key_dense,
            value_dense,
            dense,
            num_heads,
            depth,
            d_model,
        })
    }

    /// [batch_size, seq_len, d_model] -> [batch_size, num_heads, seq_len, depth]
    fn split_heads(&self, xs: &Tensor, batch_size: i64) -> Tensor {
        xs.view([batch_size, -1, self.num_heads, self.depth])
            .transpose(1, 2)
    }

    /// Performs the multi-head attention forward pass.
    ///
    /// Args:
    ///   query: The query tensor, shape `[batch_size, query_len, d_model]`.
    ///   key: The key tensor, shape `[batch_size, key_len, d_model]`.
    ///   value: The value tensor, shape `[batch_size, key_len, d_model]`.
    ///   mask: Optional 0/1 attention mask (1 = blocked), broadcastable to
    ///         `[batch_size, num_heads, query_len, key_len]`.
    ///
    /// Returns:
    ///   The output tensor, shape `[batch_size, query_len, d_model]`.
    pub fn forward(&self, query: &Tensor, key: &Tensor, value: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        self.forward_with_weights(query, key, value, mask)
            .map(|(output, _)| output)
    }

    /// Same as [`forward`](Self::forward), also returning the attention weights.
    pub fn forward_with_weights(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        mask: Option<&Tensor>,
    ) -> Result<(Tensor, Tensor)> {
        let (batch_size, _, _) = query.size3()?;

        let q = self.split_heads(&query.apply(&self.query_dense), batch_size);
        let k = self.split_heads(&key.apply(&self.key_dense), batch_size);
        let v = self.split_heads(&value.apply(&self.value_dense), batch_size);

        let (attended, weights) = scaled_dot_product_attention(&q, &k, &v, mask)?;

        // Back to [batch_size, query_len, num_heads, depth], then concatenate the heads.
        let concat = attended
            .transpose(1, 2)
            .contiguous()
            .view([batch_size, -1, self.d_model]);

        Ok((concat.apply(&self.dense), weights))
    }
}

#[derive(Debug)]
pub struct FeedForward {
    linear1: nn::Linear,
    linear2: nn::Linear,
}

impl FeedForward {
    /// Creates a new FeedForward layer.
    ///
    /// Args:
    ///   vs: The `nn::Path` for `VarStore` ownership.
    ///   d_model: The dimensionality of the input and output.
    ///   units: The dimensionality of the inner feed-forward layer.
    pub fn new<'a, P: Borrow<nn::Path<'a>>>(vs: P, d_model: i64, units: i64) -> Self {
        let vs = vs.borrow();
        let linear1 = nn::linear(vs / "linear1", d_model, units, Default::default());
        let linear2 = nn::linear(vs / "linear2", units, d_model, Default::default());
        Self { linear1, linear2 }
    }

    /// Applies dense -> ReLU -> dense at every position.
    ///
    /// Args:
    ///   xs: Input of shape `[batch_size, seq_len, d_model]`.
    ///
    /// Returns:
    ///   A tensor of the same shape.
    pub fn forward(&self, xs: &Tensor) -> Tensor {
        xs.apply(&self.linear1).relu().apply(&self.linear2)
    }
}

fn layer_norm(vs: nn::Path, d_model: i64) -> nn::LayerNorm {
    let config = nn::LayerNormConfig {
        eps: 1e-6,
        ..Default::default()
    };
    nn::layer_norm(vs, vec![d_model], config)
}

#[derive(Debug)]
pub struct EncoderLayer {
    attention: MultiHeadAttention,
    ff: FeedForward,
    norm1: nn::LayerNorm,
    norm2: nn::LayerNorm,
    dropout: f64,
}

impl EncoderLayer {
    /// Creates one encoder block.
    ///
    /// Args:
    ///   vs: The `nn::Path` for `VarStore` ownership.
    ///   d_model: The dimensionality of the input and output.
    ///   num_heads: The number of attention heads.
    ///   units: The dimensionality of the inner feed-forward layer.
    ///   dropout: Dropout rate applied after attention and feed-forward.
    pub fn new<'a, P: Borrow<nn::Path<'a>>>(
        vs: P,
        d_model: i64,
        num_heads: i64,
        units: i64,
        dropout: f64,
    ) -> Result<Self> {
        let vs = vs.borrow();
        let attention = MultiHeadAttention::new(vs / "attention", d_model, num_heads)?;
        let ff = FeedForward::new(vs / "ff", d_model, units);
        let norm1 = layer_norm(vs / "norm1", d_model);
        let norm2 = layer_norm(vs / "norm2", d_model);

        Ok(Self {
            attention,
            ff,
            norm1,
            norm2,
            dropout,
        })
    }

    /// Self-attention then feed-forward, each followed by dropout, residual add and LayerNorm.
    ///
    /// Args:
    ///   xs: Hidden state, shape `[batch_size, seq_len, d_model]`.
    ///   padding_mask: Encoder padding mask, shape `[batch_size, 1, 1, seq_len]`.
    ///   train: Enables dropout.
    pub fn forward_t(&self, xs: &Tensor, padding_mask: &Tensor, train: bool) -> Result<Tensor> {
        let attention = self
            .attention
            .forward(xs, xs, xs, Some(padding_mask))?
            .dropout(self.dropout, train);
        let attention = (xs + attention).apply(&self.norm1);

        let outputs = self.ff.forward(&attention).dropout(self.dropout, train);
        Ok((&attention + outputs).apply(&self.norm2))
    }
}

#[derive(Debug)]
pub struct DecoderLayer {
    self_attention: MultiHeadAttention,
    cross_attention: MultiHeadAttention,
    ff: FeedForward,
    norm1: nn::LayerNorm,
    norm2: nn::LayerNorm,
    norm3: nn::LayerNorm,
    dropout: f64,
}

impl DecoderLayer {
    /// Creates one decoder block.
    ///
    /// Args:
    ///   vs: The `nn::Path` for `VarStore` ownership.
    ///   d_model: The dimensionality of the input and output.
    ///   num_heads: The number of attention heads.
    ///   units: The dimensionality of the inner feed-forward layer.
    ///   dropout: Dropout rate applied after cross-attention and feed-forward.
    pub fn new<'a, P: Borrow<nn::Path<'a>>>(
        vs: P,
        d_model: i64,
        num_heads: i64,
        units: i64,
        dropout: f64,
    ) -> Result<Self> {
        let vs = vs.borrow();
        let self_attention = MultiHeadAttention::new(vs / "attention_1", d_model, num_heads)?;
        let cross_attention = MultiHeadAttention::new(vs / "attention_2", d_model, num_heads)?;
        let ff = FeedForward::new(vs / "ff", d_model, units);
        let norm1 = layer_norm(vs / "norm1", d_model);
        let norm2 = layer_norm(vs / "norm2", d_model);
        let norm3 = layer_norm(vs / "norm3", d_model);

        Ok(Self {
            self_attention,
            cross_attention,
            ff,
            norm1,
            norm2,
            norm3,
            dropout,
        })
    }

    /// Performs the forward pass for one decoder block.
    ///
    /// Args:
    ///   xs: Decoder hidden state, shape `[batch_size, target_len, d_model]`.
    ///   enc_outputs: Encoder output, shape `[batch_size, source_len, d_model]`.
    ///   look_ahead_mask: Causal + padding mask, shape `[batch_size, 1, target_len, target_len]`.
    ///   padding_mask: Encoder padding mask, shape `[batch_size, 1, 1, source_len]`.
    ///   train: Enables dropout.
    ///
    /// Returns:
    ///   Shape `[batch_size, target_len, d_model]`.
    pub fn forward_t(
        &self,
        xs: &Tensor,
        enc_outputs: &Tensor,
        look_ahead_mask: &Tensor,
        padding_mask: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        // (a) masked self-attention
        let attention1 = self
            .self_attention
            .forward(xs, xs, xs, Some(look_ahead_mask))?;
        let attention1 = (attention1 + xs).apply(&self.norm1);

        // (b) cross-attention: queries from the decoder, keys/values from the encoder
        let attention2 = self
            .cross_attention
            .forward(&attention1, enc_outputs, enc_outputs, Some(padding_mask))?
            .dropout(self.dropout, train);
        let attention2 = (attention2 + &attention1).apply(&self.norm2);

        // (c) position-wise feed-forward
        let outputs = self.ff.forward(&attention2).dropout(self.dropout, train);
        Ok((outputs + &attention2).apply(&self.norm3))
    }
}
