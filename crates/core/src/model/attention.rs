use candle_core::{DType, Device, Module, Result, Tensor};
use candle_nn::{layer_norm, linear, LayerNorm, Linear, VarBuilder};

/// Additive attention mask for decoder mode.
///
/// Shape `[1, 1, seq_len, prefix_len + seqlen_offset + seq_len]`. Prefix
/// columns are always visible; cached and current columns are causal.
pub(crate) fn causal_mask(
    seq_len: usize,
    seqlen_offset: usize,
    prefix_len: usize,
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    let total_len = prefix_len + seqlen_offset + seq_len;
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| {
            (0..total_len).map(move |j| {
                if j >= prefix_len && j - prefix_len > i + seqlen_offset {
                    f32::NEG_INFINITY
                } else {
                    0.0
                }
            })
        })
        .collect();
    Tensor::from_vec(mask, (1, 1, seq_len, total_len), device)?.to_dtype(dtype)
}

pub(crate) struct SelfAttention {
    query: Linear,
    key: Linear,
    value: Linear,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl SelfAttention {
    pub fn new(hidden_size: usize, num_heads: usize, vb: VarBuilder) -> Result<Self> {
        let head_dim = hidden_size / num_heads;

        let query = linear(hidden_size, hidden_size, vb.pp("query"))?;
        let key = linear(hidden_size, hidden_size, vb.pp("key"))?;
        let value = linear(hidden_size, hidden_size, vb.pp("value"))?;

        Ok(Self {
            query,
            key,
            value,
            num_heads,
            head_dim,
            scale: (head_dim as f64).powf(-0.5),
        })
    }

    /// Self-attention over `[batch, seq, hidden]`.
    ///
    /// Key/value order is `prefix ++ past ++ current`, all
    /// `[batch, heads, _, head_dim]`. Returns the output and this layer's
    /// `past ++ current` keys/values, without the prefix.
    pub fn forward(
        &self,
        hidden_states: &Tensor,
        prefix: Option<&(Tensor, Tensor)>,
        past: Option<&(Tensor, Tensor)>,
        causal: bool,
    ) -> Result<(Tensor, (Tensor, Tensor))> {
        let (batch_size, seq_len, _hidden_size) = hidden_states.dims3()?;

        // [batch, seq, hidden] -> [batch, heads, seq, head_dim]
        let split_heads = |t: Tensor| -> Result<Tensor> {
            t.reshape((batch_size, seq_len, self.num_heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()
        };
        let q = split_heads(self.query.forward(hidden_states)?)?;
        let k = split_heads(self.key.forward(hidden_states)?)?;
        let v = split_heads(self.value.forward(hidden_states)?)?;

        let (k, v) = match past {
            Some((past_k, past_v)) => (Tensor::cat(&[past_k, &k], 2)?, Tensor::cat(&[past_v, &v], 2)?),
            None => (k, v),
        };
        let seqlen_offset = k.dim(2)? - seq_len;
        let present = (k.clone(), v.clone());

        let (k, v, prefix_len) = match prefix {
            Some((prefix_k, prefix_v)) => (
                Tensor::cat(&[prefix_k, &k], 2)?,
                Tensor::cat(&[prefix_v, &v], 2)?,
                prefix_k.dim(2)?,
            ),
            None => (k, v, 0),
        };

        let mut attn_weights = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * self.scale)?;
        if causal {
            let mask = causal_mask(
                seq_len,
                seqlen_offset,
                prefix_len,
                attn_weights.dtype(),
                attn_weights.device(),
            )?;
            attn_weights = attn_weights.broadcast_add(&mask)?;
        }
        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;
        let attn_output = attn_weights.matmul(&v)?;

        // [batch, heads, seq, head_dim] -> [batch, seq, hidden]
        let attn_output = attn_output
            .transpose(1, 2)?
            .reshape((batch_size, seq_len, self.num_heads * self.head_dim))?;
        Ok((attn_output, present))
    }
}

/// Dense projection followed by residual add + LayerNorm.
///
/// The two halves are separate so adapters can hook the projected output
/// before the residual is added.
pub(crate) struct SelfOutput {
    dense: Linear,
    layer_norm: LayerNorm,
}

impl SelfOutput {
    pub fn new(in_size: usize, hidden_size: usize, layer_norm_eps: f64, vb: VarBuilder) -> Result<Self> {
        let dense = linear(in_size, hidden_size, vb.pp("dense"))?;
        let layer_norm = layer_norm(hidden_size, layer_norm_eps, vb.pp("LayerNorm"))?;
        Ok(Self { dense, layer_norm })
    }

    pub fn project(&self, hidden_states: &Tensor) -> Result<Tensor> {
        self.dense.forward(hidden_states)
    }

    pub fn add_and_norm(&self, hidden_states: &Tensor, residual: &Tensor) -> Result<Tensor> {
        self.layer_norm.forward(&(hidden_states + residual)?)
    }
}
