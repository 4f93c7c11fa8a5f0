use candle_core::{Result, Tensor};

/// Keys and values of already-processed positions, one `(k, v)` pair per
/// layer, each `[batch, heads, past_len, head_dim]`.
///
/// Prefix-tuning states are never cached; they are re-prepended ahead of
/// the cache on every step.
#[derive(Debug, Clone)]
pub struct PastKeyValues {
    layers: Vec<(Tensor, Tensor)>,
    seq_len: usize,
}

impl PastKeyValues {
    pub(crate) fn new(layers: Vec<(Tensor, Tensor)>) -> Result<Self> {
        let seq_len = match layers.first() {
            Some((k, _)) => k.dim(2)?,
            None => 0,
        };
        Ok(Self { layers, seq_len })
    }

    /// Number of cached positions.
    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn layer(&self, layer_idx: usize) -> Option<&(Tensor, Tensor)> {
        self.layers.get(layer_idx)
    }
}
