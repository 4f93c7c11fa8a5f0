use candle_core::{DType, Module, Result, Tensor};
use candle_nn::{embedding, layer_norm, Embedding, LayerNorm, VarBuilder};

use crate::config::ModelConfig;

/// Token, absolute position and segment embeddings, summed and normalised.
pub(crate) struct Embeddings {
    word_embeddings: Embedding,
    position_embeddings: Embedding,
    token_type_embeddings: Embedding,
    layer_norm: LayerNorm,
    max_positions: usize,
}

impl Embeddings {
    pub fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let num_segments = cfg
            .extra
            .get("type_vocab_size")
            .and_then(|v| v.as_u64())
            .map_or(2, |n| n as usize);

        Ok(Self {
            word_embeddings: embedding(cfg.vocab_size, cfg.hidden_size, vb.pp("word_embeddings"))?,
            position_embeddings: embedding(
                cfg.max_position_embeddings,
                cfg.hidden_size,
                vb.pp("position_embeddings"),
            )?,
            token_type_embeddings: embedding(
                num_segments,
                cfg.hidden_size,
                vb.pp("token_type_embeddings"),
            )?,
            layer_norm: layer_norm(cfg.hidden_size, cfg.layer_norm_eps, vb.pp("LayerNorm"))?,
            max_positions: cfg.max_position_embeddings,
        })
    }

    /// Embed `input_ids` whose first token sits at `position_offset`, i.e.
    /// after that many cached positions.
    pub fn forward_at(&self, input_ids: &Tensor, position_offset: usize) -> Result<Tensor> {
        let (batch_size, seq_len) = input_ids.dims2()?;
        let end = position_offset + seq_len;
        if end > self.max_positions {
            candle_core::bail!(
                "position {} exceeds max_position_embeddings {}",
                end - 1,
                self.max_positions
            );
        }
        let device = input_ids.device();

        let positions = Tensor::arange(position_offset as u32, end as u32, device)?
            .unsqueeze(0)?
            .expand((batch_size, seq_len))?;
        // every token is segment 0
        let segments = Tensor::zeros((batch_size, seq_len), DType::U32, device)?;

        let summed = self
            .word_embeddings
            .forward(input_ids)?
            .add(&self.position_embeddings.forward(&positions)?)?
            .add(&self.token_type_embeddings.forward(&segments)?)?;
        self.layer_norm.forward(&summed)
    }
}

impl Module for Embeddings {
    fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        self.forward_at(input_ids, 0)
    }
}
