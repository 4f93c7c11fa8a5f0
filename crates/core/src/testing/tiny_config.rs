use crate::config::ModelConfig;

/// Create a tiny BERT-like config for testing (2 layers, 32 hidden, 4 heads).
/// Uses < 1MB of parameters.
pub fn tiny_config() -> ModelConfig {
    ModelConfig {
        model_type: "bert".to_string(),
        hidden_size: 32,
        num_attention_heads: 4,
        num_hidden_layers: 2,
        intermediate_size: 64,
        vocab_size: 100,
        max_position_embeddings: 128,
        hidden_act: "gelu".to_string(),
        layer_norm_eps: 1e-12,
        is_decoder: false,
        adapters: Default::default(),
        extra: serde_json::Map::new(),
    }
}

/// [`tiny_config`] with causal self-attention.
pub fn tiny_decoder_config() -> ModelConfig {
    ModelConfig {
        is_decoder: true,
        ..tiny_config()
    }
}
