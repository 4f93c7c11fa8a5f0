use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::adapters::AdapterConfig;

/// Host network configuration (BERT-style encoder).
///
/// `adapters` is the authoritative record of attached adapters and is
/// persisted with the host config by `save_pretrained`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_model_type")]
    pub model_type: String,
    pub hidden_size: usize,
    pub num_attention_heads: usize,
    pub num_hidden_layers: usize,
    pub intermediate_size: usize,
    pub vocab_size: usize,
    pub max_position_embeddings: usize,
    #[serde(default = "default_hidden_act")]
    pub hidden_act: String,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
    /// Causal self-attention with incremental decoding.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_decoder: bool,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub adapters: BTreeMap<String, AdapterConfig>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_model_type() -> String {
    "bert".to_string()
}

fn default_hidden_act() -> String {
    "gelu".to_string()
}

fn default_layer_norm_eps() -> f64 {
    1e-12
}

impl ModelConfig {
    /// Per-head dimension.
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    /// Serialize to pretty-printed JSON.
    pub fn to_json_string(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_type: default_model_type(),
            hidden_size: 768,
            num_attention_heads: 12,
            num_hidden_layers: 12,
            intermediate_size: 3072,
            vocab_size: 30522,
            max_position_embeddings: 512,
            hidden_act: default_hidden_act(),
            layer_norm_eps: default_layer_norm_eps(),
            is_decoder: false,
            adapters: BTreeMap::new(),
            extra: serde_json::Map::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BERT_BASE_CONFIG: &str = r#"{
        "architectures": ["BertForMaskedLM"],
        "attention_probs_dropout_prob": 0.1,
        "hidden_act": "gelu",
        "hidden_dropout_prob": 0.1,
        "hidden_size": 768,
        "initializer_range": 0.02,
        "intermediate_size": 3072,
        "layer_norm_eps": 1e-12,
        "max_position_embeddings": 512,
        "model_type": "bert",
        "num_attention_heads": 12,
        "num_hidden_layers": 12,
        "pad_token_id": 0,
        "type_vocab_size": 2,
        "vocab_size": 30522
    }"#;

    #[test]
    fn test_parse_bert_base_config() {
        let config: ModelConfig =
            serde_json::from_str(BERT_BASE_CONFIG).expect("failed to parse config");

        assert_eq!(config.model_type, "bert");
        assert_eq!(config.hidden_size, 768);
        assert_eq!(config.num_attention_heads, 12);
        assert_eq!(config.num_hidden_layers, 12);
        assert_eq!(config.intermediate_size, 3072);
        assert_eq!(config.vocab_size, 30522);
        assert_eq!(config.hidden_act, "gelu");
        assert_eq!(config.layer_norm_eps, 1e-12);
        assert!(config.adapters.is_empty());
        assert!(!config.is_decoder);
        assert!(config.extra.contains_key("type_vocab_size"));
    }

    #[test]
    fn test_head_dim_is_derived() {
        let config: ModelConfig =
            serde_json::from_str(BERT_BASE_CONFIG).expect("failed to parse config");
        assert_eq!(config.head_dim(), 64);
    }

    #[test]
    fn test_adapters_round_trip_through_json() {
        let mut config = ModelConfig::default();
        config
            .adapters
            .insert("sst-2".to_string(), AdapterConfig::default());

        let json = config.to_json_string().unwrap();
        let parsed: ModelConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.adapters.get("sst-2"), Some(&AdapterConfig::default()));
    }

    #[test]
    fn test_decoder_flag_only_serialized_when_set() {
        let mut config = ModelConfig::default();
        assert!(!config.to_json_string().unwrap().contains("is_decoder"));

        config.is_decoder = true;
        let parsed: ModelConfig = serde_json::from_str(&config.to_json_string().unwrap()).unwrap();
        assert!(parsed.is_decoder);
    }
}
