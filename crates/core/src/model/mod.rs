//! Minimal BERT-style encoder that hosts adapters.
//!
//! Post-LN layers of self-attention and feed-forward, with adapter hooks at
//! every injection slot. Attention is bidirectional unless the config sets
//! `is_decoder`, in which case it is causal and can continue from
//! [`PastKeyValues`]:
//!
//! ```text
//! embeddings ─► [embedding: invertible] ─► layer 0 ─► … ─► layer N-1
//!
//! layer i:
//!   h  = [pre_attention](x)
//!   a  = [post_attention](attention(h, [attention_key_value]))
//!   h  = LayerNorm(a + h)
//!   f  = [post_feed_forward](ffn(h))
//!   out = LayerNorm(f + h)
//! ```

mod attention;
mod cache;
mod embeddings;
mod heads;
mod mlp;

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Module, Result, Tensor};
use candle_nn::{VarBuilder, VarMap};
use tracing::info;

use crate::adapters::{
    load_tensors, lock_vars, read_json, save_tensors, write_json, ActiveAdapters, AdapterError,
    AdapterLoadError, AdapterManager, AdapterModel, AdapterSetup, ForwardContext, HostDims,
    InjectionSlot, NonLinearity, MODEL_CONFIG_NAME, MODEL_WEIGHTS_NAME,
};
use crate::config::ModelConfig;

use self::attention::{SelfAttention, SelfOutput};
use self::embeddings::Embeddings;
use self::mlp::Intermediate;

pub use cache::PastKeyValues;
pub use heads::{HeadConfig, HeadManifest, HeadType, ModelOutput, ModelWithHeads, PredictionHead};

// ─── Encoder layer ───────────────────────────────────────────────────────────

struct EncoderLayer {
    self_attention: SelfAttention,
    attention_output: SelfOutput,
    intermediate: Intermediate,
    output: SelfOutput,
}

impl EncoderLayer {
    fn new(cfg: &ModelConfig, act: NonLinearity, vb: VarBuilder) -> Result<Self> {
        let self_attention = SelfAttention::new(
            cfg.hidden_size,
            cfg.num_attention_heads,
            vb.pp("attention.self"),
        )?;
        let attention_output = SelfOutput::new(
            cfg.hidden_size,
            cfg.hidden_size,
            cfg.layer_norm_eps,
            vb.pp("attention.output"),
        )?;
        let intermediate = Intermediate::new(
            cfg.hidden_size,
            cfg.intermediate_size,
            act,
            vb.pp("intermediate"),
        )?;
        let output = SelfOutput::new(
            cfg.intermediate_size,
            cfg.hidden_size,
            cfg.layer_norm_eps,
            vb.pp("output"),
        )?;
        Ok(Self {
            self_attention,
            attention_output,
            intermediate,
            output,
        })
    }

    /// Returns the layer output and its keys/values for the cache.
    fn forward(
        &self,
        layer_idx: usize,
        hidden_states: &Tensor,
        past: Option<&(Tensor, Tensor)>,
        causal: bool,
        adapters: &AdapterManager,
        ctx: &ForwardContext,
    ) -> Result<(Tensor, (Tensor, Tensor))> {
        let hidden_states = adapters.hook_residual(
            layer_idx,
            InjectionSlot::PreAttention,
            hidden_states,
            hidden_states,
            ctx,
        )?;

        let prefix = adapters.hook_key_values(layer_idx, ctx)?;
        let (attn, present) =
            self.self_attention
                .forward(&hidden_states, prefix.as_ref(), past, causal)?;
        let attn = self.attention_output.project(&attn)?;
        let attn = adapters.hook_residual(
            layer_idx,
            InjectionSlot::PostAttention,
            &hidden_states,
            &attn,
            ctx,
        )?;
        let hidden_states = self.attention_output.add_and_norm(&attn, &hidden_states)?;

        let ffn = self
            .output
            .project(&self.intermediate.forward(&hidden_states)?)?;
        let ffn = adapters.hook_residual(
            layer_idx,
            InjectionSlot::PostFeedForward,
            &hidden_states,
            &ffn,
            ctx,
        )?;
        Ok((self.output.add_and_norm(&ffn, &hidden_states)?, present))
    }
}

// ─── Transformer ─────────────────────────────────────────────────────────────

/// Frozen encoder with an [`AdapterManager`].
///
/// Base weights are kept by name so the full model can be saved together
/// with its adapters.
pub struct TransformerModel {
    config: ModelConfig,
    embeddings: Embeddings,
    layers: Vec<EncoderLayer>,
    weights: HashMap<String, Tensor>,
    adapters: AdapterManager,
}

impl TransformerModel {
    /// Randomly initialised model.
    pub fn new(cfg: &ModelConfig, device: &Device, dtype: DType) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, dtype, device);
        let (embeddings, layers) = Self::build_modules(cfg, vb)?;
        let weights = lock_vars(&varmap)?
            .iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
            .collect();
        Ok(Self::assemble(cfg, embeddings, layers, weights, device, dtype))
    }

    /// Model over existing base weights, e.g. those of another instance.
    pub fn from_weights(
        cfg: &ModelConfig,
        weights: HashMap<String, Tensor>,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let vb = VarBuilder::from_tensors(weights.clone(), dtype, device);
        let (embeddings, layers) = Self::build_modules(cfg, vb)?;
        Ok(Self::assemble(cfg, embeddings, layers, weights, device, dtype))
    }

    fn build_modules(cfg: &ModelConfig, vb: VarBuilder) -> Result<(Embeddings, Vec<EncoderLayer>)> {
        let act: NonLinearity = cfg
            .hidden_act
            .parse()
            .map_err(|e| candle_core::Error::Msg(format!("hidden_act: {e}")))?;
        let embeddings = Embeddings::new(cfg, vb.pp("embeddings"))?;
        let vb_l = vb.pp("encoder.layer");
        let mut layers = Vec::with_capacity(cfg.num_hidden_layers);
        for i in 0..cfg.num_hidden_layers {
            layers.push(EncoderLayer::new(cfg, act, vb_l.pp(i))?);
        }
        Ok((embeddings, layers))
    }

    fn assemble(
        cfg: &ModelConfig,
        embeddings: Embeddings,
        layers: Vec<EncoderLayer>,
        weights: HashMap<String, Tensor>,
        device: &Device,
        dtype: DType,
    ) -> Self {
        let mut config = cfg.clone();
        config.adapters.clear();
        let adapters = AdapterManager::new(
            HostDims::from(&config),
            config.model_type.clone(),
            device.clone(),
            dtype,
        );
        Self {
            config,
            embeddings,
            layers,
            weights,
            adapters,
        }
    }

    /// Host config with the current adapter record.
    pub fn config(&self) -> ModelConfig {
        let mut config = self.config.clone();
        config.adapters = self.adapters.configs().clone();
        config
    }

    /// Base weights by parameter name.
    pub fn base_weights(&self) -> &HashMap<String, Tensor> {
        &self.weights
    }

    pub fn device(&self) -> &Device {
        self.adapters.device()
    }

    pub fn dtype(&self) -> DType {
        self.adapters.dtype()
    }

    pub fn is_decoder(&self) -> bool {
        self.config.is_decoder
    }

    /// Forward pass with the adapters active on this thread.
    ///
    /// Returns last hidden states `[batch, seq, hidden]`.
    pub fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        let (batch_size, _seq_len) = input_ids.dims2()?;
        let ctx = self.adapters.forward_context(batch_size)?;
        self.forward_with_context(input_ids, &ctx)
    }

    /// Forward pass with `adapters` active for this call only.
    pub fn forward_with_adapters(
        &self,
        input_ids: &Tensor,
        adapters: impl Into<ActiveAdapters>,
    ) -> Result<Tensor> {
        let _setup = AdapterSetup::new(adapters);
        self.forward(input_ids)
    }

    pub fn forward_with_context(&self, input_ids: &Tensor, ctx: &ForwardContext) -> Result<Tensor> {
        self.run(input_ids, None, ctx).map(|(hidden_states, _)| hidden_states)
    }

    /// Decoder forward pass continuing after `past`, with the adapters
    /// active on this thread.
    ///
    /// Returns hidden states for `input_ids` only and the cache extended by
    /// them. Errors unless the model is a decoder.
    pub fn forward_with_past(
        &self,
        input_ids: &Tensor,
        past: Option<&PastKeyValues>,
    ) -> Result<(Tensor, PastKeyValues)> {
        let (batch_size, _seq_len) = input_ids.dims2()?;
        let ctx = self.adapters.forward_context(batch_size)?;
        self.forward_with_past_and_context(input_ids, past, &ctx)
    }

    pub fn forward_with_past_and_context(
        &self,
        input_ids: &Tensor,
        past: Option<&PastKeyValues>,
        ctx: &ForwardContext,
    ) -> Result<(Tensor, PastKeyValues)> {
        if !self.config.is_decoder {
            candle_core::bail!("past key/values require a decoder model (is_decoder = true)");
        }
        if let Some(past) = past {
            if past.num_layers() != self.layers.len() {
                candle_core::bail!(
                    "past key/values cover {} layers, model has {}",
                    past.num_layers(),
                    self.layers.len()
                );
            }
        }
        self.run(input_ids, past, ctx)
    }

    fn run(
        &self,
        input_ids: &Tensor,
        past: Option<&PastKeyValues>,
        ctx: &ForwardContext,
    ) -> Result<(Tensor, PastKeyValues)> {
        let offset = past.map_or(0, PastKeyValues::seq_len);
        let embeddings = self.embeddings.forward_at(input_ids, offset)?;
        let mut hidden_states = self.adapters.invertible_forward(&embeddings, ctx)?;
        let mut present = Vec::with_capacity(self.layers.len());
        for (layer_idx, layer) in self.layers.iter().enumerate() {
            let (out, kv) = layer.forward(
                layer_idx,
                &hidden_states,
                past.and_then(|p| p.layer(layer_idx)),
                self.config.is_decoder,
                &self.adapters,
                ctx,
            )?;
            hidden_states = out;
            present.push(kv);
        }
        Ok((hidden_states, PastKeyValues::new(present)?))
    }

    /// Save config (with the adapter record) and all weights, base and
    /// adapter, to `dir`.
    pub fn save_pretrained(&self, dir: impl AsRef<Path>) -> std::result::Result<(), AdapterError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).map_err(AdapterLoadError::from)?;

        let mut tensors = self.weights.clone();
        for (name, var) in self.adapters.all_parameters()? {
            tensors.insert(name, var.as_tensor().clone());
        }
        save_tensors(&tensors, &dir.join(MODEL_WEIGHTS_NAME))?;
        write_json(&dir.join(MODEL_CONFIG_NAME), &self.config())?;

        info!(
            path = %dir.display(),
            adapters = self.adapters.len(),
            tensors = tensors.len(),
            "Saved model"
        );
        Ok(())
    }

    /// Restore a model saved by [`TransformerModel::save_pretrained`],
    /// re-attaching every recorded adapter with its weights.
    pub fn from_pretrained(
        dir: impl AsRef<Path>,
        device: &Device,
        dtype: DType,
    ) -> std::result::Result<Self, AdapterError> {
        let dir = dir.as_ref();
        let config_path = dir.join(MODEL_CONFIG_NAME);
        if !config_path.exists() {
            return Err(AdapterLoadError::ManifestNotFound(config_path.display().to_string()).into());
        }
        let config: ModelConfig = read_json(&config_path)?;
        let weights_path = dir.join(MODEL_WEIGHTS_NAME);
        if !weights_path.exists() {
            return Err(AdapterLoadError::WeightsNotFound(weights_path.display().to_string()).into());
        }
        let tensors = load_tensors(&weights_path, device)?;

        let mut model = Self::from_weights(&config, tensors.clone(), device, dtype)?;
        for (name, adapter_config) in &config.adapters {
            model.adapters.add(name, adapter_config.clone())?;
        }
        for key in model.adapters.all_parameters()?.keys() {
            model.weights.remove(key);
        }
        let missing = model.adapters.assign_parameters(&tensors)?;
        if !missing.is_empty() {
            return Err(AdapterLoadError::WeightsLoad(format!(
                "missing adapter tensors: {}",
                missing.join(", ")
            ))
            .into());
        }
        info!(path = %dir.display(), adapters = model.adapters.len(), "Loaded model");
        Ok(model)
    }
}

impl AdapterModel for TransformerModel {
    fn adapter_manager(&self) -> &AdapterManager {
        &self.adapters
    }

    fn adapter_manager_mut(&mut self) -> &mut AdapterManager {
        &mut self.adapters
    }
}
