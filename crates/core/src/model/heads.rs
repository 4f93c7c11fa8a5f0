//! Prediction heads and the head-carrying host wrapper.

use std::collections::BTreeMap;
use std::path::Path;

use candle_core::{DType, Device, Module, Result, Tensor, Var};
use candle_nn::{linear, Linear, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::adapters::{
    head_path, lock_vars, read_json, save_tensors, write_json, ActiveAdapters, AdapterError,
    AdapterLoadError, AdapterManager, AdapterModel, AdapterSetup, ForwardContext, LoadingInfo,
    NonLinearity, HEAD_CONFIG_NAME, HEAD_WEIGHTS_NAME,
};

use super::{PastKeyValues, TransformerModel};

/// Prefix of the wrapped transformer's parameters when saved.
pub const BASE_MODEL_PREFIX: &str = "transformer";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeadType {
    /// Sequence classification from the first token.
    Classification,
    /// Per-token classification.
    Tagging,
    /// Per-token vocabulary logits. Runs on the inverse of the active
    /// invertible adapter.
    MaskedLm,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeadConfig {
    pub head_type: HeadType,
    pub num_labels: usize,
    #[serde(default = "default_head_activation")]
    pub activation: NonLinearity,
}

fn default_head_activation() -> NonLinearity {
    NonLinearity::Tanh
}

impl HeadConfig {
    pub fn classification(num_labels: usize) -> Self {
        Self {
            head_type: HeadType::Classification,
            num_labels,
            activation: default_head_activation(),
        }
    }

    pub fn tagging(num_labels: usize) -> Self {
        Self {
            head_type: HeadType::Tagging,
            ..Self::classification(num_labels)
        }
    }

    pub fn masked_lm(vocab_size: usize) -> Self {
        Self {
            head_type: HeadType::MaskedLm,
            activation: NonLinearity::Gelu,
            ..Self::classification(vocab_size)
        }
    }
}

/// Contents of `head_config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeadManifest {
    pub name: String,
    pub config: HeadConfig,
    pub hidden_size: usize,
    pub model_type: String,
    #[serde(default)]
    pub version: String,
}

/// Dense + activation + output projection, with its own parameter set
/// under `heads.{name}`.
pub struct PredictionHead {
    config: HeadConfig,
    dense: Linear,
    out_proj: Linear,
    params: VarMap,
}

impl PredictionHead {
    pub fn new(
        name: &str,
        config: HeadConfig,
        hidden_size: usize,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let params = VarMap::new();
        let vb = VarBuilder::from_varmap(&params, dtype, device).pp(head_path(name));
        let dense = linear(hidden_size, hidden_size, vb.pp("dense"))?;
        let out_proj = linear(hidden_size, config.num_labels, vb.pp("out_proj"))?;
        Ok(Self {
            config,
            dense,
            out_proj,
            params,
        })
    }

    pub fn config(&self) -> &HeadConfig {
        &self.config
    }

    pub fn named_parameters(&self) -> Result<BTreeMap<String, Var>> {
        Ok(lock_vars(&self.params)?
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

impl Module for PredictionHead {
    fn forward(&self, hidden_states: &Tensor) -> Result<Tensor> {
        let xs = match self.config.head_type {
            HeadType::Classification => hidden_states.narrow(1, 0, 1)?.squeeze(1)?,
            HeadType::Tagging | HeadType::MaskedLm => hidden_states.clone(),
        };
        xs.apply(&self.dense)?
            .apply(&self.config.activation)?
            .apply(&self.out_proj)
    }
}

#[derive(Debug, Clone)]
pub struct ModelOutput {
    pub hidden_states: Tensor,
    /// Output of the active head, if any.
    pub logits: Option<Tensor>,
}

/// Transformer plus named prediction heads.
///
/// The head used in a forward pass is the explicitly selected one, or else
/// the head named after the first active adapter.
pub struct ModelWithHeads {
    transformer: TransformerModel,
    heads: BTreeMap<String, PredictionHead>,
    active_head: Option<String>,
}

impl ModelWithHeads {
    pub fn new(transformer: TransformerModel) -> Self {
        Self {
            transformer,
            heads: BTreeMap::new(),
            active_head: None,
        }
    }

    pub fn transformer(&self) -> &TransformerModel {
        &self.transformer
    }

    pub fn into_transformer(self) -> TransformerModel {
        self.transformer
    }

    pub fn add_head(&mut self, name: &str, config: HeadConfig) -> std::result::Result<(), AdapterError> {
        if self.heads.contains_key(name) {
            return Err(AdapterError::NameConflict(name.to_string()));
        }
        let head = PredictionHead::new(
            name,
            config,
            self.transformer.config.hidden_size,
            self.transformer.device(),
            self.transformer.dtype(),
        )?;
        self.heads.insert(name.to_string(), head);
        info!(head = name, "Added prediction head");
        Ok(())
    }

    pub fn add_classification_head(
        &mut self,
        name: &str,
        num_labels: usize,
    ) -> std::result::Result<(), AdapterError> {
        self.add_head(name, HeadConfig::classification(num_labels))
    }

    pub fn delete_head(&mut self, name: &str) -> bool {
        if self.active_head.as_deref() == Some(name) {
            self.active_head = None;
        }
        self.heads.remove(name).is_some()
    }

    pub fn head(&self, name: &str) -> Option<&PredictionHead> {
        self.heads.get(name)
    }

    pub fn head_names(&self) -> impl Iterator<Item = &str> {
        self.heads.keys().map(String::as_str)
    }

    pub fn set_active_head(&mut self, name: Option<&str>) -> std::result::Result<(), AdapterError> {
        if let Some(name) = name {
            if !self.heads.contains_key(name) {
                return Err(AdapterError::AdapterNotFound(name.to_string()));
            }
        }
        self.active_head = name.map(str::to_string);
        Ok(())
    }

    /// Head that the next forward pass on this thread would use.
    pub fn active_head(&self) -> Option<&str> {
        let active = self.transformer.adapter_manager().resolve_active();
        self.resolve_head(&active).map(|(name, _)| name)
    }

    fn resolve_head(&self, active: &[String]) -> Option<(&str, &PredictionHead)> {
        if let Some(name) = &self.active_head {
            return self
                .heads
                .get_key_value(name)
                .map(|(n, head)| (n.as_str(), head));
        }
        active.iter().find_map(|name| {
            self.heads
                .get_key_value(name)
                .map(|(n, head)| (n.as_str(), head))
        })
    }

    pub fn forward(&self, input_ids: &Tensor) -> Result<ModelOutput> {
        let (batch_size, _seq_len) = input_ids.dims2()?;
        let ctx = self.transformer.adapter_manager().forward_context(batch_size)?;
        self.forward_with_context(input_ids, &ctx)
    }

    pub fn forward_with_adapters(
        &self,
        input_ids: &Tensor,
        adapters: impl Into<ActiveAdapters>,
    ) -> Result<ModelOutput> {
        let _setup = AdapterSetup::new(adapters);
        self.forward(input_ids)
    }

    pub fn forward_with_context(&self, input_ids: &Tensor, ctx: &ForwardContext) -> Result<ModelOutput> {
        let hidden_states = self.transformer.forward_with_context(input_ids, ctx)?;
        self.apply_head(hidden_states, ctx)
    }

    /// Decoder forward pass continuing after `past`; see
    /// [`TransformerModel::forward_with_past`].
    pub fn forward_with_past(
        &self,
        input_ids: &Tensor,
        past: Option<&PastKeyValues>,
    ) -> Result<(ModelOutput, PastKeyValues)> {
        let (batch_size, _seq_len) = input_ids.dims2()?;
        let ctx = self.transformer.adapter_manager().forward_context(batch_size)?;
        let (hidden_states, present) =
            self.transformer
                .forward_with_past_and_context(input_ids, past, &ctx)?;
        Ok((self.apply_head(hidden_states, &ctx)?, present))
    }

    fn apply_head(&self, hidden_states: Tensor, ctx: &ForwardContext) -> Result<ModelOutput> {
        let logits = match self.resolve_head(ctx.active()) {
            Some((_, head)) => {
                let head_input = match head.config().head_type {
                    HeadType::MaskedLm => self
                        .transformer
                        .adapter_manager()
                        .invertible_inverse(&hidden_states, ctx)?,
                    _ => hidden_states.clone(),
                };
                Some(head.forward(&head_input)?)
            }
            None => None,
        };
        Ok(ModelOutput {
            hidden_states,
            logits,
        })
    }
}

impl AdapterModel for ModelWithHeads {
    fn adapter_manager(&self) -> &AdapterManager {
        self.transformer.adapter_manager()
    }

    fn adapter_manager_mut(&mut self) -> &mut AdapterManager {
        self.transformer.adapter_manager_mut()
    }

    fn base_model_prefix(&self) -> Option<&str> {
        Some(BASE_MODEL_PREFIX)
    }

    fn has_head(&self, name: &str) -> bool {
        self.heads.contains_key(name)
    }

    fn save_head(&self, name: &str, dir: &Path) -> std::result::Result<(), AdapterError> {
        let head = self
            .heads
            .get(name)
            .ok_or_else(|| AdapterError::AdapterNotFound(name.to_string()))?;
        std::fs::create_dir_all(dir).map_err(AdapterLoadError::from)?;

        let tensors = head
            .named_parameters()?
            .into_iter()
            .map(|(key, var)| (key, var.as_tensor().clone()))
            .collect();
        save_tensors(&tensors, &dir.join(HEAD_WEIGHTS_NAME))?;

        let manifest = HeadManifest {
            name: name.to_string(),
            config: head.config().clone(),
            hidden_size: self.transformer.config.hidden_size,
            model_type: self.transformer.config.model_type.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        };
        write_json(&dir.join(HEAD_CONFIG_NAME), &manifest)?;
        info!(head = name, path = %dir.display(), "Saved prediction head");
        Ok(())
    }

    fn load_head(
        &mut self,
        dir: &Path,
        name: &str,
        loading_info: Option<&mut LoadingInfo>,
    ) -> std::result::Result<bool, AdapterError> {
        let manifest: HeadManifest = read_json(&dir.join(HEAD_CONFIG_NAME))?;
        let hidden_size = self.transformer.config.hidden_size;
        if manifest.hidden_size != hidden_size {
            return Err(AdapterLoadError::HostMismatch {
                field: "hidden_size",
                saved: manifest.hidden_size,
                host: hidden_size,
            }
            .into());
        }

        let added_here = match self.heads.get(name) {
            Some(existing) if *existing.config() == manifest.config => false,
            Some(_) => return Err(AdapterError::NameConflict(name.to_string())),
            None => {
                self.add_head(name, manifest.config.clone())?;
                true
            }
        };

        let result = match self.heads.get(name) {
            Some(head) => head.named_parameters().map_err(AdapterError::from).and_then(|params| {
                self.transformer
                    .adapter_manager()
                    .loader()
                    .load_into(&dir.join(HEAD_WEIGHTS_NAME), None, &manifest.name, name, &params)
                    .map_err(AdapterError::from)
            }),
            None => Err(AdapterError::AdapterNotFound(name.to_string())),
        };
        let info = match result {
            Ok(info) => info,
            Err(e) => {
                if added_here {
                    self.heads.remove(name);
                }
                return Err(e);
            }
        };

        info!(head = name, path = %dir.display(), "Loaded prediction head");
        if let Some(out) = loading_info {
            out.extend(info);
        }
        Ok(true)
    }
}
