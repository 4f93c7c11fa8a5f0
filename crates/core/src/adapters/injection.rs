//! Injection point registry.
//!
//! Every host layer exposes a fixed set of attachment slots. Each adapter
//! family may only attach at the slots it knows how to merge into:
//!
//! | family        | slots                                                     |
//! |---------------|-----------------------------------------------------------|
//! | bottleneck    | `pre_attention`, `post_attention`, `post_feed_forward`    |
//! | prefix tuning | `attention_key_value`                                     |
//! | invertible    | `embedding`                                               |
//!
//! The registry also owns the parameter naming scheme, so that the
//! persistence layer and the host network agree on fully-qualified names.

use std::collections::BTreeMap;
use std::fmt;

use candle_core::{Result, Tensor};
use serde::{Deserialize, Serialize};

use super::bottleneck::BottleneckAdapter;
use super::config::AdapterConfigError;
use super::context::ForwardContext;
use super::prefix::PrefixShim;
use crate::config::ModelConfig;

/// Closed set of adapter families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterFamily {
    Bottleneck,
    PrefixTuning,
    Invertible,
}

impl fmt::Display for AdapterFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Bottleneck => "bottleneck",
            Self::PrefixTuning => "prefix_tuning",
            Self::Invertible => "invertible",
        };
        f.write_str(name)
    }
}

/// Attachment slot inside the host network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectionSlot {
    /// Hidden states entering the attention block.
    PreAttention,
    /// Output of the attention block, before its residual add + LayerNorm.
    PostAttention,
    /// Output of the feed-forward block, before its residual add + LayerNorm.
    PostFeedForward,
    /// Keys and values of self-attention.
    AttentionKeyValue,
    /// Embedding output (forward) and head input (inverse).
    Embedding,
}

impl InjectionSlot {
    /// Slots whose contributions are added to the residual stream.
    pub const RESIDUAL: [InjectionSlot; 3] = [
        InjectionSlot::PreAttention,
        InjectionSlot::PostAttention,
        InjectionSlot::PostFeedForward,
    ];

    /// Whether modules of `family` may attach here.
    pub fn accepts(self, family: AdapterFamily) -> bool {
        match family {
            AdapterFamily::Bottleneck => Self::RESIDUAL.contains(&self),
            AdapterFamily::PrefixTuning => self == Self::AttentionKeyValue,
            AdapterFamily::Invertible => self == Self::Embedding,
        }
    }

    /// Sub-module path inside `encoder.layer.{i}` that owns this slot.
    pub fn module_path(self) -> &'static str {
        match self {
            Self::PreAttention => "attention_input",
            Self::PostAttention => "attention.output",
            Self::PostFeedForward => "output",
            Self::AttentionKeyValue => "attention.self",
            Self::Embedding => "embeddings",
        }
    }
}

impl fmt::Display for InjectionSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PreAttention => "pre_attention",
            Self::PostAttention => "post_attention",
            Self::PostFeedForward => "post_feed_forward",
            Self::AttentionKeyValue => "attention_key_value",
            Self::Embedding => "embedding",
        };
        f.write_str(name)
    }
}

/// Reject family/slot combinations the host cannot merge.
pub fn check_slot(family: AdapterFamily, slot: InjectionSlot) -> std::result::Result<(), AdapterConfigError> {
    if slot.accepts(family) {
        Ok(())
    } else {
        Err(AdapterConfigError::IncompatibleSlot { family, slot })
    }
}

/// Host dimensions that adapter shapes are derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostDims {
    pub hidden_size: usize,
    pub num_layers: usize,
    pub num_heads: usize,
}

impl HostDims {
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_heads
    }
}

impl From<&ModelConfig> for HostDims {
    fn from(cfg: &ModelConfig) -> Self {
        Self {
            hidden_size: cfg.hidden_size,
            num_layers: cfg.num_hidden_layers,
            num_heads: cfg.num_attention_heads,
        }
    }
}

// ─── Parameter naming ────────────────────────────────────────────────────────

/// Path segments after which the adapter name appears.
const NAME_SCOPES: [&str; 4] = ["adapters", "prefix_tunings", "invertible_adapters", "heads"];

/// Root segments of every adapter-owned parameter in an unprefixed host.
pub(crate) const PARAMETER_ROOTS: [&str; 4] =
    ["encoder", "prefix_tunings", "invertible_adapters", "heads"];

pub fn bottleneck_path(layer_idx: usize, slot: InjectionSlot, name: &str) -> String {
    format!(
        "encoder.layer.{layer_idx}.{}.adapters.{name}",
        slot.module_path()
    )
}

pub fn prefix_path(name: &str) -> String {
    format!("prefix_tunings.{name}")
}

pub fn invertible_path(name: &str) -> String {
    format!("invertible_adapters.{name}")
}

pub fn head_path(name: &str) -> String {
    format!("heads.{name}")
}

/// Rename the adapter segment of a parameter name.
///
/// Only a segment directly following one of the name scopes is rewritten,
/// so adapter names that collide with structural segments are safe.
pub fn rename_adapter_segment(key: &str, from: &str, to: &str) -> String {
    if from == to {
        return key.to_string();
    }
    let mut segments: Vec<&str> = key.split('.').collect();
    for i in 1..segments.len() {
        if segments[i] == from && NAME_SCOPES.contains(&segments[i - 1]) {
            segments[i] = to;
        }
    }
    segments.join(".")
}

// ─── Per-layer modules and composition ───────────────────────────────────────

/// Activation state flowing through a slot while adapters are composed.
pub enum HookState {
    /// Residual slots: contributions are summed into `delta`.
    Residual {
        input: Tensor,
        output: Tensor,
        delta: Option<Tensor>,
    },
    /// Key/value slot: prefixes are appended in activation order and later
    /// concatenated ahead of the base sequence.
    KeyValue {
        keys: Vec<Tensor>,
        values: Vec<Tensor>,
    },
}

/// Merge rule implemented by every per-layer module variant.
pub trait Compose {
    fn compose(&self, name: &str, state: &mut HookState, ctx: &ForwardContext) -> Result<()>;
}

/// A module attached at one slot of one layer.
pub enum LayerModule {
    Bottleneck(BottleneckAdapter),
    Prefix(PrefixShim),
}

impl LayerModule {
    pub fn family(&self) -> AdapterFamily {
        match self {
            Self::Bottleneck(_) => AdapterFamily::Bottleneck,
            Self::Prefix(_) => AdapterFamily::PrefixTuning,
        }
    }

    pub fn as_bottleneck(&self) -> Option<&BottleneckAdapter> {
        match self {
            Self::Bottleneck(adapter) => Some(adapter),
            Self::Prefix(_) => None,
        }
    }
}

impl Compose for LayerModule {
    fn compose(&self, name: &str, state: &mut HookState, ctx: &ForwardContext) -> Result<()> {
        match self {
            Self::Bottleneck(adapter) => adapter.compose(name, state, ctx),
            Self::Prefix(shim) => shim.compose(name, state, ctx),
        }
    }
}

/// All modules one adapter owns in a single host layer.
pub struct LayerModules {
    layer_idx: usize,
    modules: BTreeMap<InjectionSlot, LayerModule>,
}

impl LayerModules {
    pub(crate) fn new(layer_idx: usize) -> Self {
        Self {
            layer_idx,
            modules: BTreeMap::new(),
        }
    }

    pub(crate) fn insert(&mut self, slot: InjectionSlot, module: LayerModule) {
        self.modules.insert(slot, module);
    }

    pub fn layer_idx(&self) -> usize {
        self.layer_idx
    }

    pub fn get(&self, slot: InjectionSlot) -> Option<&LayerModule> {
        self.modules.get(&slot)
    }

    /// Bottleneck module at a residual slot, if any.
    pub fn bottleneck(&self, slot: InjectionSlot) -> Option<&BottleneckAdapter> {
        self.get(slot).and_then(LayerModule::as_bottleneck)
    }

    pub fn slots(&self) -> impl Iterator<Item = InjectionSlot> + '_ {
        self.modules.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}
