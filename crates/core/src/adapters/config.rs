//! Adapter configuration model.
//!
//! Configs are immutable value objects that fully determine the shape of the
//! modules an adapter owns. They are validated against the host dimensions
//! when the adapter is attached, never later.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use candle_core::{Module, Result, Tensor};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::injection::{check_slot, AdapterFamily, HostDims, InjectionSlot};

/// Configuration and structural errors, raised synchronously at attach time.
#[derive(Debug, Error, PartialEq)]
pub enum AdapterConfigError {
    #[error("unknown adapter config: {0}")]
    UnknownConfig(String),
    #[error("no reduction factor resolves for layer {layer} and no \"default\" key is set")]
    InvalidReductionFactor { layer: usize },
    #[error("reduction factor key '{key}' is not a valid layer id")]
    InvalidLayerKey { key: String },
    #[error("{family} modules cannot attach at slot {slot}")]
    IncompatibleSlot {
        family: AdapterFamily,
        slot: InjectionSlot,
    },
    #[error("parallel placement is not defined at slot {0}")]
    InvalidPlacement(InjectionSlot),
    #[error("adapter config has no injection points")]
    NoInjectionPoints,
    #[error("config union may hold at most one {0} config")]
    DuplicateFamily(AdapterFamily),
    #[error("config unions cannot be nested")]
    NestedUnion,
    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

type ConfigResult<T> = std::result::Result<T, AdapterConfigError>;

// ─── Non-linearity ───────────────────────────────────────────────────────────

/// Activation used inside adapter modules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NonLinearity {
    #[default]
    Relu,
    #[serde(alias = "silu")]
    Swish,
    Gelu,
    Tanh,
}

impl Module for NonLinearity {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Self::Relu => xs.relu(),
            Self::Swish => xs.silu(),
            Self::Gelu => xs.gelu(),
            Self::Tanh => xs.tanh(),
        }
    }
}

impl FromStr for NonLinearity {
    type Err = AdapterConfigError;

    fn from_str(s: &str) -> ConfigResult<Self> {
        match s.to_lowercase().as_str() {
            "relu" => Ok(Self::Relu),
            "swish" | "silu" => Ok(Self::Swish),
            "gelu" | "gelu_new" => Ok(Self::Gelu),
            "tanh" => Ok(Self::Tanh),
            other => Err(AdapterConfigError::InvalidValue(format!(
                "unknown non-linearity '{other}'"
            ))),
        }
    }
}

// ─── Reduction factor ────────────────────────────────────────────────────────

/// Ratio between the host hidden size and the bottleneck width.
///
/// JSON form is either a number or an object keyed by layer id with an
/// optional `"default"` fallback, e.g. `{"1": 1, "default": 2}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawReductionFactor", into = "RawReductionFactor")]
pub enum ReductionFactor {
    Scalar(f64),
    PerLayer {
        factors: BTreeMap<usize, f64>,
        default: Option<f64>,
    },
}

impl ReductionFactor {
    /// Mapping form from `(layer, factor)` pairs plus an optional default.
    pub fn per_layer(
        factors: impl IntoIterator<Item = (usize, f64)>,
        default: Option<f64>,
    ) -> Self {
        Self::PerLayer {
            factors: factors.into_iter().collect(),
            default,
        }
    }

    /// Factor for `layer_idx`. A specific key wins over `default`.
    pub fn resolve(&self, layer_idx: usize) -> ConfigResult<f64> {
        match self {
            Self::Scalar(factor) => Ok(*factor),
            Self::PerLayer { factors, default } => factors
                .get(&layer_idx)
                .or(default.as_ref())
                .copied()
                .ok_or(AdapterConfigError::InvalidReductionFactor { layer: layer_idx }),
        }
    }

    fn validate(&self, num_layers: usize) -> ConfigResult<()> {
        let check = |factor: f64| {
            if factor.is_finite() && factor > 0.0 {
                Ok(())
            } else {
                Err(AdapterConfigError::InvalidValue(format!(
                    "reduction factor must be positive, got {factor}"
                )))
            }
        };
        match self {
            Self::Scalar(factor) => check(*factor),
            Self::PerLayer { factors, default } => {
                for (&layer, &factor) in factors {
                    if layer >= num_layers {
                        return Err(AdapterConfigError::InvalidLayerKey {
                            key: layer.to_string(),
                        });
                    }
                    check(factor)?;
                }
                default.map_or(Ok(()), check)
            }
        }
    }
}

impl From<f64> for ReductionFactor {
    fn from(factor: f64) -> Self {
        Self::Scalar(factor)
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawReductionFactor {
    Scalar(f64),
    Mapping(BTreeMap<String, f64>),
}

impl TryFrom<RawReductionFactor> for ReductionFactor {
    type Error = String;

    fn try_from(raw: RawReductionFactor) -> std::result::Result<Self, String> {
        match raw {
            RawReductionFactor::Scalar(factor) => Ok(Self::Scalar(factor)),
            RawReductionFactor::Mapping(map) => {
                let mut factors = BTreeMap::new();
                let mut default = None;
                for (key, factor) in map {
                    if key == "default" {
                        default = Some(factor);
                        continue;
                    }
                    let layer = key
                        .parse::<usize>()
                        .map_err(|_| format!("reduction factor key '{key}' is not a layer id"))?;
                    factors.insert(layer, factor);
                }
                Ok(Self::PerLayer { factors, default })
            }
        }
    }
}

impl From<ReductionFactor> for RawReductionFactor {
    fn from(rf: ReductionFactor) -> Self {
        match rf {
            ReductionFactor::Scalar(factor) => Self::Scalar(factor),
            ReductionFactor::PerLayer { factors, default } => {
                let mut map: BTreeMap<String, f64> = factors
                    .into_iter()
                    .map(|(layer, factor)| (layer.to_string(), factor))
                    .collect();
                if let Some(default) = default {
                    map.insert("default".to_string(), default);
                }
                Self::Mapping(map)
            }
        }
    }
}

/// Width of a bottleneck for `in_features` and a resolved factor.
pub(crate) fn bottleneck_width(in_features: usize, factor: f64) -> ConfigResult<usize> {
    let width = (in_features as f64 / factor).floor() as usize;
    if width == 0 {
        return Err(AdapterConfigError::InvalidValue(format!(
            "reduction factor {factor} leaves no bottleneck for {in_features} features"
        )));
    }
    Ok(width)
}

// ─── Family configs ──────────────────────────────────────────────────────────

/// Where a bottleneck reads its input from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    /// Reads the sub-layer output ("post").
    #[default]
    #[serde(alias = "post")]
    Sequential,
    /// Reads the sub-layer input ("pre"); its output is still added to the
    /// sub-layer output.
    #[serde(alias = "pre")]
    Parallel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvertibleKind {
    #[default]
    Nice,
    Glow,
}

/// Invertible coupling block hooked at the embedding slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvertibleConfig {
    #[serde(default)]
    pub kind: InvertibleKind,
    #[serde(default = "default_inv_reduction_factor")]
    pub reduction_factor: f64,
    #[serde(default)]
    pub non_linearity: NonLinearity,
}

fn default_inv_reduction_factor() -> f64 {
    2.0
}

impl Default for InvertibleConfig {
    fn default() -> Self {
        Self {
            kind: InvertibleKind::Nice,
            reduction_factor: default_inv_reduction_factor(),
            non_linearity: NonLinearity::Relu,
        }
    }
}

/// Down-project → non-linearity → up-project adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BottleneckConfig {
    pub locations: Vec<InjectionSlot>,
    #[serde(default)]
    pub placement: Placement,
    pub reduction_factor: ReductionFactor,
    #[serde(default)]
    pub non_linearity: NonLinearity,
    #[serde(default = "default_scaling")]
    pub scaling: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inv_adapter: Option<InvertibleConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub leave_out: Vec<usize>,
}

fn default_scaling() -> f64 {
    1.0
}

impl BottleneckConfig {
    /// Single sequential adapter after the feed-forward block.
    pub fn pfeiffer() -> Self {
        Self {
            locations: vec![InjectionSlot::PostFeedForward],
            placement: Placement::Sequential,
            reduction_factor: ReductionFactor::Scalar(16.0),
            non_linearity: NonLinearity::Relu,
            scaling: 1.0,
            inv_adapter: None,
            leave_out: Vec::new(),
        }
    }

    /// Sequential adapters after both attention and feed-forward blocks.
    pub fn houlsby() -> Self {
        Self {
            locations: vec![InjectionSlot::PostAttention, InjectionSlot::PostFeedForward],
            non_linearity: NonLinearity::Swish,
            ..Self::pfeiffer()
        }
    }

    /// Scaled parallel adapter at the feed-forward block.
    pub fn parallel() -> Self {
        Self {
            locations: vec![InjectionSlot::PostFeedForward],
            placement: Placement::Parallel,
            reduction_factor: ReductionFactor::Scalar(2.0),
            non_linearity: NonLinearity::Relu,
            scaling: 4.0,
            inv_adapter: None,
            leave_out: Vec::new(),
        }
    }

    pub fn with_reduction_factor(mut self, reduction_factor: impl Into<ReductionFactor>) -> Self {
        self.reduction_factor = reduction_factor.into();
        self
    }

    pub fn with_invertible(mut self, inv: InvertibleConfig) -> Self {
        self.inv_adapter = Some(inv);
        self
    }

    pub fn with_leave_out(mut self, layers: impl IntoIterator<Item = usize>) -> Self {
        self.leave_out = layers.into_iter().collect();
        self
    }

    /// Layers that receive per-layer modules.
    pub fn applies_to(&self, layer_idx: usize) -> bool {
        !self.leave_out.contains(&layer_idx)
    }

    fn validate(&self, dims: &HostDims) -> ConfigResult<()> {
        if self.locations.is_empty() && self.inv_adapter.is_none() {
            return Err(AdapterConfigError::NoInjectionPoints);
        }
        for &slot in &self.locations {
            check_slot(AdapterFamily::Bottleneck, slot)?;
            if slot == InjectionSlot::PreAttention && self.placement == Placement::Parallel {
                return Err(AdapterConfigError::InvalidPlacement(slot));
            }
        }
        if !self.scaling.is_finite() {
            return Err(AdapterConfigError::InvalidValue(format!(
                "scaling must be finite, got {}",
                self.scaling
            )));
        }
        validate_leave_out(&self.leave_out, dims.num_layers)?;
        // A layer without a factor is reported before any stray key.
        let applicable: Vec<usize> = if self.locations.is_empty() {
            Vec::new()
        } else {
            (0..dims.num_layers).filter(|&l| self.applies_to(l)).collect()
        };
        let factors = applicable
            .iter()
            .map(|&layer| self.reduction_factor.resolve(layer))
            .collect::<ConfigResult<Vec<f64>>>()?;
        self.reduction_factor.validate(dims.num_layers)?;
        for factor in factors {
            bottleneck_width(dims.hidden_size, factor)?;
        }
        if let Some(inv) = &self.inv_adapter {
            if dims.hidden_size < 2 {
                return Err(AdapterConfigError::InvalidValue(
                    "invertible adapters need a hidden size of at least 2".to_string(),
                ));
            }
            ReductionFactor::Scalar(inv.reduction_factor).validate(dims.num_layers)?;
            bottleneck_width(dims.hidden_size / 2, inv.reduction_factor)?;
        }
        Ok(())
    }
}

/// Prefix tuning: learned key/value prefixes for every attention layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrefixTuningConfig {
    #[serde(default = "default_prefix_length")]
    pub prefix_length: usize,
    #[serde(default = "default_prefix_bottleneck")]
    pub bottleneck_size: usize,
    #[serde(default = "default_prefix_non_linearity")]
    pub non_linearity: NonLinearity,
    /// Store prefixes directly instead of generating them through an MLP.
    #[serde(default)]
    pub flat: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub leave_out: Vec<usize>,
}

fn default_prefix_length() -> usize {
    30
}

fn default_prefix_bottleneck() -> usize {
    512
}

fn default_prefix_non_linearity() -> NonLinearity {
    NonLinearity::Tanh
}

impl Default for PrefixTuningConfig {
    fn default() -> Self {
        Self {
            prefix_length: default_prefix_length(),
            bottleneck_size: default_prefix_bottleneck(),
            non_linearity: default_prefix_non_linearity(),
            flat: false,
            leave_out: Vec::new(),
        }
    }
}

impl PrefixTuningConfig {
    pub fn flat() -> Self {
        Self {
            flat: true,
            ..Self::default()
        }
    }

    pub fn applies_to(&self, layer_idx: usize) -> bool {
        !self.leave_out.contains(&layer_idx)
    }

    fn validate(&self, dims: &HostDims) -> ConfigResult<()> {
        if self.prefix_length == 0 {
            return Err(AdapterConfigError::InvalidValue(
                "prefix_length must be at least 1".to_string(),
            ));
        }
        if !self.flat && self.bottleneck_size == 0 {
            return Err(AdapterConfigError::InvalidValue(
                "bottleneck_size must be at least 1".to_string(),
            ));
        }
        if dims.num_heads == 0 || dims.hidden_size % dims.num_heads != 0 {
            return Err(AdapterConfigError::InvalidValue(format!(
                "hidden size {} is not divisible into {} heads",
                dims.hidden_size, dims.num_heads
            )));
        }
        validate_leave_out(&self.leave_out, dims.num_layers)
    }
}

fn validate_leave_out(leave_out: &[usize], num_layers: usize) -> ConfigResult<()> {
    match leave_out.iter().find(|&&layer| layer >= num_layers) {
        Some(layer) => Err(AdapterConfigError::InvalidValue(format!(
            "leave_out layer {layer} does not exist (host has {num_layers} layers)"
        ))),
        None => Ok(()),
    }
}

// ─── AdapterConfig ───────────────────────────────────────────────────────────

/// Closed set of adapter architectures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "architecture", rename_all = "snake_case")]
pub enum AdapterConfig {
    Bottleneck(BottleneckConfig),
    PrefixTuning(PrefixTuningConfig),
    /// Several families applied together, each by its own composition rule.
    Union { configs: Vec<AdapterConfig> },
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self::Bottleneck(BottleneckConfig::pfeiffer())
    }
}

impl AdapterConfig {
    /// Prefix tuning combined with a scaled parallel adapter ("mix-and-match").
    pub fn mam() -> Self {
        Self::Union {
            configs: vec![
                Self::PrefixTuning(PrefixTuningConfig {
                    bottleneck_size: 800,
                    ..PrefixTuningConfig::default()
                }),
                Self::Bottleneck(BottleneckConfig::parallel()),
            ],
        }
    }

    /// Look up a preset in the static registry.
    pub fn by_name(name: &str) -> Option<Self> {
        ADAPTER_CONFIG_REGISTRY
            .iter()
            .find(|(preset, _)| *preset == name)
            .map(|(_, build)| build())
    }

    /// Every registry preset, in table order.
    pub fn known_configs() -> impl Iterator<Item = (&'static str, AdapterConfig)> {
        ADAPTER_CONFIG_REGISTRY
            .iter()
            .map(|(name, build)| (*name, build()))
    }

    /// Non-union configs, in declaration order.
    pub fn leaves(&self) -> Vec<&AdapterConfig> {
        match self {
            Self::Union { configs } => configs.iter().collect(),
            leaf => vec![leaf],
        }
    }

    pub fn bottleneck(&self) -> Option<&BottleneckConfig> {
        self.leaves().into_iter().find_map(|leaf| match leaf {
            Self::Bottleneck(cfg) => Some(cfg),
            _ => None,
        })
    }

    pub fn prefix_tuning(&self) -> Option<&PrefixTuningConfig> {
        self.leaves().into_iter().find_map(|leaf| match leaf {
            Self::PrefixTuning(cfg) => Some(cfg),
            _ => None,
        })
    }

    pub(crate) fn prefix_tuning_mut(&mut self) -> Option<&mut PrefixTuningConfig> {
        match self {
            Self::PrefixTuning(cfg) => Some(cfg),
            Self::Union { configs } => configs.iter_mut().find_map(|c| c.prefix_tuning_mut()),
            Self::Bottleneck(_) => None,
        }
    }

    pub fn invertible(&self) -> Option<&InvertibleConfig> {
        self.bottleneck().and_then(|cfg| cfg.inv_adapter.as_ref())
    }

    pub fn is_invertible(&self) -> bool {
        self.invertible().is_some()
    }

    /// Families present in this config.
    pub fn families(&self) -> Vec<AdapterFamily> {
        let mut families = Vec::new();
        if self.bottleneck().is_some() {
            families.push(AdapterFamily::Bottleneck);
        }
        if self.prefix_tuning().is_some() {
            families.push(AdapterFamily::PrefixTuning);
        }
        if self.is_invertible() {
            families.push(AdapterFamily::Invertible);
        }
        families
    }

    /// Validate against host dimensions.
    pub fn validate(&self, dims: &HostDims) -> ConfigResult<()> {
        match self {
            Self::Bottleneck(cfg) => cfg.validate(dims),
            Self::PrefixTuning(cfg) => cfg.validate(dims),
            Self::Union { configs } => {
                if configs.is_empty() {
                    return Err(AdapterConfigError::NoInjectionPoints);
                }
                let mut seen = Vec::new();
                for cfg in configs {
                    let family = match cfg {
                        Self::Bottleneck(_) => AdapterFamily::Bottleneck,
                        Self::PrefixTuning(_) => AdapterFamily::PrefixTuning,
                        Self::Union { .. } => return Err(AdapterConfigError::NestedUnion),
                    };
                    if seen.contains(&family) {
                        return Err(AdapterConfigError::DuplicateFamily(family));
                    }
                    seen.push(family);
                    cfg.validate(dims)?;
                }
                Ok(())
            }
        }
    }
}

impl FromStr for AdapterConfig {
    type Err = AdapterConfigError;

    fn from_str(s: &str) -> ConfigResult<Self> {
        Self::by_name(s).ok_or_else(|| AdapterConfigError::UnknownConfig(s.to_string()))
    }
}

impl From<BottleneckConfig> for AdapterConfig {
    fn from(cfg: BottleneckConfig) -> Self {
        Self::Bottleneck(cfg)
    }
}

impl From<PrefixTuningConfig> for AdapterConfig {
    fn from(cfg: PrefixTuningConfig) -> Self {
        Self::PrefixTuning(cfg)
    }
}

impl fmt::Display for AdapterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => write!(f, "{self:?}"),
        }
    }
}

/// Named presets. Adding a preset is a one-line change here.
static ADAPTER_CONFIG_REGISTRY: &[(&str, fn() -> AdapterConfig)] = &[
    ("pfeiffer", || BottleneckConfig::pfeiffer().into()),
    ("houlsby", || BottleneckConfig::houlsby().into()),
    ("pfeiffer+inv", || {
        BottleneckConfig::pfeiffer()
            .with_invertible(InvertibleConfig::default())
            .into()
    }),
    ("houlsby+inv", || {
        BottleneckConfig::houlsby()
            .with_invertible(InvertibleConfig::default())
            .into()
    }),
    ("parallel", || BottleneckConfig::parallel().into()),
    ("prefix_tuning", || PrefixTuningConfig::default().into()),
    ("prefix_tuning_flat", || PrefixTuningConfig::flat().into()),
    ("mam", AdapterConfig::mam),
];
