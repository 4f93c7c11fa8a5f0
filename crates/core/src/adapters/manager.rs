//! Adapter lifecycle and composition controller.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::MutexGuard;

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use thiserror::Error;
use tracing::{debug, info};

use super::bottleneck::BottleneckAdapter;
use super::config::{bottleneck_width, AdapterConfig, AdapterConfigError};
use super::context::{ActiveAdapters, AdapterSetup, ForwardContext};
use super::injection::{
    bottleneck_path, invertible_path, prefix_path, Compose, HookState, HostDims, InjectionSlot,
    LayerModule, LayerModules,
};
use super::invertible::InvertibleAdapter;
use super::loader::{AdapterLoadError, AdapterLoader, LoadOptions, LoadingInfo};
use super::prefix::{PrefixGeometry, PrefixShim, PrefixTuning};

/// Errors from the adapter manager.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("adapter name already in use: {0}")]
    NameConflict(String),
    #[error("adapter not found: {0}")]
    AdapterNotFound(String),
    #[error("invalid adapter name '{0}': names must be non-empty and contain no '.'")]
    InvalidName(String),
    #[error("adapter {0} has no prefix tuning module")]
    NotPrefixTuning(String),
    #[error("config error: {0}")]
    Config(#[from] AdapterConfigError),
    #[error("load error: {0}")]
    LoadError(#[from] AdapterLoadError),
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

/// Everything one adapter owns, apart from its invertible module.
struct AdapterModules {
    /// Only layers that received at least one module, ordered by layer id.
    layers: Vec<LayerModules>,
    prefix: Option<PrefixTuning>,
    params: VarMap,
}

struct InvertibleEntry {
    module: InvertibleAdapter,
    params: VarMap,
}

/// Owns the attached adapters of one host network.
///
/// Provides:
/// - attach / detach of named adapters built from an [`AdapterConfig`]
/// - the persistent active set, overridable per scope with [`AdapterSetup`]
/// - per-slot composition hooks the host calls during its forward pass
/// - persistence of adapter weight subsets through [`AdapterLoader`]
pub struct AdapterManager {
    dims: HostDims,
    model_type: String,
    configs: BTreeMap<String, AdapterConfig>,
    modules: HashMap<String, AdapterModules>,
    invertible: BTreeMap<String, InvertibleEntry>,
    active: Option<ActiveAdapters>,
    loader: AdapterLoader,
}

impl AdapterManager {
    pub fn new(dims: HostDims, model_type: impl Into<String>, device: Device, dtype: DType) -> Self {
        Self {
            dims,
            model_type: model_type.into(),
            configs: BTreeMap::new(),
            modules: HashMap::new(),
            invertible: BTreeMap::new(),
            active: None,
            loader: AdapterLoader::new(device, dtype),
        }
    }

    pub fn dims(&self) -> &HostDims {
        &self.dims
    }

    pub fn model_type(&self) -> &str {
        &self.model_type
    }

    pub fn device(&self) -> &Device {
        self.loader.device()
    }

    pub fn dtype(&self) -> DType {
        self.loader.dtype()
    }

    pub fn loader(&self) -> &AdapterLoader {
        &self.loader
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────────

    /// Attach a new adapter.
    ///
    /// The config is validated against the host dimensions and every module
    /// is built before any state changes, so a failed add leaves the manager
    /// untouched.
    pub fn add(&mut self, name: &str, config: AdapterConfig) -> Result<(), AdapterError> {
        validate_name(name)?;
        if self.configs.contains_key(name) {
            return Err(AdapterError::NameConflict(name.to_string()));
        }
        config.validate(&self.dims)?;

        let modules = self.build_modules(name, &config)?;
        let invertible = match config.invertible() {
            Some(inv) => {
                let params = VarMap::new();
                let vb = VarBuilder::from_varmap(&params, self.dtype(), self.device());
                let module =
                    InvertibleAdapter::new(self.dims.hidden_size, inv, vb.pp(invertible_path(name)))?;
                Some(InvertibleEntry { module, params })
            }
            None => None,
        };

        info!(
            adapter = name,
            families = ?config.families(),
            layers = modules.layers.len(),
            "Attached adapter"
        );
        self.configs.insert(name.to_string(), config);
        self.modules.insert(name.to_string(), modules);
        if let Some(entry) = invertible {
            self.invertible.insert(name.to_string(), entry);
        }
        Ok(())
    }

    fn build_modules(&self, name: &str, config: &AdapterConfig) -> Result<AdapterModules, AdapterError> {
        let params = VarMap::new();
        let vb = VarBuilder::from_varmap(&params, self.dtype(), self.device());
        let hidden = self.dims.hidden_size;
        let bottleneck = config.bottleneck();
        let prefix_cfg = config.prefix_tuning();
        let geometry = prefix_cfg.map(|cfg| PrefixGeometry::new(cfg.prefix_length, &self.dims));

        let mut layers = Vec::new();
        for layer_idx in 0..self.dims.num_layers {
            let mut layer = LayerModules::new(layer_idx);
            if let Some(cfg) = bottleneck.filter(|cfg| cfg.applies_to(layer_idx)) {
                let width = bottleneck_width(hidden, cfg.reduction_factor.resolve(layer_idx)?)?;
                for &slot in &cfg.locations {
                    let adapter = BottleneckAdapter::new(
                        hidden,
                        width,
                        cfg.non_linearity,
                        cfg.scaling,
                        cfg.placement,
                        vb.pp(bottleneck_path(layer_idx, slot, name)),
                    )?;
                    layer.insert(slot, LayerModule::Bottleneck(adapter));
                }
            }
            if let (Some(cfg), Some(geometry)) = (prefix_cfg, geometry) {
                if cfg.applies_to(layer_idx) {
                    let shim = PrefixShim::new(layer_idx, geometry);
                    layer.insert(InjectionSlot::AttentionKeyValue, LayerModule::Prefix(shim));
                }
            }
            if !layer.is_empty() {
                layers.push(layer);
            }
        }

        let prefix = match prefix_cfg {
            Some(cfg) => Some(PrefixTuning::new(cfg, &self.dims, vb.pp(prefix_path(name)))?),
            None => None,
        };
        Ok(AdapterModules {
            layers,
            prefix,
            params,
        })
    }

    /// Detach an adapter and everything it owns. Unknown names are ignored.
    pub fn delete(&mut self, name: &str) {
        if self.configs.remove(name).is_none() {
            debug!(adapter = name, "Delete of unknown adapter ignored");
            return;
        }
        self.modules.remove(name);
        self.invertible.remove(name);
        if let Some(active) = self.active.as_mut() {
            active.remove(name);
            if active.is_empty() {
                self.active = None;
            }
        }
        info!(adapter = name, "Deleted adapter");
    }

    /// Per-layer modules of an adapter, ordered by layer. Empty if absent.
    pub fn get(&self, name: &str) -> &[LayerModules] {
        self.modules
            .get(name)
            .map(|m| m.layers.as_slice())
            .unwrap_or(&[])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.configs.contains_key(name)
    }

    pub fn config(&self, name: &str) -> Option<&AdapterConfig> {
        self.configs.get(name)
    }

    /// Recorded configs of all attached adapters, keyed by name.
    pub fn configs(&self) -> &BTreeMap<String, AdapterConfig> {
        &self.configs
    }

    pub fn adapter_names(&self) -> impl Iterator<Item = &str> {
        self.configs.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }

    pub fn prefix_tuning(&self, name: &str) -> Option<&PrefixTuning> {
        self.modules.get(name).and_then(|m| m.prefix.as_ref())
    }

    // ─── Activation ──────────────────────────────────────────────────────────

    /// Replace the persistent active set. `None` deactivates all adapters.
    pub fn set_active(&mut self, adapters: Option<ActiveAdapters>) -> Result<(), AdapterError> {
        if let Some(active) = &adapters {
            if let Some(missing) = active.iter().find(|n| !self.configs.contains_key(*n)) {
                return Err(AdapterError::AdapterNotFound(missing.to_string()));
            }
        }
        debug!(active = ?adapters, "Set active adapters");
        self.active = adapters;
        Ok(())
    }

    /// Put back an active set captured before an operation that failed.
    pub(crate) fn restore_active(&mut self, active: Option<ActiveAdapters>) {
        self.active = active;
    }

    /// Persistent active set, ignoring scoped overrides.
    pub fn active(&self) -> Option<&ActiveAdapters> {
        self.active.as_ref()
    }

    /// Names in effect for the next forward pass on this thread.
    ///
    /// The innermost [`AdapterSetup`] scope wins over the persistent set.
    /// Names not attached here are skipped.
    pub fn resolve_active(&self) -> Vec<String> {
        let requested = match AdapterSetup::current() {
            Some(scoped) => scoped,
            None => self.active.clone(),
        };
        requested
            .map(|active| {
                active
                    .iter()
                    .filter(|n| self.configs.contains_key(*n))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Resolve the active set and precompute prefix states for one pass.
    pub fn forward_context(&self, batch_size: usize) -> candle_core::Result<ForwardContext> {
        let active = self.resolve_active();
        let mut prefix_states = HashMap::new();
        for name in &active {
            if let Some(pool) = self.prefix_tuning(name) {
                prefix_states.insert(name.clone(), pool.states()?);
            }
        }
        Ok(ForwardContext::new(active, prefix_states, batch_size))
    }

    // ─── Composition hooks ───────────────────────────────────────────────────

    fn layer_module(&self, name: &str, layer_idx: usize, slot: InjectionSlot) -> Option<&LayerModule> {
        let layers = &self.modules.get(name)?.layers;
        let pos = layers
            .binary_search_by_key(&layer_idx, LayerModules::layer_idx)
            .ok()?;
        layers[pos].get(slot)
    }

    /// Apply active modules at a residual slot.
    ///
    /// Returns the sub-layer output with every active contribution added, in
    /// activation order.
    pub fn hook_residual(
        &self,
        layer_idx: usize,
        slot: InjectionSlot,
        input: &Tensor,
        output: &Tensor,
        ctx: &ForwardContext,
    ) -> candle_core::Result<Tensor> {
        if !ctx.has_adapters() {
            return Ok(output.clone());
        }
        let mut state = HookState::Residual {
            input: input.clone(),
            output: output.clone(),
            delta: None,
        };
        for name in ctx.active() {
            if let Some(module) = self.layer_module(name, layer_idx, slot) {
                module.compose(name, &mut state, ctx)?;
            }
        }
        match state {
            HookState::Residual {
                output,
                delta: Some(delta),
                ..
            } => output.add(&delta),
            _ => Ok(output.clone()),
        }
    }

    /// Prefix keys and values for a layer, concatenated in activation order.
    ///
    /// Each tensor is `[batch, heads, total_prefix, head_dim]`.
    pub fn hook_key_values(
        &self,
        layer_idx: usize,
        ctx: &ForwardContext,
    ) -> candle_core::Result<Option<(Tensor, Tensor)>> {
        if !ctx.has_adapters() {
            return Ok(None);
        }
        let mut state = HookState::KeyValue {
            keys: Vec::new(),
            values: Vec::new(),
        };
        for name in ctx.active() {
            if let Some(module) = self.layer_module(name, layer_idx, InjectionSlot::AttentionKeyValue) {
                module.compose(name, &mut state, ctx)?;
            }
        }
        match state {
            HookState::KeyValue { keys, values } if !keys.is_empty() => Ok(Some((
                Tensor::cat(&keys, 2)?,
                Tensor::cat(&values, 2)?,
            ))),
            _ => Ok(None),
        }
    }

    fn active_invertible_in(&self, active: &[String]) -> Option<&InvertibleAdapter> {
        active
            .iter()
            .find_map(|name| self.invertible.get(name))
            .map(|entry| &entry.module)
    }

    /// Embedding-slot hook, forward direction.
    pub fn invertible_forward(&self, hidden: &Tensor, ctx: &ForwardContext) -> candle_core::Result<Tensor> {
        match self.active_invertible_in(ctx.active()) {
            Some(inv) => inv.forward(hidden),
            None => Ok(hidden.clone()),
        }
    }

    /// Embedding-slot hook, inverse direction (head input).
    pub fn invertible_inverse(&self, hidden: &Tensor, ctx: &ForwardContext) -> candle_core::Result<Tensor> {
        match self.active_invertible_in(ctx.active()) {
            Some(inv) => inv.inverse(hidden),
            None => Ok(hidden.clone()),
        }
    }

    // ─── Invertible side table ───────────────────────────────────────────────

    pub fn invertible_adapters(&self) -> impl Iterator<Item = (&str, &InvertibleAdapter)> {
        self.invertible
            .iter()
            .map(|(name, entry)| (name.as_str(), &entry.module))
    }

    pub fn invertible_adapter(&self, name: &str) -> Option<&InvertibleAdapter> {
        self.invertible.get(name).map(|entry| &entry.module)
    }

    /// Invertible module of the first active adapter that has one.
    pub fn get_invertible_adapter(&self) -> Option<&InvertibleAdapter> {
        self.active_invertible_in(&self.resolve_active())
    }

    /// Drop an adapter's invertible module but keep the adapter attached.
    pub fn remove_invertible_adapter(&mut self, name: &str) -> bool {
        let removed = self.invertible.remove(name).is_some();
        if removed {
            info!(adapter = name, "Removed invertible adapter");
        }
        removed
    }

    // ─── Prefix ejection ─────────────────────────────────────────────────────

    /// Replace a prefix pool's generator MLP by its output.
    ///
    /// Afterwards the adapter owns a single `control_trans` parameter and its
    /// recorded config is the equivalent flat config. Already-flat pools are
    /// left as they are.
    pub fn eject_prefix_tuning(&mut self, name: &str) -> Result<(), AdapterError> {
        let modules = self
            .modules
            .get_mut(name)
            .ok_or_else(|| AdapterError::AdapterNotFound(name.to_string()))?;
        let pool = modules
            .prefix
            .as_mut()
            .ok_or_else(|| AdapterError::NotPrefixTuning(name.to_string()))?;
        let Some(control_trans) = pool.eject()? else {
            debug!(adapter = name, "Prefix tuning already flat");
            return Ok(());
        };

        let scope = format!("{}.", prefix_path(name));
        {
            let mut vars = lock_vars(&modules.params)?;
            vars.retain(|key, _| !key.starts_with(&scope));
            vars.insert(format!("{scope}control_trans"), control_trans);
        }
        if let Some(cfg) = self.configs.get_mut(name).and_then(AdapterConfig::prefix_tuning_mut) {
            cfg.flat = true;
        }
        info!(adapter = name, "Ejected prefix tuning");
        Ok(())
    }

    // ─── Parameters ──────────────────────────────────────────────────────────

    /// Fully-qualified parameter names of an adapter, including its
    /// invertible module.
    pub fn named_parameters(&self, name: &str) -> Result<BTreeMap<String, Var>, AdapterError> {
        let modules = self
            .modules
            .get(name)
            .ok_or_else(|| AdapterError::AdapterNotFound(name.to_string()))?;
        let mut params: BTreeMap<String, Var> = lock_vars(&modules.params)?
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if let Some(entry) = self.invertible.get(name) {
            params.extend(
                lock_vars(&entry.params)?
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone())),
            );
        }
        Ok(params)
    }

    pub fn num_parameters(&self, name: &str) -> Result<usize, AdapterError> {
        Ok(self
            .named_parameters(name)?
            .values()
            .map(|v| v.elem_count())
            .sum())
    }

    /// Parameters of every attached adapter.
    pub fn all_parameters(&self) -> Result<BTreeMap<String, Var>, AdapterError> {
        let mut params = BTreeMap::new();
        for name in self.configs.keys() {
            params.extend(self.named_parameters(name)?);
        }
        Ok(params)
    }

    /// Copy tensors keyed by unprefixed parameter name into the attached
    /// adapters. Returns the adapter parameters that received no tensor.
    pub(crate) fn assign_parameters(
        &self,
        tensors: &HashMap<String, Tensor>,
    ) -> Result<Vec<String>, AdapterError> {
        let mut missing = Vec::new();
        for (key, var) in self.all_parameters()? {
            let Some(tensor) = tensors.get(&key) else {
                missing.push(key);
                continue;
            };
            if var.dims() != tensor.dims() {
                return Err(AdapterLoadError::ShapeMismatch {
                    param: key,
                    expected: var.dims().to_vec(),
                    actual: tensor.dims().to_vec(),
                }
                .into());
            }
            var.set(&tensor.to_dtype(self.dtype())?)?;
        }
        Ok(missing)
    }

    // ─── Persistence ─────────────────────────────────────────────────────────

    /// Write an adapter's weights and manifest to `dir`.
    ///
    /// `base_model_prefix` is prepended to every saved tensor name.
    pub fn save(
        &self,
        name: &str,
        dir: impl AsRef<Path>,
        base_model_prefix: Option<&str>,
    ) -> Result<(), AdapterError> {
        let config = self
            .configs
            .get(name)
            .ok_or_else(|| AdapterError::AdapterNotFound(name.to_string()))?;
        let params = self.named_parameters(name)?;
        self.loader
            .save(dir, name, config, &params, &self.dims, &self.model_type, base_model_prefix)?;
        Ok(())
    }

    /// Load an adapter saved by [`AdapterManager::save`].
    ///
    /// Works across hosts with different base-model prefixes. Returns the
    /// name it was attached under. An adapter attached by this call is
    /// detached again if copying its weights fails.
    pub fn load(
        &mut self,
        dir: impl AsRef<Path>,
        options: &LoadOptions,
        loading_info: Option<&mut LoadingInfo>,
    ) -> Result<String, AdapterError> {
        let dir = dir.as_ref();
        let manifest = self.loader.read_manifest(dir)?;
        manifest.check_host(&self.dims)?;
        let name = options
            .load_as
            .clone()
            .unwrap_or_else(|| manifest.name.clone());

        let attached_here = match self.configs.get(&name) {
            Some(existing) if *existing == manifest.config => false,
            Some(_) => return Err(AdapterError::NameConflict(name)),
            None => {
                self.add(&name, manifest.config.clone())?;
                true
            }
        };

        let params = self.named_parameters(&name)?;
        let result = self.loader.load_weights(dir, &manifest, &name, &params);
        let info = match result {
            Ok(info) => info,
            Err(e) => {
                if attached_here {
                    self.delete(&name);
                }
                return Err(e.into());
            }
        };

        if options.set_active {
            self.set_active(Some(ActiveAdapters::from(name.as_str())))?;
        }
        info!(
            adapter = %name,
            path = %dir.display(),
            missing = info.missing_keys.len(),
            unexpected = info.unexpected_keys.len(),
            "Loaded adapter"
        );
        if let Some(out) = loading_info {
            out.extend(info);
        }
        Ok(name)
    }
}

fn validate_name(name: &str) -> Result<(), AdapterError> {
    if name.is_empty() || name.contains('.') {
        return Err(AdapterError::InvalidName(name.to_string()));
    }
    Ok(())
}

pub(crate) fn lock_vars(params: &VarMap) -> candle_core::Result<MutexGuard<'_, HashMap<String, Var>>> {
    params
        .data()
        .lock()
        .map_err(|_| candle_core::Error::Msg("adapter parameter store is poisoned".to_string()))
}
