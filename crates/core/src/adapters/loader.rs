//! Adapter persistence: safetensors weights plus a JSON manifest.
//!
//! A saved adapter directory contains:
//! - `adapter_model.safetensors`: adapter parameters (invertible module
//!   included), named as in the saving host
//! - `adapter_config.json`: manifest with the adapter config and host shape
//! - optionally `head_config.json` / `head_model.safetensors`

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use candle_core::{DType, Device, Tensor, Var};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::config::AdapterConfig;
use super::injection::{rename_adapter_segment, HostDims, PARAMETER_ROOTS};

pub const WEIGHTS_NAME: &str = "adapter_model.safetensors";
pub const CONFIG_NAME: &str = "adapter_config.json";
pub const HEAD_CONFIG_NAME: &str = "head_config.json";
pub const HEAD_WEIGHTS_NAME: &str = "head_model.safetensors";
pub const MODEL_WEIGHTS_NAME: &str = "model.safetensors";
pub const MODEL_CONFIG_NAME: &str = "config.json";

/// Errors that can occur while saving or loading adapters.
#[derive(Debug, Error)]
pub enum AdapterLoadError {
    #[error("adapter manifest not found at {0}")]
    ManifestNotFound(String),
    #[error("adapter weights not found at {0}")]
    WeightsNotFound(String),
    #[error("failed to parse manifest: {0}")]
    ManifestParse(String),
    #[error("failed to serialize manifest: {0}")]
    ManifestSerialize(String),
    #[error("shape mismatch for {param}: expected {expected:?}, found {actual:?}")]
    ShapeMismatch {
        param: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("adapter was saved for a host with {field} = {saved}, this host has {host}")]
    HostMismatch {
        field: &'static str,
        saved: usize,
        host: usize,
    },
    #[error("adapter {0} has no parameters to save")]
    EmptyArtifact(String),
    #[error("no tensor in {0} matches the adapter's parameters")]
    NoMatchingWeights(String),
    #[error("failed to load weights: {0}")]
    WeightsLoad(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Contents of `adapter_config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterManifest {
    pub name: String,
    pub config: AdapterConfig,
    pub model_type: String,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    /// Prefix the saving host put in front of every tensor name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_model_prefix: Option<String>,
    #[serde(default = "default_version")]
    pub version: String,
}

fn default_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

impl AdapterManifest {
    /// Reject adapters saved for a host of a different shape.
    pub fn check_host(&self, dims: &HostDims) -> Result<(), AdapterLoadError> {
        if self.hidden_size != dims.hidden_size {
            return Err(AdapterLoadError::HostMismatch {
                field: "hidden_size",
                saved: self.hidden_size,
                host: dims.hidden_size,
            });
        }
        if self.num_hidden_layers != dims.num_layers {
            return Err(AdapterLoadError::HostMismatch {
                field: "num_hidden_layers",
                saved: self.num_hidden_layers,
                host: dims.num_layers,
            });
        }
        Ok(())
    }
}

/// Key mismatches of a load, reported rather than raised.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadingInfo {
    /// Adapter parameters that received no tensor.
    pub missing_keys: Vec<String>,
    /// Tensors in the artifact that match no adapter parameter.
    pub unexpected_keys: Vec<String>,
}

impl LoadingInfo {
    pub fn is_clean(&self) -> bool {
        self.missing_keys.is_empty() && self.unexpected_keys.is_empty()
    }

    pub fn extend(&mut self, other: LoadingInfo) {
        self.missing_keys.extend(other.missing_keys);
        self.unexpected_keys.extend(other.unexpected_keys);
    }
}

/// Options for loading a saved adapter.
#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Make the loaded adapter the only persistent active adapter.
    pub set_active: bool,
    /// Attach under this name instead of the saved one.
    pub load_as: Option<String>,
    /// Load a prediction head saved alongside the adapter.
    pub with_head: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            set_active: false,
            load_as: None,
            with_head: true,
        }
    }
}

impl LoadOptions {
    pub fn set_active(mut self, set_active: bool) -> Self {
        self.set_active = set_active;
        self
    }

    pub fn load_as(mut self, name: impl Into<String>) -> Self {
        self.load_as = Some(name.into());
        self
    }

    pub fn with_head(mut self, with_head: bool) -> Self {
        self.with_head = with_head;
        self
    }
}

/// Reads and writes adapter artifacts.
pub struct AdapterLoader {
    device: Device,
    dtype: DType,
}

impl AdapterLoader {
    /// Create a new loader for the specified device and dtype.
    pub fn new(device: Device, dtype: DType) -> Self {
        Self { device, dtype }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Save parameters and manifest.
    ///
    /// Weights are written before the manifest, so an interrupted save
    /// leaves a directory that fails to load.
    #[allow(clippy::too_many_arguments)]
    pub fn save(
        &self,
        dir: impl AsRef<Path>,
        name: &str,
        config: &AdapterConfig,
        params: &BTreeMap<String, Var>,
        dims: &HostDims,
        model_type: &str,
        base_model_prefix: Option<&str>,
    ) -> Result<(), AdapterLoadError> {
        if params.is_empty() {
            return Err(AdapterLoadError::EmptyArtifact(name.to_string()));
        }
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        let tensors: HashMap<String, Tensor> = params
            .iter()
            .map(|(key, var)| (qualify(key, base_model_prefix), var.as_tensor().clone()))
            .collect();
        save_tensors(&tensors, &dir.join(WEIGHTS_NAME))?;

        let manifest = AdapterManifest {
            name: name.to_string(),
            config: config.clone(),
            model_type: model_type.to_string(),
            hidden_size: dims.hidden_size,
            num_hidden_layers: dims.num_layers,
            base_model_prefix: base_model_prefix.map(str::to_string),
            version: default_version(),
        };
        write_json(&dir.join(CONFIG_NAME), &manifest)?;

        info!(
            adapter = name,
            path = %dir.display(),
            tensors = tensors.len(),
            "Saved adapter"
        );
        Ok(())
    }

    pub fn read_manifest(&self, dir: impl AsRef<Path>) -> Result<AdapterManifest, AdapterLoadError> {
        let path = dir.as_ref().join(CONFIG_NAME);
        if !path.exists() {
            return Err(AdapterLoadError::ManifestNotFound(path.display().to_string()));
        }
        read_json(&path)
    }

    /// Copy saved tensors into the parameters of the adapter attached as
    /// `name`.
    ///
    /// Saved names are stripped of the saving host's prefix and have their
    /// adapter segment renamed to `name`. Every shape is checked before any
    /// parameter is written.
    pub fn load_weights(
        &self,
        dir: impl AsRef<Path>,
        manifest: &AdapterManifest,
        name: &str,
        params: &BTreeMap<String, Var>,
    ) -> Result<LoadingInfo, AdapterLoadError> {
        self.load_into(
            &dir.as_ref().join(WEIGHTS_NAME),
            manifest.base_model_prefix.as_deref(),
            &manifest.name,
            name,
            params,
        )
    }

    /// Copy the tensors of one safetensors file into `params`, renaming the
    /// `from` name segment to `to`.
    pub fn load_into(
        &self,
        path: &Path,
        saved_prefix: Option<&str>,
        from: &str,
        to: &str,
        params: &BTreeMap<String, Var>,
    ) -> Result<LoadingInfo, AdapterLoadError> {
        if !path.exists() {
            return Err(AdapterLoadError::WeightsNotFound(path.display().to_string()));
        }
        let tensors = load_tensors(path, &self.device)?;

        let mut info = LoadingInfo::default();
        let mut matched: BTreeMap<&str, (&Var, Tensor)> = BTreeMap::new();
        for (key, tensor) in tensors {
            let target = remap_key(&key, saved_prefix, from, to);
            debug!(saved = %key, target = %target, "Remapped adapter tensor");
            match params.get_key_value(&target) {
                Some((param, var)) => {
                    if var.dims() != tensor.dims() {
                        return Err(AdapterLoadError::ShapeMismatch {
                            param: target,
                            expected: var.dims().to_vec(),
                            actual: tensor.dims().to_vec(),
                        });
                    }
                    matched.insert(param.as_str(), (var, tensor));
                }
                None => info.unexpected_keys.push(target),
            }
        }
        if matched.is_empty() {
            return Err(AdapterLoadError::NoMatchingWeights(path.display().to_string()));
        }

        info.missing_keys = params
            .keys()
            .filter(|key| !matched.contains_key(key.as_str()))
            .cloned()
            .collect();
        info.unexpected_keys.sort();

        for (var, tensor) in matched.values() {
            let tensor = tensor
                .to_dtype(self.dtype)
                .map_err(|e| AdapterLoadError::WeightsLoad(e.to_string()))?;
            var.set(&tensor)
                .map_err(|e| AdapterLoadError::WeightsLoad(e.to_string()))?;
        }

        if !info.is_clean() {
            warn!(
                name = to,
                missing = ?info.missing_keys,
                unexpected = ?info.unexpected_keys,
                "Partial load"
            );
        }
        Ok(info)
    }
}

fn qualify(key: &str, prefix: Option<&str>) -> String {
    match prefix {
        Some(prefix) => format!("{prefix}.{key}"),
        None => key.to_string(),
    }
}

/// Map a saved tensor name onto this host's unprefixed parameter name.
///
/// The saved host's prefix is stripped when known; otherwise a leading
/// segment that is not a parameter root is treated as an unknown prefix.
pub(crate) fn remap_key(key: &str, saved_prefix: Option<&str>, from: &str, to: &str) -> String {
    let unprefixed = saved_prefix
        .and_then(|prefix| key.strip_prefix(prefix))
        .and_then(|rest| rest.strip_prefix('.'))
        .unwrap_or_else(|| match key.split_once('.') {
            Some((root, rest)) if !PARAMETER_ROOTS.contains(&root) => rest,
            _ => key,
        });
    rename_adapter_segment(unprefixed, from, to)
}

pub(crate) fn save_tensors(tensors: &HashMap<String, Tensor>, path: &Path) -> Result<(), AdapterLoadError> {
    candle_core::safetensors::save(tensors, path)
        .map_err(|e| AdapterLoadError::WeightsLoad(format!("writing {}: {e}", path.display())))
}

pub(crate) fn load_tensors(path: &Path, device: &Device) -> Result<HashMap<String, Tensor>, AdapterLoadError> {
    candle_core::safetensors::load(path, device)
        .map_err(|e| AdapterLoadError::WeightsLoad(format!("reading {}: {e}", path.display())))
}

pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), AdapterLoadError> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| AdapterLoadError::ManifestSerialize(e.to_string()))?;
    fs::write(path, json)?;
    Ok(())
}

pub(crate) fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, AdapterLoadError> {
    let content = fs::read_to_string(path)?;
    serde_json::from_str(&content)
        .map_err(|e| AdapterLoadError::ManifestParse(format!("{}: {e}", path.display())))
}
