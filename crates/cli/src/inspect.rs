//! Summaries of saved adapter directories.

use std::fmt;
use std::fs;
use std::path::Path;

use adapters_core::adapters::{
    AdapterManifest, CONFIG_NAME, HEAD_CONFIG_NAME, HEAD_WEIGHTS_NAME, WEIGHTS_NAME,
};
use adapters_core::model::HeadManifest;
use safetensors::SafeTensors;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InspectError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid manifest: {0}")]
    Manifest(#[from] serde_json::Error),
    #[error("invalid safetensors file: {0}")]
    Weights(#[from] safetensors::SafeTensorError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TensorEntry {
    pub name: String,
    pub dtype: String,
    pub shape: Vec<usize>,
}

impl TensorEntry {
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

#[derive(Debug, Serialize)]
pub struct AdapterSummary {
    pub manifest: AdapterManifest,
    pub tensors: Vec<TensorEntry>,
    pub num_parameters: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub head: Option<HeadSummary>,
}

#[derive(Debug, Serialize)]
pub struct HeadSummary {
    pub manifest: HeadManifest,
    pub tensors: Vec<TensorEntry>,
}

/// Read the manifest and tensor inventory of a saved adapter.
pub fn summarize(dir: &Path) -> Result<AdapterSummary, InspectError> {
    let manifest: AdapterManifest = read_manifest(&dir.join(CONFIG_NAME))?;
    let tensors = tensor_inventory(&dir.join(WEIGHTS_NAME))?;
    let num_parameters = tensors.iter().map(TensorEntry::numel).sum();

    let head = if dir.join(HEAD_CONFIG_NAME).exists() {
        Some(HeadSummary {
            manifest: read_manifest(&dir.join(HEAD_CONFIG_NAME))?,
            tensors: tensor_inventory(&dir.join(HEAD_WEIGHTS_NAME))?,
        })
    } else {
        None
    };

    Ok(AdapterSummary {
        manifest,
        tensors,
        num_parameters,
        head,
    })
}

fn read_manifest<T: for<'de> serde::Deserialize<'de>>(path: &Path) -> Result<T, InspectError> {
    if !path.exists() {
        return Err(InspectError::NotFound(path.display().to_string()));
    }
    Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
}

fn tensor_inventory(path: &Path) -> Result<Vec<TensorEntry>, InspectError> {
    if !path.exists() {
        return Err(InspectError::NotFound(path.display().to_string()));
    }
    let bytes = fs::read(path)?;
    let safetensors = SafeTensors::deserialize(&bytes)?;
    let mut entries: Vec<TensorEntry> = safetensors
        .tensors()
        .into_iter()
        .map(|(name, view)| TensorEntry {
            name,
            dtype: format!("{:?}", view.dtype()),
            shape: view.shape().to_vec(),
        })
        .collect();
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

impl fmt::Display for AdapterSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = &self.manifest;
        writeln!(f, "adapter:     {}", m.name)?;
        writeln!(f, "families:    {:?}", m.config.families())?;
        writeln!(
            f,
            "host:        {} (hidden {}, {} layers)",
            m.model_type, m.hidden_size, m.num_hidden_layers
        )?;
        if let Some(prefix) = &m.base_model_prefix {
            writeln!(f, "prefix:      {prefix}")?;
        }
        writeln!(f, "parameters:  {}", self.num_parameters)?;
        writeln!(f, "tensors:")?;
        for t in &self.tensors {
            writeln!(f, "  {:<64} {:<5} {:?}", t.name, t.dtype, t.shape)?;
        }
        if let Some(head) = &self.head {
            writeln!(
                f,
                "head:        {:?}, {} labels",
                head.manifest.config.head_type, head.manifest.config.num_labels
            )?;
            for t in &head.tensors {
                writeln!(f, "  {:<64} {:<5} {:?}", t.name, t.dtype, t.shape)?;
            }
        }
        Ok(())
    }
}
