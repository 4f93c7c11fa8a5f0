//! Adapter composition and lifecycle engine.
//!
//! Adapters are small trainable modules injected into a frozen host network.
//! This module owns their configuration, construction at the host's
//! injection slots, activation (persistent and scoped), composition during
//! the forward pass, and persistence independent of the host's weights.
//!
//! Supported families:
//! - bottleneck adapters, sequential or parallel (pfeiffer, houlsby, parallel)
//! - prefix tuning, with reparameterized or flat prefixes
//! - invertible couplings on the embedding output
//! - unions of the above (mam)

mod bottleneck;
mod config;
mod context;
mod host;
mod injection;
mod invertible;
mod loader;
mod manager;
mod prefix;

pub use bottleneck::BottleneckAdapter;
pub use config::{
    AdapterConfig, AdapterConfigError, BottleneckConfig, InvertibleConfig, InvertibleKind,
    NonLinearity, Placement, PrefixTuningConfig, ReductionFactor,
};
pub use context::{ActiveAdapters, AdapterSetup, ForwardContext};
pub use host::AdapterModel;
pub use injection::{
    bottleneck_path, check_slot, head_path, invertible_path, prefix_path, rename_adapter_segment,
    AdapterFamily, Compose, HookState, HostDims, InjectionSlot, LayerModule, LayerModules,
};
pub use invertible::InvertibleAdapter;
pub use loader::{
    AdapterLoadError, AdapterLoader, AdapterManifest, LoadOptions, LoadingInfo, CONFIG_NAME,
    HEAD_CONFIG_NAME, HEAD_WEIGHTS_NAME, MODEL_CONFIG_NAME, MODEL_WEIGHTS_NAME, WEIGHTS_NAME,
};
pub use manager::{AdapterError, AdapterManager};
pub use prefix::{PrefixGeometry, PrefixShim, PrefixTuning};

pub(crate) use loader::{load_tensors, read_json, save_tensors, write_json};
pub(crate) use manager::lock_vars;
