//! Adapter surface shared by host networks.

use std::collections::HashSet;
use std::path::Path;

use super::context::ActiveAdapters;
use super::config::AdapterConfig;
use super::injection::LayerModules;
use super::invertible::InvertibleAdapter;
use super::loader::{LoadOptions, LoadingInfo, HEAD_CONFIG_NAME};
use super::manager::{AdapterError, AdapterManager};

/// A host network that carries an [`AdapterManager`].
///
/// Implementors provide access to their manager and, if they have
/// prediction heads, the head persistence hooks. Everything else has a
/// default implementation.
pub trait AdapterModel {
    fn adapter_manager(&self) -> &AdapterManager;

    fn adapter_manager_mut(&mut self) -> &mut AdapterManager;

    /// Prefix in front of every parameter name when this host is saved,
    /// e.g. `transformer` for a host wrapped by a head model.
    fn base_model_prefix(&self) -> Option<&str> {
        None
    }

    fn has_head(&self, _name: &str) -> bool {
        false
    }

    /// Write the head named `name` into `dir`.
    fn save_head(&self, _name: &str, _dir: &Path) -> Result<(), AdapterError> {
        Ok(())
    }

    /// Load the head saved in `dir` under `name`. Hosts without heads skip it.
    fn load_head(
        &mut self,
        _dir: &Path,
        _name: &str,
        _loading_info: Option<&mut LoadingInfo>,
    ) -> Result<bool, AdapterError> {
        Ok(false)
    }

    fn add_adapter(&mut self, name: &str, config: AdapterConfig) -> Result<(), AdapterError> {
        self.adapter_manager_mut().add(name, config)
    }

    fn delete_adapter(&mut self, name: &str) {
        self.adapter_manager_mut().delete(name)
    }

    fn get_adapter(&self, name: &str) -> &[LayerModules] {
        self.adapter_manager().get(name)
    }

    fn set_active_adapters(&mut self, adapters: Option<ActiveAdapters>) -> Result<(), AdapterError> {
        self.adapter_manager_mut().set_active(adapters)
    }

    fn active_adapters(&self) -> Option<&ActiveAdapters> {
        self.adapter_manager().active()
    }

    fn eject_prefix_tuning(&mut self, name: &str) -> Result<(), AdapterError> {
        self.adapter_manager_mut().eject_prefix_tuning(name)
    }

    fn invertible_adapters(&self) -> Vec<(&str, &InvertibleAdapter)> {
        self.adapter_manager().invertible_adapters().collect()
    }

    fn get_invertible_adapter(&self) -> Option<&InvertibleAdapter> {
        self.adapter_manager().get_invertible_adapter()
    }

    fn remove_invertible_adapter(&mut self, name: &str) -> bool {
        self.adapter_manager_mut().remove_invertible_adapter(name)
    }

    /// Save one adapter, and its head when `with_head` is set and a head of
    /// that name exists.
    fn save_adapter(&self, dir: &Path, name: &str, with_head: bool) -> Result<(), AdapterError> {
        self.adapter_manager()
            .save(name, dir, self.base_model_prefix())?;
        if with_head && self.has_head(name) {
            self.save_head(name, dir)?;
        }
        Ok(())
    }

    /// Load an adapter and, if requested and present, its head.
    ///
    /// Returns the name the adapter was attached under. If the head fails to
    /// load, an adapter attached by this call is detached again and the
    /// previous active set is restored.
    fn load_adapter(
        &mut self,
        dir: &Path,
        options: LoadOptions,
        loading_info: Option<&mut LoadingInfo>,
    ) -> Result<String, AdapterError> {
        let attached_before: HashSet<String> = self
            .adapter_manager()
            .adapter_names()
            .map(str::to_string)
            .collect();
        let previous_active = self.active_adapters().cloned();

        let mut info = LoadingInfo::default();
        let name = self
            .adapter_manager_mut()
            .load(dir, &options, Some(&mut info))?;
        if options.with_head && dir.join(HEAD_CONFIG_NAME).exists() {
            if let Err(e) = self.load_head(dir, &name, Some(&mut info)) {
                let manager = self.adapter_manager_mut();
                if !attached_before.contains(&name) {
                    manager.delete(&name);
                }
                manager.restore_active(previous_active);
                return Err(e);
            }
        }
        if let Some(out) = loading_info {
            out.extend(info);
        }
        Ok(name)
    }

    /// Save every attached adapter into its own sub-directory of `dir`.
    fn save_all_adapters(&self, dir: &Path, with_head: bool) -> Result<(), AdapterError> {
        let names: Vec<String> = self
            .adapter_manager()
            .adapter_names()
            .map(str::to_string)
            .collect();
        for name in names {
            self.save_adapter(&dir.join(&name), &name, with_head)?;
        }
        Ok(())
    }
}
