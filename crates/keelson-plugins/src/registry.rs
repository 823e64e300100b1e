//! Package registration
//!
//! Enabled packages are loaded straight into their permanent sandbox and
//! started. Disabled packages are loaded once into a scratch sandbox to read
//! their name and schema, then dropped; only the record and the basic
//! config routes remain so the plugin can be enabled later.
//!
//! [`RegisterMode::Inspect`] treats every package like a disabled one, so
//! listing installed plugins never runs their start code.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::host::{PluginHost, WasmPlugin, WebappMount, lock};
use crate::manifest::{derive_plugin_id, discover_packages, load_package};
use crate::runtime::{LoadSpec, PluginIdentity, PluginInstance};
use crate::{Capabilities, PluginError, PluginResult};

/// What registration does with an enabled package
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegisterMode {
    /// Load into the permanent sandbox and start
    #[default]
    Activate,
    /// Read name and schema only; nothing is started
    Inspect,
}

impl PluginHost {
    async fn load_module(&self, spec: LoadSpec) -> PluginResult<Arc<PluginInstance>> {
        let host = self.clone();
        let bridge = self.bridge_for(&spec.plugin_id, spec.capabilities.clone());
        tokio::task::spawn_blocking(move || host.inner.runtime.load(spec, bridge))
            .await
            .map_err(|e| PluginError::Wasm(format!("load task failed: {e}")))?
    }

    /// Load into a scratch sandbox, keep only the identity
    async fn scratch_identity(
        &self,
        plugin_id: &str,
        wasm_path: &Path,
        capabilities: &Capabilities,
    ) -> PluginResult<PluginIdentity> {
        let storage = &self.inner.services.storage;
        let spec = LoadSpec {
            plugin_id: plugin_id.to_string(),
            wasm_path: wasm_path.to_path_buf(),
            vfs_root: storage.temp_vfs_root(plugin_id),
            capabilities: capabilities.clone(),
        };
        let loaded = self.load_module(spec).await;
        let identity = loaded.map(|instance| instance.identity().clone());
        if identity.is_ok() {
            if let Err(e) = self.inner.runtime.unload(plugin_id) {
                warn!(plugin_id, error = %e, "failed to drop temporary instance");
            }
        }
        storage.remove_temp_vfs(plugin_id);
        identity
    }

    /// Register one installed package; returns the derived plugin id.
    ///
    /// A start failure of an enabled plugin is recorded on the plugin and
    /// does not fail registration. Registering an id that is already known
    /// leaves the existing record alone and returns its id.
    pub async fn register(
        &self,
        package_name: &str,
        metadata_version: Option<&str>,
        location: &Path,
    ) -> PluginResult<String> {
        self.register_with(package_name, metadata_version, location, RegisterMode::Activate)
            .await
    }

    pub async fn register_with(
        &self,
        package_name: &str,
        metadata_version: Option<&str>,
        location: &Path,
        mode: RegisterMode,
    ) -> PluginResult<String> {
        let plugin_id = derive_plugin_id(package_name);
        let services = self.inner.services.clone();
        if services.plugins.contains(&plugin_id) {
            debug!(plugin_id, "package already registered");
            return Ok(plugin_id);
        }
        let package = load_package(package_name, location)?;

        if package.is_webapp() {
            let mount = WebappMount {
                package_name: package_name.to_string(),
                dir: package.webapp_dir(),
            };
            debug!(plugin_id, path = %mount.url_path(), "registered webapp assets");
            lock(&self.inner.webapps).push(mount);
        }

        let config = services.storage.read_config(&plugin_id)?;
        let paths = services.storage.paths(&plugin_id, package_name);
        let capabilities = package.capabilities().clone();

        let mut plugin = WasmPlugin::new(
            plugin_id.clone(),
            package_name.to_string(),
            location.to_path_buf(),
            package.wasm_path.clone(),
            paths.vfs_root.clone(),
            capabilities.clone(),
        );
        plugin.version = package.resolve_version(metadata_version);
        plugin.config = config.clone();

        if !config.enabled || mode == RegisterMode::Inspect {
            let identity = self
                .scratch_identity(&plugin_id, &package.wasm_path, &capabilities)
                .await?;
            if !identity.name.is_empty() {
                plugin.name = identity.name;
            }
            plugin.schema = identity.schema;
            services.plugins.insert(plugin);
            self.install_routes(&plugin_id);
            info!(plugin_id, enabled = config.enabled, "registered plugin without starting it");
            return Ok(plugin_id);
        }

        services.storage.init_vfs(&paths)?;
        let instance = self
            .load_module(LoadSpec {
                plugin_id: plugin_id.clone(),
                wasm_path: package.wasm_path.clone(),
                vfs_root: paths.vfs_root.clone(),
                capabilities,
            })
            .await?;
        if !instance.identity().name.is_empty() {
            plugin.name = instance.identity().name.clone();
        }
        plugin.schema = instance.identity().schema.clone();
        plugin.instance = Some(instance);
        services.plugins.insert(plugin);
        self.install_routes(&plugin_id);
        info!(plugin_id, "registered plugin");

        if let Err(e) = self.start(&plugin_id).await {
            warn!(plugin_id, error = %e, "plugin failed to start after registration");
        }
        Ok(plugin_id)
    }

    /// Register every package found below the given directories
    pub async fn register_all(&self, package_dirs: &[PathBuf]) -> Vec<String> {
        self.register_all_with(package_dirs, RegisterMode::Activate).await
    }

    pub async fn register_all_with(&self, package_dirs: &[PathBuf], mode: RegisterMode) -> Vec<String> {
        let mut registered = Vec::new();
        for (package_name, location) in discover_packages(package_dirs) {
            match self.register_with(&package_name, None, &location, mode).await {
                Ok(plugin_id) => registered.push(plugin_id),
                Err(e) => warn!(package = %package_name, error = %e, "failed to register plugin package"),
            }
        }
        info!(count = registered.len(), "registered plugin packages");
        registered
    }

    /// Load the module of a registered plugin that has no instance yet
    pub(crate) async fn load_instance(&self, plugin_id: &str) -> PluginResult<()> {
        let record = self.record(plugin_id)?;
        let (package_name, wasm_path, capabilities) = {
            let plugin = lock(&record);
            if plugin.instance.is_some() {
                return Ok(());
            }
            (
                plugin.package_name.clone(),
                plugin.wasm_path.clone(),
                plugin.capabilities.clone(),
            )
        };

        let storage = &self.inner.services.storage;
        let paths = storage.paths(plugin_id, &package_name);
        storage.init_vfs(&paths)?;
        let instance = self
            .load_module(LoadSpec {
                plugin_id: plugin_id.to_string(),
                wasm_path,
                vfs_root: paths.vfs_root.clone(),
                capabilities,
            })
            .await?;

        {
            let mut plugin = lock(&record);
            if !instance.identity().name.is_empty() {
                plugin.name = instance.identity().name.clone();
            }
            plugin.schema = instance.identity().schema.clone();
            plugin.vfs_root = paths.vfs_root;
            plugin.instance = Some(instance);
        }
        self.install_routes(plugin_id);
        Ok(())
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod registry_tests;
