//! Plugin package discovery and manifest loading

use crate::{Capabilities, PluginError, PluginResult};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

const MAX_MANIFEST_BYTES: u64 = 64 * 1024;

/// Upper bound for a plugin binary read from disk
pub const MAX_MODULE_BYTES: usize = 64 * 1024 * 1024;

pub const WEBAPP_KEYWORD: &str = "signalk-webapp";

/// The subset of package.json a WASM plugin package is described by
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageJson {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Relative path to the plugin binary
    #[serde(default)]
    pub wasm_manifest: Option<String>,
    #[serde(default)]
    pub wasm_capabilities: Capabilities,
}

/// A package located on disk with its manifest parsed and checked
#[derive(Debug, Clone)]
pub struct PluginPackage {
    pub name: String,
    pub location: PathBuf,
    pub package: PackageJson,
    pub wasm_path: PathBuf,
}

impl PluginPackage {
    pub fn capabilities(&self) -> &Capabilities {
        &self.package.wasm_capabilities
    }

    pub fn is_webapp(&self) -> bool {
        self.package.keywords.iter().any(|k| k == WEBAPP_KEYWORD)
    }

    /// Directory served for a webapp package: `public/` when present
    pub fn webapp_dir(&self) -> PathBuf {
        let public = self.location.join("public");
        if public.is_dir() {
            public
        } else {
            self.location.clone()
        }
    }

    /// Version preference: registration metadata, then package.json, then 0.0.0
    pub fn resolve_version(&self, metadata_version: Option<&str>) -> String {
        metadata_version
            .or(self.package.version.as_deref())
            .unwrap_or("0.0.0")
            .to_string()
    }
}

/// Read and validate `<location>/package.json`
pub fn load_package(package_name: &str, location: &Path) -> PluginResult<PluginPackage> {
    let manifest_path = location.join("package.json");

    let metadata = fs::metadata(&manifest_path).map_err(|e| {
        PluginError::InvalidManifest(format!("{}: {e}", manifest_path.display()))
    })?;
    if metadata.len() > MAX_MANIFEST_BYTES {
        return Err(PluginError::InvalidManifest(
            "package.json too large".to_string(),
        ));
    }

    let data = fs::read_to_string(&manifest_path)?;
    let package: PackageJson = serde_json::from_str(&data)
        .map_err(|e| PluginError::InvalidManifest(format!("Invalid package.json: {e}")))?;

    let wasm_manifest = match package.wasm_manifest.as_deref() {
        Some(rel) if !rel.trim().is_empty() => rel.to_string(),
        _ => {
            return Err(PluginError::InvalidManifest(format!(
                "{package_name} has no wasmManifest entry"
            )));
        }
    };

    let wasm_path = location.join(&wasm_manifest);
    if !wasm_path.starts_with(location) || wasm_manifest.contains("..") {
        return Err(PluginError::InvalidManifest(format!(
            "wasmManifest escapes the package directory: {wasm_manifest}"
        )));
    }

    Ok(PluginPackage {
        name: package_name.to_string(),
        location: location.to_path_buf(),
        package,
        wasm_path,
    })
}

/// Load module bytes with a size cap
pub fn load_wasm_bytes(path: &Path, max_bytes: usize) -> PluginResult<Vec<u8>> {
    let metadata = fs::metadata(path)?;
    if metadata.len() as usize > max_bytes {
        return Err(PluginError::InvalidManifest(format!(
            "WASM module too large: {} bytes (limit {})",
            metadata.len(),
            max_bytes
        )));
    }

    Ok(fs::read(path)?)
}

/// Stable plugin id derived from an npm package name
///
/// `@signalk/hello` becomes `_signalk_hello`.
pub fn derive_plugin_id(package_name: &str) -> String {
    package_name.replace(['@', '/'], "_")
}

/// Directory-safe form of a package name, used for the sandbox root
pub fn sanitize_package_name(package_name: &str) -> String {
    derive_plugin_id(package_name)
}

/// Find every package directory below the given roots.
///
/// A package is a directory with a package.json carrying `wasmManifest`.
/// Scoped packages (`@scope/name`) are looked up one level deeper.
pub fn discover_packages(roots: &[PathBuf]) -> Vec<(String, PathBuf)> {
    let mut found = Vec::new();
    for root in roots {
        let Ok(entries) = fs::read_dir(root) else {
            tracing::warn!(root = %root.display(), "plugin package directory not readable");
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            if !path.is_dir() {
                continue;
            }
            if name.starts_with('@') {
                if let Ok(scoped) = fs::read_dir(&path) {
                    for inner in scoped.flatten() {
                        let inner_path = inner.path();
                        let inner_name = inner.file_name().to_string_lossy().to_string();
                        if is_wasm_package(&inner_path) {
                            found.push((format!("{name}/{inner_name}"), inner_path));
                        }
                    }
                }
            } else if is_wasm_package(&path) {
                found.push((name, path));
            }
        }
    }
    found.sort_by(|a, b| a.0.cmp(&b.0));
    found
}

fn is_wasm_package(dir: &Path) -> bool {
    let Ok(text) = fs::read_to_string(dir.join("package.json")) else {
        return false;
    };
    serde_json::from_str::<PackageJson>(&text)
        .map(|p| p.wasm_manifest.is_some())
        .unwrap_or(false)
}
