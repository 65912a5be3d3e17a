//! Version Resolver
//!
//! Determines which versioned template set applies to a module. The
//! subdirectory names under `moduleconfig/<module>/` are the authoritative
//! list of supported versions. When the custom resource does not request a
//! version, a default is looked up in `moduleconfig/common/version-values.yaml`
//! keyed by driver type and driver config version.

use crate::config::OperatorConfig;
use crate::crd::{Driver, DriverType, Module, ModuleType};
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Directory holding files shared by all modules
pub const COMMON_DIR: &str = "common";

/// Default module version table
pub const VERSION_VALUES_FILE: &str = "version-values.yaml";

/// driver type -> driver config version -> module -> module version
type VersionValues = BTreeMap<String, BTreeMap<String, BTreeMap<String, String>>>;

// =============================================================================
// Version Spec
// =============================================================================

/// Resolved module version plus per-component image overrides
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionSpec {
    pub module: ModuleType,
    pub version: String,
    /// component name -> image
    pub image_overrides: BTreeMap<String, String>,
}

impl VersionSpec {
    pub fn new(module: ModuleType, version: impl Into<String>) -> Self {
        Self {
            module,
            version: version.into(),
            image_overrides: BTreeMap::new(),
        }
    }

    /// Image override for a component, if the custom resource set one
    pub fn image_for(&self, component: &str) -> Option<&str> {
        self.image_overrides.get(component).map(String::as_str)
    }
}

// =============================================================================
// Version Resolver
// =============================================================================

/// Resolves module versions against the template store
#[derive(Debug, Clone)]
pub struct VersionResolver {
    module_root: PathBuf,
}

impl VersionResolver {
    pub fn new(config: &OperatorConfig) -> Self {
        Self {
            module_root: config.module_config_root(),
        }
    }

    /// Resolver over an explicit `moduleconfig` directory
    pub fn with_module_root(module_root: impl Into<PathBuf>) -> Self {
        Self {
            module_root: module_root.into(),
        }
    }

    pub fn module_dir(&self, module: ModuleType) -> PathBuf {
        self.module_root.join(module.as_str())
    }

    /// Versions shipped for a module, sorted by name
    pub fn supported_versions(&self, module: ModuleType) -> Result<Vec<String>> {
        let dir = self.module_dir(module);
        let entries = std::fs::read_dir(&dir).map_err(|source| Error::TemplateDirectory {
            path: dir.clone(),
            source,
        })?;

        let mut versions = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| Error::TemplateDirectory {
                path: dir.clone(),
                source,
            })?;
            let is_dir = entry
                .file_type()
                .map(|t| t.is_dir())
                .map_err(|source| Error::TemplateDirectory {
                    path: entry.path(),
                    source,
                })?;
            if is_dir {
                versions.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        versions.sort();

        Ok(versions)
    }

    /// Fail with `UnsupportedVersion` unless `requested` is shipped
    pub fn check_version(&self, module: ModuleType, requested: &str) -> Result<()> {
        let supported = self.supported_versions(module)?;
        if supported.iter().any(|v| v == requested) {
            return Ok(());
        }

        Err(Error::UnsupportedVersion {
            module: module.to_string(),
            requested: requested.to_string(),
            supported,
        })
    }

    /// Default module version for a driver config version
    pub fn default_version(
        &self,
        module: ModuleType,
        driver_type: DriverType,
        driver_config_version: &str,
    ) -> Result<String> {
        let path = self.module_root.join(COMMON_DIR).join(VERSION_VALUES_FILE);
        let values = load_version_values(&path)?;

        // The table may be keyed by either alias of the driver
        [driver_type, driver_type.canonical()]
            .iter()
            .filter_map(|driver| values.get(driver.as_str()))
            .filter_map(|versions| versions.get(driver_config_version))
            .find_map(|modules| modules.get(module.as_str()).cloned())
            .ok_or_else(|| Error::DefaultVersionNotFound {
                module: module.to_string(),
                driver: driver_type.to_string(),
                driver_version: driver_config_version.to_string(),
            })
    }

    /// Effective version: the requested one if shipped, else the driver
    /// default
    pub fn resolve_version(
        &self,
        module: ModuleType,
        requested: &str,
        driver_config_version: &str,
        driver_type: DriverType,
    ) -> Result<String> {
        if !requested.is_empty() {
            self.check_version(module, requested)?;
            debug!("Using requested {} version {}", module, requested);
            return Ok(requested.to_string());
        }

        let version = self.default_version(module, driver_type, driver_config_version)?;
        debug!(
            "Using default {} version {} for {} {}",
            module, version, driver_type, driver_config_version
        );
        Ok(version)
    }

    /// Resolve a module entry of the custom resource into a VersionSpec
    pub fn resolve(&self, module: &Module, driver: &Driver) -> Result<VersionSpec> {
        let version = self.resolve_version(
            module.name,
            &module.config_version,
            &driver.config_version,
            driver.csi_driver_type,
        )?;

        let image_overrides = module
            .components
            .iter()
            .filter_map(|c| {
                c.image
                    .as_ref()
                    .filter(|image| !image.is_empty())
                    .map(|image| (c.name.clone(), image.clone()))
            })
            .collect();

        Ok(VersionSpec {
            module: module.name,
            version,
            image_overrides,
        })
    }
}

fn load_version_values(path: &Path) -> Result<VersionValues> {
    let text = std::fs::read_to_string(path).map_err(|source| Error::TemplateRead {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(serde_yaml::from_str(&text)?)
}
