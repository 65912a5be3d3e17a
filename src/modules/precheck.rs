//! Precheck Validator
//!
//! Shared gate every module runs before synthesis: driver support, version
//! support, then existence of required secrets and config maps.

use crate::crd::{DriverType, ModuleType};
use crate::domain::ports::ResourceLookup;
use crate::error::{Error, Result};
use crate::modules::registry::{self, SupportedDriver};
use crate::modules::version::VersionResolver;
use tracing::{debug, warn};

/// Kind of a required resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrerequisiteKind {
    Secret,
    ConfigMap,
}

impl PrerequisiteKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrerequisiteKind::Secret => "secret",
            PrerequisiteKind::ConfigMap => "configmap",
        }
    }
}

/// A resource that must exist before a module is deployed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prerequisite {
    pub kind: PrerequisiteKind,
    pub name: String,
    pub namespace: String,
}

impl Prerequisite {
    pub fn secret(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: PrerequisiteKind::Secret,
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    pub fn config_map(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: PrerequisiteKind::ConfigMap,
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    fn missing(&self) -> Error {
        Error::MissingPrerequisite {
            kind: self.kind.as_str().to_string(),
            name: self.name.clone(),
            namespace: self.namespace.clone(),
        }
    }
}

/// Registry lookup surfaced as `UnsupportedDriver`
pub fn check_driver(module: ModuleType, driver: DriverType) -> Result<SupportedDriver> {
    registry::supports(module, driver).ok_or_else(|| Error::UnsupportedDriver {
        module: module.to_string(),
        driver: driver.to_string(),
    })
}

/// Driver support plus, when one is requested, version support
pub fn check_driver_and_version(
    resolver: &VersionResolver,
    module: ModuleType,
    driver: DriverType,
    requested_version: &str,
) -> Result<SupportedDriver> {
    let supported = check_driver(module, driver)?;
    if !requested_version.is_empty() {
        resolver.check_version(module, requested_version)?;
    }
    Ok(supported)
}

/// Check each prerequisite in order and fail on the first missing one.
///
/// A lookup that fails for any reason other than absence is returned as is,
/// so the module fails this pass and is retried.
pub async fn check_prerequisites(
    lookup: &dyn ResourceLookup,
    prerequisites: &[Prerequisite],
) -> Result<()> {
    for prerequisite in prerequisites {
        let found = match prerequisite.kind {
            PrerequisiteKind::Secret => {
                lookup
                    .secret_exists(&prerequisite.namespace, &prerequisite.name)
                    .await
            }
            PrerequisiteKind::ConfigMap => {
                lookup
                    .config_map_exists(&prerequisite.namespace, &prerequisite.name)
                    .await
            }
        };

        match found {
            Ok(true) => debug!(
                "Found {} {}/{}",
                prerequisite.kind.as_str(),
                prerequisite.namespace,
                prerequisite.name
            ),
            Ok(false) => return Err(prerequisite.missing()),
            Err(e) if e.is_not_found() => return Err(prerequisite.missing()),
            Err(e) => {
                warn!(
                    "Failed to look up {} {}/{}: {}",
                    prerequisite.kind.as_str(),
                    prerequisite.namespace,
                    prerequisite.name,
                    e
                );
                return Err(e);
            }
        }
    }

    Ok(())
}
