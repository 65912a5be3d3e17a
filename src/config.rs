//! Operator configuration
//!
//! Settings shared by every reconciliation pass. Populated from CLI flags
//! and environment in `main.rs`.

use std::path::{Path, PathBuf};

/// Default root of the shipped template store
pub const DEFAULT_CONFIG_DIRECTORY: &str = "/etc/config/dell-csm-operator";

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "csm-module-operator";

/// Configuration for the module engine
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Root of the template store (`moduleconfig/`, `driverconfig/`)
    pub config_directory: PathBuf,
    /// Server-side apply field manager
    pub field_manager: String,
    /// Namespace observability components are deployed into
    pub observability_namespace: String,
    /// Namespace of the replication controller and its cluster secrets
    pub replication_namespace: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            config_directory: PathBuf::from(DEFAULT_CONFIG_DIRECTORY),
            field_manager: FIELD_MANAGER.to_string(),
            observability_namespace: "karavi".to_string(),
            replication_namespace: "dell-replication-controller".to_string(),
        }
    }
}

impl OperatorConfig {
    /// Config rooted at the given directory, other settings default
    pub fn with_config_directory(path: impl Into<PathBuf>) -> Self {
        Self {
            config_directory: path.into(),
            ..Default::default()
        }
    }

    /// `<root>/moduleconfig`
    pub fn module_config_root(&self) -> PathBuf {
        self.config_directory.join("moduleconfig")
    }

    /// `<root>/driverconfig`
    pub fn driver_config_root(&self) -> PathBuf {
        self.config_directory.join("driverconfig")
    }

    pub fn config_directory(&self) -> &Path {
        &self.config_directory
    }
}
