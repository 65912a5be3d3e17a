//! ContainerStorageModule CRD
//!
//! The single declarative input of the operator: one CSI driver plus an
//! ordered list of optional feature modules.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Volume;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// =============================================================================
// ContainerStorageModule CRD
// =============================================================================

/// ContainerStorageModule describes a storage driver deployment and the
/// feature modules composed around it.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "storage.dell.com",
    version = "v1",
    kind = "ContainerStorageModule",
    plural = "containerstoragemodules",
    shortname = "csm",
    status = "ContainerStorageModuleStatus",
    printcolumn = r#"{"name": "Driver", "type": "string", "jsonPath": ".spec.driver.csiDriverType"}"#,
    printcolumn = r#"{"name": "ConfigVersion", "type": "string", "jsonPath": ".spec.driver.configVersion"}"#,
    printcolumn = r#"{"name": "State", "type": "string", "jsonPath": ".status.state"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStorageModuleSpec {
    /// The CSI driver this resource deploys
    pub driver: Driver,

    /// Feature modules, processed in list order
    #[serde(default)]
    pub modules: Vec<Module>,
}

// =============================================================================
// Driver
// =============================================================================

/// Storage driver family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum DriverType {
    PowerScale,
    Isilon,
    PowerFlex,
    VxflexOs,
    PowerMax,
    PowerStore,
    Unity,
}

impl DriverType {
    /// Every accepted driver alias
    pub const ALL: [DriverType; 7] = [
        DriverType::PowerScale,
        DriverType::Isilon,
        DriverType::PowerFlex,
        DriverType::VxflexOs,
        DriverType::PowerMax,
        DriverType::PowerStore,
        DriverType::Unity,
    ];

    /// Lower-case alias as written in the custom resource
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverType::PowerScale => "powerscale",
            DriverType::Isilon => "isilon",
            DriverType::PowerFlex => "powerflex",
            DriverType::VxflexOs => "vxflexos",
            DriverType::PowerMax => "powermax",
            DriverType::PowerStore => "powerstore",
            DriverType::Unity => "unity",
        }
    }

    /// Collapse legacy aliases onto the product name
    pub fn canonical(&self) -> DriverType {
        match self {
            DriverType::Isilon => DriverType::PowerScale,
            DriverType::VxflexOs => DriverType::PowerFlex,
            other => *other,
        }
    }
}

impl std::fmt::Display for DriverType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Driver section of the custom resource
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Driver {
    /// Driver type (powerscale, powerflex, powermax, ...)
    pub csi_driver_type: DriverType,

    /// Driver config version, e.g. "v2.13.0"
    #[serde(default)]
    pub config_version: String,

    /// Controller replica count
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Settings shared by controller and node
    #[serde(default)]
    pub common: ContainerTemplate,

    /// Controller-only overrides
    #[serde(default)]
    pub controller: Option<ContainerTemplate>,

    /// Node-only overrides
    #[serde(default)]
    pub node: Option<ContainerTemplate>,
}

/// Container-level settings for the driver
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContainerTemplate {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub image: Option<String>,

    #[serde(default)]
    pub image_pull_policy: Option<String>,

    #[serde(default)]
    pub envs: Vec<EnvVar>,

    #[serde(default)]
    pub args: Vec<String>,
}

/// Name/value environment pair
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct EnvVar {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

impl EnvVar {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

// =============================================================================
// Modules
// =============================================================================

/// Feature module identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
pub enum ModuleType {
    #[serde(rename = "authorization")]
    Authorization,
    #[serde(rename = "replication")]
    Replication,
    #[serde(rename = "resiliency")]
    Resiliency,
    #[serde(rename = "observability")]
    Observability,
    #[serde(rename = "csireverseproxy", alias = "reverse-proxy")]
    ReverseProxy,
    #[serde(rename = "application-mobility", alias = "app-mobility")]
    ApplicationMobility,
}

impl ModuleType {
    pub const ALL: [ModuleType; 6] = [
        ModuleType::Authorization,
        ModuleType::Replication,
        ModuleType::Resiliency,
        ModuleType::Observability,
        ModuleType::ReverseProxy,
        ModuleType::ApplicationMobility,
    ];

    /// Name used in the custom resource and in the template store
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleType::Authorization => "authorization",
            ModuleType::Replication => "replication",
            ModuleType::Resiliency => "resiliency",
            ModuleType::Observability => "observability",
            ModuleType::ReverseProxy => "csireverseproxy",
            ModuleType::ApplicationMobility => "application-mobility",
        }
    }
}

impl std::fmt::Display for ModuleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One feature module entry
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Module {
    pub name: ModuleType,

    #[serde(default)]
    pub enabled: bool,

    /// Requested module config version; empty selects the driver default
    #[serde(default)]
    pub config_version: String,

    #[serde(default)]
    pub components: Vec<Component>,
}

impl Module {
    /// Empty module carrying only its identity, used when the module is
    /// not listed in the custom resource
    pub fn synthetic(name: ModuleType) -> Self {
        Self {
            name,
            enabled: true,
            config_version: String::new(),
            components: Vec::new(),
        }
    }

    /// First component with the given name
    pub fn component(&self, name: &str) -> Option<&Component> {
        self.components.iter().find(|c| c.name == name)
    }

    /// Whether the named component is enabled; an unlisted component
    /// counts as disabled
    pub fn component_enabled(&self, name: &str) -> bool {
        self.component(name).map(Component::is_enabled).unwrap_or(false)
    }
}

/// Configurable sub-unit of a module (one container or service)
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Component {
    pub name: String,

    /// Unset means enabled
    #[serde(default)]
    pub enabled: Option<bool>,

    #[serde(default)]
    pub image: Option<String>,

    #[serde(default)]
    pub envs: Vec<EnvVar>,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    #[schemars(with = "Vec<serde_json::Value>")]
    pub volumes: Vec<Volume>,
}

impl Component {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    /// Value of the first env var with this name
    pub fn env(&self, name: &str) -> Option<&str> {
        self.envs
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.value.as_str())
    }

    /// Boolean env var; unparsable or absent values are false
    pub fn env_flag(&self, name: &str) -> bool {
        self.env(name)
            .and_then(|v| v.trim().to_lowercase().parse::<bool>().ok())
            .unwrap_or(false)
    }
}

// =============================================================================
// Status
// =============================================================================

/// Overall state of a ContainerStorageModule
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum CsmState {
    #[default]
    Pending,
    Succeeded,
    Failed,
}

impl std::fmt::Display for CsmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CsmState::Pending => write!(f, "Pending"),
            CsmState::Succeeded => write!(f, "Succeeded"),
            CsmState::Failed => write!(f, "Failed"),
        }
    }
}

/// Outcome of one module in the last pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ModuleState {
    Applied,
    Removed,
    Failed,
}

/// Per-module status entry
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ModuleStatus {
    pub name: ModuleType,
    pub state: ModuleState,
    #[serde(default)]
    pub objects: u32,
    #[serde(default)]
    pub message: Option<String>,
}

/// Status of the ContainerStorageModule
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStorageModuleStatus {
    #[serde(default)]
    pub state: CsmState,

    #[serde(default)]
    pub modules: Vec<ModuleStatus>,

    /// Last reconcile time
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_reconcile_time: Option<DateTime<Utc>>,
}

// =============================================================================
// Default Value Functions
// =============================================================================

fn default_replicas() -> i32 {
    2
}

// =============================================================================
// Implementations
// =============================================================================

impl ContainerStorageModule {
    /// Get the name of this resource
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("unknown")
    }

    /// Get the namespace of this resource
    pub fn namespace(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or("default")
    }

    pub fn driver_type(&self) -> DriverType {
        self.spec.driver.csi_driver_type
    }

    /// First module entry with the given name
    pub fn module(&self, name: ModuleType) -> Option<&Module> {
        self.spec.modules.iter().find(|m| m.name == name)
    }

    /// Whether the module is listed and enabled
    pub fn module_enabled(&self, name: ModuleType) -> bool {
        self.module(name).map(|m| m.enabled).unwrap_or(false)
    }

    /// Whether the resource is being deleted
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
apiVersion: storage.dell.com/v1
kind: ContainerStorageModule
metadata:
  name: isilon
  namespace: isilon
spec:
  driver:
    csiDriverType: "isilon"
    configVersion: v2.13.0
    common:
      imagePullPolicy: Always
  modules:
    - name: authorization
      enabled: true
      components:
        - name: karavi-authorization-proxy
          envs:
            - name: PROXY_HOST
              value: authorization-ingress-nginx-controller.authorization.svc.cluster.local
            - name: INSECURE
              value: "true"
    - name: reverse-proxy
      enabled: false
    - name: authorization
      enabled: false
"#;

    #[test]
    fn test_parse_sample() {
        let csm: ContainerStorageModule = serde_yaml::from_str(SAMPLE).unwrap();
        assert_eq!(csm.name(), "isilon");
        assert_eq!(csm.driver_type(), DriverType::Isilon);
        assert_eq!(csm.driver_type().canonical(), DriverType::PowerScale);
        assert_eq!(csm.spec.driver.replicas, 2);
        assert_eq!(csm.spec.modules[1].name, ModuleType::ReverseProxy);
    }

    #[test]
    fn test_first_module_entry_wins() {
        let csm: ContainerStorageModule = serde_yaml::from_str(SAMPLE).unwrap();
        assert!(csm.module_enabled(ModuleType::Authorization));
        assert!(!csm.module_enabled(ModuleType::Replication));
    }

    #[test]
    fn test_component_env_and_flags() {
        let csm: ContainerStorageModule = serde_yaml::from_str(SAMPLE).unwrap();
        let auth = csm.module(ModuleType::Authorization).unwrap();
        let proxy = auth.component("karavi-authorization-proxy").unwrap();
        assert!(proxy.is_enabled());
        assert!(proxy.env_flag("INSECURE"));
        assert!(!proxy.env_flag("PROXY_HOST"));
        assert_eq!(proxy.env("MISSING"), None);
        assert!(!auth.component_enabled("unknown-component"));
    }

    #[test]
    fn test_unknown_driver_rejected() {
        let yaml = SAMPLE.replace("\"isilon\"", "\"netapp\"");
        assert!(serde_yaml::from_str::<ContainerStorageModule>(&yaml).is_err());
    }

    #[test]
    fn test_synthetic_module() {
        let m = Module::synthetic(ModuleType::ReverseProxy);
        assert!(m.enabled);
        assert!(m.config_version.is_empty());
        assert_eq!(m.name.as_str(), "csireverseproxy");
    }
}
