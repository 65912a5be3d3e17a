//! Feature Modules
//!
//! Each module (authorization, replication, ...) is one variant of the
//! closed `ModuleType` enumeration and implements `ModuleCapability`:
//! precheck, render and inject. `capability()` maps a variant to its
//! implementation with an exhaustive match.

pub mod application_mobility;
pub mod authorization;
pub mod inject;
pub mod observability;
pub mod precheck;
pub mod registry;
pub mod replication;
pub mod resiliency;
pub mod reverse_proxy;
pub mod template;
pub mod version;

use crate::config::OperatorConfig;
use crate::crd::{ContainerStorageModule, DriverType, Module, ModuleType};
use crate::domain::objects::RenderedObject;
use crate::domain::ports::ResourceLookup;
use crate::driver::DriverWorkloads;
use crate::error::Result;
use crate::modules::inject::SidecarPayload;
use crate::modules::registry::SupportedDriver;
use crate::modules::template::{Substitutions, TemplateRenderer};
use crate::modules::version::{VersionResolver, VersionSpec};
use async_trait::async_trait;

// =============================================================================
// Module Context
// =============================================================================

/// Everything a module needs for one pass over one custom resource
#[derive(Clone, Copy)]
pub struct ModuleContext<'a> {
    pub cr: &'a ContainerStorageModule,
    pub module: &'a Module,
    pub config: &'a OperatorConfig,
    pub resolver: &'a VersionResolver,
    pub renderer: &'a TemplateRenderer,
    pub lookup: &'a dyn ResourceLookup,
}

impl<'a> ModuleContext<'a> {
    pub fn driver_type(&self) -> DriverType {
        self.cr.driver_type()
    }

    /// Namespace of the custom resource
    pub fn namespace(&self) -> &'a str {
        self.cr.namespace()
    }

    /// Common substitutions for this module's driver
    pub fn substitutions(&self, outcome: &PrecheckOutcome) -> Substitutions {
        Substitutions::common(self.cr, Some(outcome.driver))
    }
}

// =============================================================================
// Precheck Outcome
// =============================================================================

/// How the PowerMax reverse proxy is deployed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProxyMode {
    /// Container inside the driver controller pod
    #[default]
    Sidecar,
    /// Separate Deployment and Service
    Standalone,
}

/// Result of a passed precheck, threaded into render and inject
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrecheckOutcome {
    pub driver: SupportedDriver,
    pub proxy_mode: ProxyMode,
}

impl PrecheckOutcome {
    pub fn new(driver: SupportedDriver) -> Self {
        Self {
            driver,
            proxy_mode: ProxyMode::default(),
        }
    }
}

// =============================================================================
// Module Output
// =============================================================================

/// What a module renders for one pass
#[derive(Debug, Clone, Default)]
pub struct ModuleOutput {
    /// Objects owned by the module itself, applied or deleted as a set
    pub objects: Vec<RenderedObject>,
    /// Contribution to the driver controller Deployment
    pub controller: Option<SidecarPayload>,
    /// Contribution to the driver node DaemonSet
    pub node: Option<SidecarPayload>,
}

// =============================================================================
// Module Capability
// =============================================================================

#[async_trait]
pub trait ModuleCapability: Send + Sync {
    fn module_type(&self) -> ModuleType;

    /// Gate run before anything is rendered for an enabled module
    async fn precheck(&self, ctx: &ModuleContext<'_>) -> Result<PrecheckOutcome>;

    /// Outcome used when a module is rendered without a precheck, as when
    /// removing a disabled module
    fn assumed_outcome(&self, ctx: &ModuleContext<'_>) -> PrecheckOutcome {
        PrecheckOutcome::new(registry::driver_params(ctx.driver_type()))
    }

    fn render(
        &self,
        ctx: &ModuleContext<'_>,
        spec: &VersionSpec,
        outcome: &PrecheckOutcome,
    ) -> Result<ModuleOutput>;

    /// Merge the module's payloads into the driver workloads
    fn inject(&self, output: &ModuleOutput, workloads: &mut DriverWorkloads) -> Result<()> {
        if let Some(payload) = &output.controller {
            payload.inject_into(&mut workloads.controller)?;
        }
        if let Some(payload) = &output.node {
            payload.inject_into(&mut workloads.node)?;
        }
        Ok(())
    }
}

/// Implementation for a module variant
pub fn capability(module: ModuleType) -> &'static dyn ModuleCapability {
    match module {
        ModuleType::Authorization => &authorization::Authorization,
        ModuleType::Replication => &replication::Replication,
        ModuleType::Resiliency => &resiliency::Resiliency,
        ModuleType::Observability => &observability::Observability,
        ModuleType::ReverseProxy => &reverse_proxy::ReverseProxy,
        ModuleType::ApplicationMobility => &application_mobility::ApplicationMobility,
    }
}
