//! Driver workloads
//!
//! Renders the CSI driver controller Deployment and node DaemonSet from
//! `driverconfig/<driver>/<configVersion>/`. Modules inject into these
//! before they are applied.

use crate::config::OperatorConfig;
use crate::crd::{ContainerStorageModule, ContainerTemplate};
use crate::domain::objects::RenderedObject;
use crate::error::{Error, Result};
use crate::modules::inject::{self, PodWorkload, DRIVER_CONTAINER};
use crate::modules::registry;
use crate::modules::template::{parse_as, Substitutions, TemplateRenderer};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use tracing::debug;

pub const CONTROLLER_ARTIFACT: &str = "controller.yaml";
pub const NODE_ARTIFACT: &str = "node.yaml";

const TOKEN_REPLICAS: &str = "<DriverDefaultReplicas>";

/// The two driver workloads modules inject into
#[derive(Debug, Clone, PartialEq)]
pub struct DriverWorkloads {
    pub controller: Deployment,
    pub node: DaemonSet,
}

impl DriverWorkloads {
    /// Controller first, then node
    pub fn into_objects(self) -> Vec<RenderedObject> {
        vec![
            RenderedObject::Deployment(self.controller),
            RenderedObject::DaemonSet(self.node),
        ]
    }
}

/// Render the driver workloads for a custom resource
pub fn render_driver(
    config: &OperatorConfig,
    renderer: &TemplateRenderer,
    cr: &ContainerStorageModule,
) -> Result<DriverWorkloads> {
    let driver = &cr.spec.driver;
    if driver.config_version.is_empty() {
        return Err(Error::Configuration(format!(
            "{} has no driver configVersion",
            cr.name()
        )));
    }

    let dir = config
        .driver_config_root()
        .join(driver.csi_driver_type.canonical().as_str())
        .join(&driver.config_version);
    debug!("Rendering driver from {}", dir.display());

    let mut subs = Substitutions::common(cr, Some(registry::driver_params(driver.csi_driver_type)));
    subs.set(TOKEN_REPLICAS, driver.replicas.to_string());

    let text = renderer.render_file(&dir.join(CONTROLLER_ARTIFACT), &subs)?;
    let mut controller: Deployment = parse_as(&text, "driver", CONTROLLER_ARTIFACT)?;
    let text = renderer.render_file(&dir.join(NODE_ARTIFACT), &subs)?;
    let mut node: DaemonSet = parse_as(&text, "driver", NODE_ARTIFACT)?;

    customize(&mut controller, &driver.common, driver.controller.as_ref())?;
    customize(&mut node, &driver.common, driver.node.as_ref())?;

    Ok(DriverWorkloads { controller, node })
}

/// Apply image and env settings from the custom resource to the driver
/// container. Role-specific settings follow the common ones.
fn customize<W: PodWorkload>(
    workload: &mut W,
    common: &ContainerTemplate,
    role: Option<&ContainerTemplate>,
) -> Result<()> {
    let image = role
        .and_then(|r| r.image.as_deref())
        .or(common.image.as_deref())
        .filter(|image| !image.is_empty());
    if let Some(image) = image {
        inject::set_container_image(inject::require_pod_spec(workload)?, DRIVER_CONTAINER, image);
    }

    let envs: Vec<_> = common
        .envs
        .iter()
        .chain(role.into_iter().flat_map(|r| r.envs.iter()))
        .map(|e| inject::env(&e.name, e.value.clone()))
        .collect();
    if !envs.is_empty() {
        inject::inject_driver_env(workload, &envs)?;
    }

    Ok(())
}
