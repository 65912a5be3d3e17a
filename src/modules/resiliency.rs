//! Resiliency module
//!
//! Adds the `podmon` sidecar to the driver controller and node pods and
//! enables pod monitoring in the driver containers.

use crate::crd::{Module, ModuleType};
use crate::error::Result;
use crate::modules::inject::{self, SidecarPayload};
use crate::modules::precheck::check_driver_and_version;
use crate::modules::template::Substitutions;
use crate::modules::version::VersionSpec;
use crate::modules::{ModuleCapability, ModuleContext, ModuleOutput, PrecheckOutcome};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Container;
use tracing::info;

pub const CONTROLLER_COMPONENT: &str = "podmon-controller";
pub const NODE_COMPONENT: &str = "podmon-node";

const CONTROLLER_ARTIFACT: &str = "podmon-controller.yaml";
const NODE_ARTIFACT: &str = "podmon-node.yaml";

const POLL_RATE_ARG: &str = "--arrayConnectivityPollRate=";
const API_PORT_ARG: &str = "--podmonAPIPort=";

const DEFAULT_POLL_RATE: &str = "60";
const DEFAULT_API_PORT: &str = "8083";

/// Value of the first `prefix<value>` argument, or an empty string
pub fn arg_value(args: &[String], prefix: &str) -> String {
    args.iter()
        .find_map(|arg| arg.strip_prefix(prefix))
        .unwrap_or_default()
        .to_string()
}

fn or_default(value: String, default: &str) -> String {
    if value.is_empty() {
        default.to_string()
    } else {
        value
    }
}

/// A listed component may be switched off; an unlisted one is deployed
fn sidecar_enabled(module: &Module, component: &str) -> bool {
    module.component(component).map(|c| c.is_enabled()).unwrap_or(true)
}

fn render_podmon(
    ctx: &ModuleContext<'_>,
    spec: &VersionSpec,
    subs: &Substitutions,
    artifact: &str,
    component: &str,
) -> Result<Container> {
    let mut container = ctx.renderer.render_container(spec, artifact, subs, component)?;
    if let Some(c) = ctx.module.component(component) {
        if !c.args.is_empty() {
            container.args = Some(c.args.clone());
        }
    }
    Ok(container)
}

pub struct Resiliency;

#[async_trait]
impl ModuleCapability for Resiliency {
    fn module_type(&self) -> ModuleType {
        ModuleType::Resiliency
    }

    async fn precheck(&self, ctx: &ModuleContext<'_>) -> Result<PrecheckOutcome> {
        let driver = check_driver_and_version(
            ctx.resolver,
            ModuleType::Resiliency,
            ctx.driver_type(),
            &ctx.module.config_version,
        )?;
        info!("Resiliency precheck passed for {}/{}", ctx.namespace(), ctx.cr.name());
        Ok(PrecheckOutcome::new(driver))
    }

    fn render(
        &self,
        ctx: &ModuleContext<'_>,
        spec: &VersionSpec,
        outcome: &PrecheckOutcome,
    ) -> Result<ModuleOutput> {
        let subs = ctx.substitutions(outcome);
        let mut output = ModuleOutput::default();

        if sidecar_enabled(ctx.module, CONTROLLER_COMPONENT) {
            let container = render_podmon(ctx, spec, &subs, CONTROLLER_ARTIFACT, CONTROLLER_COMPONENT)?;
            output.controller = Some(SidecarPayload {
                container: Some(container),
                driver_env: vec![inject::env("X_CSI_PODMON_ENABLED", "true")],
                ..Default::default()
            });
        }

        if sidecar_enabled(ctx.module, NODE_COMPONENT) {
            let container = render_podmon(ctx, spec, &subs, NODE_ARTIFACT, NODE_COMPONENT)?;
            let args = container.args.clone().unwrap_or_default();
            let poll_rate = or_default(arg_value(&args, POLL_RATE_ARG), DEFAULT_POLL_RATE);
            let api_port = or_default(arg_value(&args, API_PORT_ARG), DEFAULT_API_PORT);

            output.node = Some(SidecarPayload {
                container: Some(container),
                driver_env: vec![
                    inject::env("X_CSI_PODMON_ENABLED", "true"),
                    inject::env("X_CSI_PODMON_API_PORT", api_port),
                    inject::env("X_CSI_PODMON_ARRAY_CONNECTIVITY_POLL_RATE", poll_rate),
                ],
                ..Default::default()
            });
        }

        Ok(output)
    }
}
