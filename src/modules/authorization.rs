//! Authorization module
//!
//! Injects the `karavi-authorization-proxy` sidecar into the driver
//! controller and node pods. The proxy's root certificate volume is left
//! out when the component skips certificate validation.

use crate::crd::{ContainerStorageModule, Module, ModuleType};
use crate::error::Result;
use crate::modules::inject::{overlay_volumes, SidecarPayload};
use crate::modules::precheck::{check_driver_and_version, check_prerequisites, Prerequisite};
use crate::modules::registry::SupportedDriver;
use crate::modules::template::{Substitutions, TemplateRenderer};
use crate::modules::version::VersionSpec;
use crate::modules::{ModuleCapability, ModuleContext, ModuleOutput, PrecheckOutcome};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Volume;
use tracing::info;

pub const PROXY_COMPONENT: &str = "karavi-authorization-proxy";

/// Marks a workload as carrying the authorization sidecar
pub const INJECTED_ANNOTATION: &str = "com.dell.karavi-authorization-proxy";

pub const CONFIG_SECRET: &str = "karavi-authorization-config";
pub const TOKENS_SECRET: &str = "proxy-authz-tokens";
pub const ROOT_CERTIFICATE: &str = "proxy-server-root-certificate";

const CONTAINER_ARTIFACT: &str = "container.yaml";
const VOLUMES_ARTIFACT: &str = "volumes.yaml";

const TOKEN_PROXY_HOST: &str = "<AUTHORIZATION_PROXY_HOST>";
const TOKEN_SKIP_CERTIFICATE_VALIDATION: &str = "<AUTHORIZATION_SKIP_CERTIFICATE_VALIDATION>";

const DEFAULT_PROXY_HOST: &str = "csm-authorization.com";

/// Whether the proxy component disables TLS verification of the proxy server
pub fn skip_certificate_validation(module: &Module) -> bool {
    module
        .component(PROXY_COMPONENT)
        .map(|c| c.env_flag("INSECURE") || c.env_flag("SKIP_CERTIFICATE_VALIDATION"))
        .unwrap_or(false)
}

/// Secrets the proxy sidecar mounts
pub fn required_resources(namespace: &str, module: &Module) -> Vec<Prerequisite> {
    let mut required = vec![
        Prerequisite::secret(namespace, CONFIG_SECRET),
        Prerequisite::secret(namespace, TOKENS_SECRET),
    ];
    if !skip_certificate_validation(module) {
        required.push(Prerequisite::secret(namespace, ROOT_CERTIFICATE));
    }
    required
}

/// Render the proxy sidecar, its volumes and the injection annotation.
///
/// Also used by other modules that place the proxy in front of their own
/// Deployments.
pub fn sidecar_payload(
    renderer: &TemplateRenderer,
    cr: &ContainerStorageModule,
    module: &Module,
    spec: &VersionSpec,
    driver: SupportedDriver,
) -> Result<SidecarPayload> {
    let proxy = module.component(PROXY_COMPONENT);
    let skip_validation = skip_certificate_validation(module);

    // The token must agree with the volume set below
    let mut subs = Substitutions::common(cr, Some(driver));
    subs.from_env(proxy, TOKEN_PROXY_HOST, "PROXY_HOST", DEFAULT_PROXY_HOST)
        .set(TOKEN_SKIP_CERTIFICATE_VALIDATION, skip_validation.to_string());

    let container = renderer.render_container(spec, CONTAINER_ARTIFACT, &subs, PROXY_COMPONENT)?;
    let mut volumes: Vec<Volume> = renderer.render_as(spec, VOLUMES_ARTIFACT, &subs)?;
    if let Some(proxy) = proxy {
        overlay_volumes(&mut volumes, &proxy.volumes);
    }

    let omit_volumes = if skip_validation {
        vec![ROOT_CERTIFICATE.to_string()]
    } else {
        Vec::new()
    };

    Ok(SidecarPayload {
        container: Some(container),
        volumes,
        driver_env: Vec::new(),
        annotations: vec![(INJECTED_ANNOTATION.to_string(), "true".to_string())],
        omit_volumes,
    })
}

pub struct Authorization;

#[async_trait]
impl ModuleCapability for Authorization {
    fn module_type(&self) -> ModuleType {
        ModuleType::Authorization
    }

    async fn precheck(&self, ctx: &ModuleContext<'_>) -> Result<PrecheckOutcome> {
        let driver = check_driver_and_version(
            ctx.resolver,
            ModuleType::Authorization,
            ctx.driver_type(),
            &ctx.module.config_version,
        )?;
        check_prerequisites(ctx.lookup, &required_resources(ctx.namespace(), ctx.module)).await?;

        info!("Authorization precheck passed for {}/{}", ctx.namespace(), ctx.cr.name());
        Ok(PrecheckOutcome::new(driver))
    }

    fn render(
        &self,
        ctx: &ModuleContext<'_>,
        spec: &VersionSpec,
        outcome: &PrecheckOutcome,
    ) -> Result<ModuleOutput> {
        let payload = sidecar_payload(ctx.renderer, ctx.cr, ctx.module, spec, outcome.driver)?;
        Ok(ModuleOutput {
            objects: Vec::new(),
            controller: Some(payload.clone()),
            node: Some(payload),
        })
    }
}
