//! PowerMax reverse proxy module
//!
//! Runs either as a sidecar of the driver controller or as its own
//! Deployment and Service. The mode is decided during precheck and carried
//! in `PrecheckOutcome::proxy_mode` to render and inject.

use crate::crd::{Module, ModuleType};
use crate::error::Result;
use crate::modules::inject::{self, SidecarPayload};
use crate::modules::precheck::{check_driver_and_version, check_prerequisites, Prerequisite};
use crate::modules::registry;
use crate::modules::template::apply_image_override;
use crate::modules::version::VersionSpec;
use crate::modules::{ModuleCapability, ModuleContext, ModuleOutput, PrecheckOutcome, ProxyMode};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, EmptyDirVolumeSource, SecretVolumeSource, Volume,
};
use tracing::info;

pub const PROXY_COMPONENT: &str = "csipowermax-reverseproxy";

/// Service the driver reaches the standalone proxy through
pub const SERVICE_NAME: &str = "csipowermax-reverseproxy";

const CONTAINER_ARTIFACT: &str = "container.yaml";
const CONTROLLER_ARTIFACT: &str = "controller.yaml";

const TOKEN_TLS_SECRET: &str = "<X_CSI_REVPROXY_TLS_SECRET>";
const TOKEN_PORT: &str = "<X_CSI_REVPROXY_PORT>";
const TOKEN_CONFIG_MAP: &str = "<X_CSI_CONFIG_MAP_NAME>";

const DEFAULT_TLS_SECRET: &str = "csirevproxy-tls-secret";
const DEFAULT_PORT: &str = "2222";
const DEFAULT_CONFIG_MAP: &str = "powermax-reverseproxy-config";

/// Proxy settings read from the component env
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySettings {
    pub tls_secret: String,
    pub config_map: String,
    pub port: String,
}

impl ProxySettings {
    pub fn from_module(module: &Module) -> Self {
        let proxy = module.component(PROXY_COMPONENT);
        let get = |name: &str, default: &str| {
            proxy
                .and_then(|c| c.env(name))
                .unwrap_or(default)
                .to_string()
        };
        Self {
            tls_secret: get("X_CSI_REVPROXY_TLS_SECRET", DEFAULT_TLS_SECRET),
            config_map: get("X_CSI_CONFIG_MAP_NAME", DEFAULT_CONFIG_MAP),
            port: get("X_CSI_REVPROXY_PORT", DEFAULT_PORT),
        }
    }
}

/// Sidecar unless the component explicitly sets `DeployAsSidecar=false`
pub fn proxy_mode(module: &Module) -> ProxyMode {
    let standalone = module
        .component(PROXY_COMPONENT)
        .and_then(|c| c.env("DeployAsSidecar"))
        .map(|v| v.trim().eq_ignore_ascii_case("false"))
        .unwrap_or(false);

    if standalone {
        ProxyMode::Standalone
    } else {
        ProxyMode::Sidecar
    }
}

fn sidecar_volumes(settings: &ProxySettings) -> Vec<Volume> {
    vec![
        Volume {
            name: "configmap-volume".to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: Some(settings.config_map.clone()),
                optional: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        },
        Volume {
            name: "tls-secret".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(settings.tls_secret.clone()),
                ..Default::default()
            }),
            ..Default::default()
        },
        Volume {
            name: "cert-dir".to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
    ]
}

pub struct ReverseProxy;

#[async_trait]
impl ModuleCapability for ReverseProxy {
    fn module_type(&self) -> ModuleType {
        ModuleType::ReverseProxy
    }

    async fn precheck(&self, ctx: &ModuleContext<'_>) -> Result<PrecheckOutcome> {
        let driver = check_driver_and_version(
            ctx.resolver,
            ModuleType::ReverseProxy,
            ctx.driver_type(),
            &ctx.module.config_version,
        )?;

        let settings = ProxySettings::from_module(ctx.module);
        let required = vec![
            Prerequisite::secret(ctx.namespace(), settings.tls_secret),
            Prerequisite::config_map(ctx.namespace(), settings.config_map),
        ];
        check_prerequisites(ctx.lookup, &required).await?;

        let proxy_mode = proxy_mode(ctx.module);
        info!(
            "Reverse proxy precheck passed for {}/{} ({:?})",
            ctx.namespace(),
            ctx.cr.name(),
            proxy_mode
        );
        Ok(PrecheckOutcome { driver, proxy_mode })
    }

    fn assumed_outcome(&self, ctx: &ModuleContext<'_>) -> PrecheckOutcome {
        PrecheckOutcome {
            driver: registry::driver_params(ctx.driver_type()),
            proxy_mode: proxy_mode(ctx.module),
        }
    }

    fn render(
        &self,
        ctx: &ModuleContext<'_>,
        spec: &VersionSpec,
        outcome: &PrecheckOutcome,
    ) -> Result<ModuleOutput> {
        let settings = ProxySettings::from_module(ctx.module);
        let mut subs = ctx.substitutions(outcome);
        subs.set(TOKEN_TLS_SECRET, settings.tls_secret.as_str())
            .set(TOKEN_PORT, settings.port.as_str())
            .set(TOKEN_CONFIG_MAP, settings.config_map.as_str());

        match outcome.proxy_mode {
            ProxyMode::Sidecar => {
                let container =
                    ctx.renderer
                        .render_container(spec, CONTAINER_ARTIFACT, &subs, PROXY_COMPONENT)?;
                let mut volumes = sidecar_volumes(&settings);
                if let Some(proxy) = ctx.module.component(PROXY_COMPONENT) {
                    inject::overlay_volumes(&mut volumes, &proxy.volumes);
                }
                Ok(ModuleOutput {
                    objects: Vec::new(),
                    controller: Some(SidecarPayload {
                        container: Some(container),
                        volumes,
                        driver_env: vec![inject::env(
                            "X_CSI_POWERMAX_SIDECAR_PROXY_PORT",
                            settings.port.as_str(),
                        )],
                        ..Default::default()
                    }),
                    node: None,
                })
            }
            ProxyMode::Standalone => {
                let mut objects = ctx.renderer.render_objects(spec, CONTROLLER_ARTIFACT, &subs)?;
                for object in objects.iter_mut() {
                    object.ensure_namespace(ctx.namespace());
                }
                apply_image_override(&mut objects, spec, PROXY_COMPONENT, PROXY_COMPONENT);
                Ok(ModuleOutput {
                    objects,
                    controller: Some(SidecarPayload::env_only(vec![inject::env(
                        "X_CSI_POWERMAX_PROXY_SERVICE_NAME",
                        SERVICE_NAME,
                    )])),
                    node: None,
                })
            }
        }
    }
}
