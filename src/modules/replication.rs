//! Replication module
//!
//! Adds the `dell-csi-replicator` sidecar to the driver controller, passes
//! the replication prefixes to both driver containers and optionally deploys
//! the replication controller manager.

use crate::crd::{Module, ModuleType};
use crate::error::Result;
use crate::modules::inject::{self, SidecarPayload};
use crate::modules::precheck::{check_driver_and_version, check_prerequisites, Prerequisite};
use crate::modules::template::apply_image_override;
use crate::modules::version::VersionSpec;
use crate::modules::{ModuleCapability, ModuleContext, ModuleOutput, PrecheckOutcome};
use async_trait::async_trait;
use tracing::{debug, info};

pub const REPLICATOR_COMPONENT: &str = "dell-csi-replicator";
pub const MANAGER_COMPONENT: &str = "dell-replication-controller-manager";

const CONTAINER_ARTIFACT: &str = "container.yaml";
const CONTROLLER_ARTIFACT: &str = "controller.yaml";
const MANAGER_CONTAINER: &str = "manager";

const TOKEN_CONTEXT_PREFIX: &str = "<REPLICATION_CONTEXT_PREFIX>";
const TOKEN_PREFIX: &str = "<REPLICATION_PREFIX>";
const TOKEN_CTRL_LOG_LEVEL: &str = "<REPLICATION_CTRL_LOG_LEVEL>";
const TOKEN_CTRL_REPLICAS: &str = "<REPLICATION_CTRL_REPLICAS>";
const TOKEN_RETRY_MIN: &str = "<RETRY_INTERVAL_MIN>";
const TOKEN_RETRY_MAX: &str = "<RETRY_INTERVAL_MAX>";

const ENV_CONTEXT_PREFIX: &str = "X_CSI_REPLICATION_CONTEXT_PREFIX";
const ENV_PREFIX: &str = "X_CSI_REPLICATION_PREFIX";

const DEFAULT_PREFIX: &str = "replication.storage.dell.com";

/// Remote cluster IDs whose kubeconfig secrets must exist. The local
/// cluster (`self`) needs none.
pub fn target_clusters(module: &Module) -> Vec<String> {
    module
        .component(MANAGER_COMPONENT)
        .and_then(|c| c.env("TARGET_CLUSTERS_IDS"))
        .map(|ids| {
            ids.split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty() && *id != "self")
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

pub struct Replication;

#[async_trait]
impl ModuleCapability for Replication {
    fn module_type(&self) -> ModuleType {
        ModuleType::Replication
    }

    async fn precheck(&self, ctx: &ModuleContext<'_>) -> Result<PrecheckOutcome> {
        let driver = check_driver_and_version(
            ctx.resolver,
            ModuleType::Replication,
            ctx.driver_type(),
            &ctx.module.config_version,
        )?;

        let namespace = &ctx.config.replication_namespace;
        let required: Vec<_> = target_clusters(ctx.module)
            .into_iter()
            .map(|cluster| Prerequisite::secret(namespace.as_str(), cluster))
            .collect();
        check_prerequisites(ctx.lookup, &required).await?;

        info!("Replication precheck passed for {}/{}", ctx.namespace(), ctx.cr.name());
        Ok(PrecheckOutcome::new(driver))
    }

    fn render(
        &self,
        ctx: &ModuleContext<'_>,
        spec: &VersionSpec,
        outcome: &PrecheckOutcome,
    ) -> Result<ModuleOutput> {
        let replicator = ctx.module.component(REPLICATOR_COMPONENT);
        let manager = ctx.module.component(MANAGER_COMPONENT);

        let mut subs = ctx.substitutions(outcome);
        subs.from_env(
            replicator,
            TOKEN_CONTEXT_PREFIX,
            ENV_CONTEXT_PREFIX,
            outcome.driver.plugin_identifier,
        )
        .from_env(replicator, TOKEN_PREFIX, ENV_PREFIX, DEFAULT_PREFIX)
        .from_env(replicator, TOKEN_RETRY_MIN, "RETRY_INTERVAL_MIN", "1s")
        .from_env(replicator, TOKEN_RETRY_MAX, "RETRY_INTERVAL_MAX", "5m")
        .from_env(manager, TOKEN_CTRL_LOG_LEVEL, "REPLICATION_CTRL_LOG_LEVEL", "debug")
        .from_env(manager, TOKEN_CTRL_REPLICAS, "REPLICATION_CTRL_REPLICAS", "1");

        let driver_env = vec![
            inject::env(ENV_CONTEXT_PREFIX, subs.get(TOKEN_CONTEXT_PREFIX).unwrap_or_default()),
            inject::env(ENV_PREFIX, subs.get(TOKEN_PREFIX).unwrap_or_default()),
        ];

        let container =
            ctx.renderer
                .render_container(spec, CONTAINER_ARTIFACT, &subs, REPLICATOR_COMPONENT)?;

        let mut objects = Vec::new();
        if ctx.module.component_enabled(MANAGER_COMPONENT) {
            objects = ctx.renderer.render_objects(spec, CONTROLLER_ARTIFACT, &subs)?;
            for object in objects.iter_mut() {
                object.ensure_namespace(&ctx.config.replication_namespace);
            }
            apply_image_override(&mut objects, spec, MANAGER_COMPONENT, MANAGER_CONTAINER);
        } else {
            debug!("Replication controller manager not enabled, skipping");
        }

        Ok(ModuleOutput {
            objects,
            controller: Some(SidecarPayload {
                container: Some(container),
                driver_env: driver_env.clone(),
                ..Default::default()
            }),
            node: Some(SidecarPayload::env_only(driver_env)),
        })
    }
}
