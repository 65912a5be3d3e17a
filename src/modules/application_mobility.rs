//! Application mobility module
//!
//! Deploys the application mobility controller manager next to the driver.
//! Nothing is injected into the driver workloads.

use crate::crd::ModuleType;
use crate::error::Result;
use crate::modules::precheck::{check_driver_and_version, check_prerequisites, Prerequisite};
use crate::modules::template::apply_image_override;
use crate::modules::version::VersionSpec;
use crate::modules::{ModuleCapability, ModuleContext, ModuleOutput, PrecheckOutcome};
use async_trait::async_trait;
use tracing::info;

pub const MANAGER_COMPONENT: &str = "application-mobility-controller-manager";

const MANAGER_ARTIFACT: &str = "app-mobility-controller-manager.yaml";
const MANAGER_CONTAINER: &str = "manager";

const DEFAULT_LICENSE: &str = "license";
const DEFAULT_OBJECT_STORE_SECRET: &str = "app-mobility-obj-store-secret";

pub struct ApplicationMobility;

impl ApplicationMobility {
    fn secret_names(ctx: &ModuleContext<'_>) -> (String, String) {
        let manager = ctx.module.component(MANAGER_COMPONENT);
        let get = |name: &str, default: &str| {
            manager
                .and_then(|c| c.env(name))
                .unwrap_or(default)
                .to_string()
        };
        (
            get("LICENSE_NAME", DEFAULT_LICENSE),
            get("OBJECT_STORE_SECRET_NAME", DEFAULT_OBJECT_STORE_SECRET),
        )
    }
}

#[async_trait]
impl ModuleCapability for ApplicationMobility {
    fn module_type(&self) -> ModuleType {
        ModuleType::ApplicationMobility
    }

    async fn precheck(&self, ctx: &ModuleContext<'_>) -> Result<PrecheckOutcome> {
        let driver = check_driver_and_version(
            ctx.resolver,
            ModuleType::ApplicationMobility,
            ctx.driver_type(),
            &ctx.module.config_version,
        )?;

        let (license, object_store) = Self::secret_names(ctx);
        let required = vec![
            Prerequisite::secret(ctx.namespace(), license),
            Prerequisite::secret(ctx.namespace(), object_store),
        ];
        check_prerequisites(ctx.lookup, &required).await?;

        info!("Application mobility precheck passed for {}/{}", ctx.namespace(), ctx.cr.name());
        Ok(PrecheckOutcome::new(driver))
    }

    fn render(
        &self,
        ctx: &ModuleContext<'_>,
        spec: &VersionSpec,
        outcome: &PrecheckOutcome,
    ) -> Result<ModuleOutput> {
        let manager = ctx.module.component(MANAGER_COMPONENT);
        let (license, object_store) = Self::secret_names(ctx);

        let mut subs = ctx.substitutions(outcome);
        subs.from_env(manager, "<APPLICATION_MOBILITY_REPLICAS>", "APPLICATION_MOBILITY_REPLICAS", "1")
            .set("<APPLICATION_MOBILITY_LICENSE_NAME>", license)
            .set("<APPLICATION_MOBILITY_OBJECT_STORE_SECRET_NAME>", object_store);

        let mut objects = ctx.renderer.render_objects(spec, MANAGER_ARTIFACT, &subs)?;
        for object in objects.iter_mut() {
            object.ensure_namespace(ctx.namespace());
        }
        apply_image_override(&mut objects, spec, MANAGER_COMPONENT, MANAGER_CONTAINER);

        Ok(ModuleOutput {
            objects,
            controller: None,
            node: None,
        })
    }
}
