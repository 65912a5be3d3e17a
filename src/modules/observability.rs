//! Observability module
//!
//! Deploys topology, the OpenTelemetry collector and the per-driver metrics
//! service into the observability namespace. When authorization is enabled
//! on the same custom resource, the metrics Deployment talks to the array
//! through the authorization proxy sidecar.

use crate::crd::{DriverType, Module, ModuleType};
use crate::domain::objects::RenderedObject;
use crate::error::Result;
use crate::modules::authorization;
use crate::modules::precheck::{check_driver_and_version, check_prerequisites, Prerequisite};
use crate::modules::template::{apply_image_override, Substitutions};
use crate::modules::version::VersionSpec;
use crate::modules::{ModuleCapability, ModuleContext, ModuleOutput, PrecheckOutcome};
use async_trait::async_trait;
use tracing::{debug, info};

pub const TOPOLOGY_COMPONENT: &str = "topology";
pub const OTEL_COMPONENT: &str = "otel-collector";
pub const CERT_MANAGER_COMPONENT: &str = "cert-manager";

const TOPOLOGY_ARTIFACT: &str = "karavi-topology.yaml";
const OTEL_ARTIFACT: &str = "karavi-otel-collector.yaml";

const TOPOLOGY_TLS_SECRET: &str = "karavi-topology-tls";
const OTEL_TLS_SECRET: &str = "otel-collector-tls";

/// Metrics service settings of one driver family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsDriver {
    /// Canonical driver name used in component and artifact names
    pub name: &'static str,
    /// Prefix of the driver's metrics tokens
    pub token_prefix: &'static str,
    /// Secret holding array credentials
    pub credentials_secret: &'static str,
}

impl MetricsDriver {
    pub fn for_driver(driver: DriverType) -> Option<Self> {
        let metrics = match driver.canonical() {
            DriverType::PowerScale => Self {
                name: "powerscale",
                token_prefix: "POWERSCALE",
                credentials_secret: "isilon-creds",
            },
            DriverType::PowerFlex => Self {
                name: "powerflex",
                token_prefix: "POWERFLEX",
                credentials_secret: "vxflexos-config",
            },
            DriverType::PowerMax => Self {
                name: "powermax",
                token_prefix: "POWERMAX",
                credentials_secret: "powermax-creds",
            },
            DriverType::PowerStore => Self {
                name: "powerstore",
                token_prefix: "POWERSTORE",
                credentials_secret: "powerstore-config",
            },
            _ => return None,
        };
        Some(metrics)
    }

    /// `metrics-<driver>`
    pub fn component(&self) -> String {
        format!("metrics-{}", self.name)
    }

    /// `karavi-metrics-<driver>`, the Deployment and its container
    pub fn workload(&self) -> String {
        format!("karavi-metrics-{}", self.name)
    }

    pub fn artifact(&self) -> String {
        format!("karavi-metrics-{}.yaml", self.name)
    }

    /// Token, env name and default of each metrics setting
    fn settings(&self) -> Vec<(String, String, &'static str)> {
        [
            ("MAX_CONCURRENT_QUERIES", "10"),
            ("CAPACITY_METRICS_ENABLED", "true"),
            ("PERFORMANCE_METRICS_ENABLED", "true"),
            ("LOG_LEVEL", "INFO"),
            ("LOG_FORMAT", "TEXT"),
        ]
        .into_iter()
        .map(|(setting, default)| {
            let env = format!("{}_{}", self.token_prefix, setting);
            (format!("<{}>", env), env, default)
        })
        .collect()
    }
}

/// Secrets the enabled components need. `authorization` is the enabled
/// authorization module of the same resource, whose proxy the metrics
/// Deployment then carries.
pub fn required_resources(
    namespace: &str,
    module: &Module,
    driver: DriverType,
    authorization: Option<&Module>,
) -> Vec<Prerequisite> {
    let mut required = Vec::new();

    if let Some(metrics) = MetricsDriver::for_driver(driver) {
        if module.component_enabled(&metrics.component()) {
            required.push(Prerequisite::secret(namespace, metrics.credentials_secret));
            if let Some(auth) = authorization {
                required.extend(authorization::required_resources(namespace, auth));
            }
        }
    }

    // Without cert-manager the TLS material is supplied by the user
    if !module.component_enabled(CERT_MANAGER_COMPONENT) {
        if module.component_enabled(TOPOLOGY_COMPONENT) {
            required.push(Prerequisite::secret(namespace, TOPOLOGY_TLS_SECRET));
        }
        if module.component_enabled(OTEL_COMPONENT) {
            required.push(Prerequisite::secret(namespace, OTEL_TLS_SECRET));
        }
    }

    required
}

fn enabled_authorization<'a>(ctx: &ModuleContext<'a>) -> Option<&'a Module> {
    ctx.cr.module(ModuleType::Authorization).filter(|m| m.enabled)
}

pub struct Observability;

impl Observability {
    fn render_component(
        &self,
        ctx: &ModuleContext<'_>,
        spec: &VersionSpec,
        subs: &Substitutions,
        artifact: &str,
        component: &str,
        container: &str,
    ) -> Result<Vec<RenderedObject>> {
        let mut objects = ctx.renderer.render_objects(spec, artifact, subs)?;
        for object in objects.iter_mut() {
            object.ensure_namespace(&ctx.config.observability_namespace);
        }
        apply_image_override(&mut objects, spec, component, container);
        Ok(objects)
    }

    /// Put the authorization proxy in front of the metrics Deployment
    fn inject_authorization(
        &self,
        ctx: &ModuleContext<'_>,
        outcome: &PrecheckOutcome,
        objects: &mut [RenderedObject],
        workload: &str,
    ) -> Result<()> {
        let Some(auth) = enabled_authorization(ctx) else {
            return Ok(());
        };

        let auth_spec = ctx.resolver.resolve(auth, &ctx.cr.spec.driver)?;
        let payload =
            authorization::sidecar_payload(ctx.renderer, ctx.cr, auth, &auth_spec, outcome.driver)?;

        for object in objects.iter_mut() {
            if let RenderedObject::Deployment(deployment) = object {
                if deployment.metadata.name.as_deref() == Some(workload) {
                    payload.inject_into(deployment)?;
                    debug!("Injected authorization into {}", workload);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ModuleCapability for Observability {
    fn module_type(&self) -> ModuleType {
        ModuleType::Observability
    }

    async fn precheck(&self, ctx: &ModuleContext<'_>) -> Result<PrecheckOutcome> {
        let driver = check_driver_and_version(
            ctx.resolver,
            ModuleType::Observability,
            ctx.driver_type(),
            &ctx.module.config_version,
        )?;

        let required = required_resources(
            &ctx.config.observability_namespace,
            ctx.module,
            ctx.driver_type(),
            enabled_authorization(ctx),
        );
        check_prerequisites(ctx.lookup, &required).await?;

        info!("Observability precheck passed for {}/{}", ctx.namespace(), ctx.cr.name());
        Ok(PrecheckOutcome::new(driver))
    }

    fn render(
        &self,
        ctx: &ModuleContext<'_>,
        spec: &VersionSpec,
        outcome: &PrecheckOutcome,
    ) -> Result<ModuleOutput> {
        let module = ctx.module;
        let topology = module.component(TOPOLOGY_COMPONENT);
        let otel = module.component(OTEL_COMPONENT);

        let mut subs = ctx.substitutions(outcome);
        subs.from_env(topology, "<TOPOLOGY_LOG_LEVEL>", "TOPOLOGY_LOG_LEVEL", "INFO")
            .from_env(otel, "<OTEL_COLLECTOR_LOG_LEVEL>", "OTEL_COLLECTOR_LOG_LEVEL", "info");

        let mut objects = Vec::new();

        if module.component_enabled(TOPOLOGY_COMPONENT) {
            objects.extend(self.render_component(
                ctx,
                spec,
                &subs,
                TOPOLOGY_ARTIFACT,
                TOPOLOGY_COMPONENT,
                "karavi-topology",
            )?);
        }

        if module.component_enabled(OTEL_COMPONENT) {
            objects.extend(self.render_component(
                ctx,
                spec,
                &subs,
                OTEL_ARTIFACT,
                OTEL_COMPONENT,
                "otel-collector",
            )?);
        }

        if let Some(metrics) = MetricsDriver::for_driver(ctx.driver_type()) {
            let component = metrics.component();
            if module.component_enabled(&component) {
                let source = module.component(&component);
                for (token, env, default) in metrics.settings() {
                    subs.from_env(source, token, &env, default);
                }

                let workload = metrics.workload();
                let mut rendered = self.render_component(
                    ctx,
                    spec,
                    &subs,
                    &metrics.artifact(),
                    &component,
                    &workload,
                )?;
                self.inject_authorization(ctx, outcome, &mut rendered, &workload)?;
                objects.extend(rendered);
            }
        }

        Ok(ModuleOutput {
            objects,
            controller: None,
            node: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::modules::inject::PodWorkload;
    use crate::testing::{module_of, sample_csm, Fixture};
    use assert_matches::assert_matches;
    use k8s_openapi::api::apps::v1::Deployment;

    const MODULES: &str = r#"
- name: observability
  enabled: true
  components:
    - name: topology
      envs:
        - name: TOPOLOGY_LOG_LEVEL
          value: DEBUG
    - name: otel-collector
    - name: cert-manager
      enabled: false
    - name: metrics-powerscale
      envs:
        - name: POWERSCALE_MAX_CONCURRENT_QUERIES
          value: "25"
"#;

    fn deployment<'a>(objects: &'a [RenderedObject], name: &str) -> Option<&'a Deployment> {
        objects.iter().find_map(|o| match o {
            RenderedObject::Deployment(d) if d.metadata.name.as_deref() == Some(name) => Some(d),
            _ => None,
        })
    }

    fn env<'a>(d: &'a Deployment, container: &str, name: &str) -> Option<&'a str> {
        d.pod_spec()?
            .containers
            .iter()
            .find(|c| c.name == container)?
            .env
            .as_ref()?
            .iter()
            .find(|e| e.name == name)?
            .value
            .as_deref()
    }

    #[test]
    fn test_required_resources() {
        let csm = sample_csm("powerscale", MODULES);
        let module = module_of(&csm, ModuleType::Observability);
        let names: Vec<_> = required_resources("karavi", module, DriverType::PowerScale, None)
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, vec!["isilon-creds", "karavi-topology-tls", "otel-collector-tls"]);
    }

    #[tokio::test]
    async fn test_precheck_reports_credentials_first() {
        let fixture = Fixture::new();
        let csm = sample_csm("powerscale", MODULES);
        let ctx = fixture.context(&csm, module_of(&csm, ModuleType::Observability));

        let err = Observability.precheck(&ctx).await.unwrap_err();
        assert_matches!(
            err,
            Error::MissingPrerequisite { ref name, ref namespace, .. }
                if name == "isilon-creds" && namespace == "karavi"
        );

        for secret in ["isilon-creds", "karavi-topology-tls", "otel-collector-tls"] {
            fixture.cluster.add_secret("karavi", secret);
        }
        assert!(Observability.precheck(&ctx).await.is_ok());
    }

    #[tokio::test]
    async fn test_precheck_requires_authorization_secrets_in_karavi() {
        let fixture = Fixture::new();
        let modules = format!(
            "{}- name: authorization\n  enabled: true\n",
            MODULES.trim_start()
        );
        let csm = sample_csm("powerscale", &modules);
        let ctx = fixture.context(&csm, module_of(&csm, ModuleType::Observability));

        for secret in ["isilon-creds", "karavi-topology-tls", "otel-collector-tls"] {
            fixture.cluster.add_secret("karavi", secret);
        }
        // Present in the driver namespace only
        for secret in [authorization::CONFIG_SECRET, authorization::TOKENS_SECRET] {
            fixture.cluster.add_secret("isilon", secret);
        }
        let err = Observability.precheck(&ctx).await.unwrap_err();
        assert_matches!(
            err,
            Error::MissingPrerequisite { ref name, ref namespace, .. }
                if name == authorization::CONFIG_SECRET && namespace == "karavi"
        );

        for secret in [
            authorization::CONFIG_SECRET,
            authorization::TOKENS_SECRET,
            authorization::ROOT_CERTIFICATE,
        ] {
            fixture.cluster.add_secret("karavi", secret);
        }
        assert!(Observability.precheck(&ctx).await.is_ok());
    }

    #[test]
    fn test_render_enabled_components() {
        let fixture = Fixture::new();
        let csm = sample_csm("powerscale", MODULES);
        let module = module_of(&csm, ModuleType::Observability);
        let ctx = fixture.context(&csm, module);
        let spec = fixture.resolver.resolve(module, &csm.spec.driver).unwrap();

        let output = Observability
            .render(&ctx, &spec, &Observability.assumed_outcome(&ctx))
            .unwrap();
        assert!(output.controller.is_none() && output.node.is_none());
        assert!(output
            .objects
            .iter()
            .filter(|o| !o.is_cluster_scoped())
            .all(|o| o.namespace() == Some("karavi")));

        let topology = deployment(&output.objects, "karavi-topology").unwrap();
        assert_eq!(env(topology, "karavi-topology", "LOG_LEVEL"), Some("DEBUG"));
        assert!(deployment(&output.objects, "otel-collector").is_some());

        let metrics = deployment(&output.objects, "karavi-metrics-powerscale").unwrap();
        assert_eq!(
            env(metrics, "karavi-metrics-powerscale", "POWERSCALE_MAX_CONCURRENT_QUERIES"),
            Some("25")
        );
        assert_eq!(env(metrics, "karavi-metrics-powerscale", "LOG_FORMAT"), Some("TEXT"));
        // authorization is not enabled on this resource
        assert_eq!(metrics.pod_spec().unwrap().containers.len(), 1);
    }

    #[test]
    fn test_disabled_components_not_rendered() {
        let fixture = Fixture::new();
        let csm = sample_csm(
            "powermax",
            "- name: observability\n  enabled: true\n  components:\n    - name: topology\n      enabled: false\n    - name: metrics-powermax\n",
        );
        let module = module_of(&csm, ModuleType::Observability);
        let ctx = fixture.context(&csm, module);
        let spec = fixture.resolver.resolve(module, &csm.spec.driver).unwrap();

        let output = Observability
            .render(&ctx, &spec, &Observability.assumed_outcome(&ctx))
            .unwrap();
        assert!(deployment(&output.objects, "karavi-topology").is_none());
        assert!(deployment(&output.objects, "otel-collector").is_none());
        assert!(deployment(&output.objects, "karavi-metrics-powermax").is_some());
    }

    #[test]
    fn test_metrics_get_authorization_sidecar() {
        let fixture = Fixture::new();
        let modules = format!(
            "{}- name: authorization\n  enabled: true\n  components:\n    - name: karavi-authorization-proxy\n      envs:\n        - name: INSECURE\n          value: \"true\"\n",
            MODULES.trim_start()
        );
        let csm = sample_csm("powerscale", &modules);
        let module = module_of(&csm, ModuleType::Observability);
        let ctx = fixture.context(&csm, module);
        let spec = fixture.resolver.resolve(module, &csm.spec.driver).unwrap();

        let output = Observability
            .render(&ctx, &spec, &Observability.assumed_outcome(&ctx))
            .unwrap();
        let metrics = deployment(&output.objects, "karavi-metrics-powerscale").unwrap();
        let containers = &metrics.pod_spec().unwrap().containers;
        assert_eq!(containers.len(), 2);
        assert_eq!(containers[1].name, authorization::PROXY_COMPONENT);
        assert_eq!(
            metrics.metadata.annotations.as_ref().unwrap()[authorization::INJECTED_ANNOTATION],
            "true"
        );
    }
}
