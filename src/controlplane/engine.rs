//! Module Engine
//!
//! One sequential pass over a `ContainerStorageModule`: render the driver
//! workloads, run every planned module through precheck, resolve, render and
//! inject, then hand the objects to the reconciler. A module that fails is
//! recorded in the report and the pass moves on to the next one.

use crate::config::OperatorConfig;
use crate::controlplane::reconciler::reconcile;
use crate::crd::{
    ContainerStorageModule, ContainerStorageModuleStatus, CsmState, DriverType, Module,
    ModuleState, ModuleStatus, ModuleType,
};
use crate::domain::objects::RenderedObject;
use crate::domain::ports::{ObjectClientRef, ResourceLookupRef};
use crate::driver::{render_driver, DriverWorkloads};
use crate::error::{Error, Result};
use crate::metrics::EngineMetrics;
use crate::modules::template::TemplateRenderer;
use crate::modules::version::VersionResolver;
use crate::modules::{capability, registry, ModuleContext};
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// =============================================================================
// Report
// =============================================================================

/// Whether a pass installs or removes the custom resource's objects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileMode {
    Install,
    Uninstall,
}

/// Outcome of one module in a pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleReport {
    pub module: ModuleType,
    pub state: ModuleState,
    /// Objects applied, or deleted when removing
    pub objects: usize,
    pub message: Option<String>,
}

/// Outcome of the driver workloads in a pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriverReport {
    pub objects: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub mode: ReconcileMode,
    pub modules: Vec<ModuleReport>,
    pub driver: DriverReport,
}

impl ReconcileReport {
    fn new(mode: ReconcileMode) -> Self {
        Self {
            mode,
            modules: Vec::new(),
            driver: DriverReport::default(),
        }
    }

    pub fn module(&self, module: ModuleType) -> Option<&ModuleReport> {
        self.modules.iter().find(|m| m.module == module)
    }

    /// Human-readable failures, driver last
    pub fn failures(&self) -> Vec<String> {
        let mut failures: Vec<String> = self
            .modules
            .iter()
            .filter(|m| m.state == ModuleState::Failed)
            .map(|m| format!("{}: {}", m.module, m.message.as_deref().unwrap_or("failed")))
            .collect();
        if let Some(e) = &self.driver.error {
            failures.push(format!("driver: {}", e));
        }
        failures
    }

    pub fn is_success(&self) -> bool {
        self.failures().is_empty()
    }

    /// Status written back to the custom resource
    pub fn to_status(&self) -> ContainerStorageModuleStatus {
        ContainerStorageModuleStatus {
            state: if self.is_success() {
                CsmState::Succeeded
            } else {
                CsmState::Failed
            },
            modules: self
                .modules
                .iter()
                .map(|m| ModuleStatus {
                    name: m.module,
                    state: m.state,
                    objects: u32::try_from(m.objects).unwrap_or(u32::MAX),
                    message: m.message.clone(),
                })
                .collect(),
            last_reconcile_time: Some(Utc::now()),
        }
    }
}

// =============================================================================
// Planning
// =============================================================================

/// Modules to process, in custom resource order. Only the first entry of a
/// name counts. A PowerMax driver always gets a reverse proxy, synthesized
/// when the resource does not list one.
pub fn plan_modules(cr: &ContainerStorageModule) -> Vec<Module> {
    let mut planned: Vec<Module> = Vec::new();
    for module in &cr.spec.modules {
        if planned.iter().any(|m| m.name == module.name) {
            debug!("Ignoring repeated {} entry in {}", module.name, cr.name());
            continue;
        }
        planned.push(module.clone());
    }

    if cr.driver_type().canonical() == DriverType::PowerMax
        && !planned.iter().any(|m| m.name == ModuleType::ReverseProxy)
    {
        debug!("Adding default reverse proxy for {}", cr.name());
        planned.push(Module::synthetic(ModuleType::ReverseProxy));
    }

    planned
}

// =============================================================================
// Engine
// =============================================================================

pub struct ModuleEngine {
    config: OperatorConfig,
    resolver: VersionResolver,
    renderer: TemplateRenderer,
    client: ObjectClientRef,
    lookup: ResourceLookupRef,
    metrics: Option<Arc<EngineMetrics>>,
}

impl ModuleEngine {
    pub fn new(config: OperatorConfig, client: ObjectClientRef, lookup: ResourceLookupRef) -> Self {
        Self {
            resolver: VersionResolver::new(&config),
            renderer: TemplateRenderer::new(&config),
            config,
            client,
            lookup,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &OperatorConfig {
        &self.config
    }

    /// Install, or uninstall when the resource is being deleted
    pub async fn reconcile(
        &self,
        cr: &ContainerStorageModule,
        cancel: &CancellationToken,
    ) -> Result<ReconcileReport> {
        let mode = if cr.is_deleting() {
            ReconcileMode::Uninstall
        } else {
            ReconcileMode::Install
        };
        self.run(cr, mode, cancel).await
    }

    pub async fn run(
        &self,
        cr: &ContainerStorageModule,
        mode: ReconcileMode,
        cancel: &CancellationToken,
    ) -> Result<ReconcileReport> {
        info!("Reconciling {}/{} ({:?})", cr.namespace(), cr.name(), mode);
        let started = Instant::now();

        let report = match mode {
            ReconcileMode::Install => self.install(cr, cancel).await?,
            ReconcileMode::Uninstall => self.uninstall(cr, cancel).await?,
        };

        if let Some(metrics) = &self.metrics {
            metrics.observe_duration(started.elapsed().as_secs_f64());
        }

        let failures = report.failures();
        if failures.is_empty() {
            info!("Reconciled {}/{} in {:?}", cr.namespace(), cr.name(), started.elapsed());
        } else {
            warn!(
                "Reconciled {}/{} with {} failures: {}",
                cr.namespace(),
                cr.name(),
                failures.len(),
                failures.join("; ")
            );
        }
        Ok(report)
    }

    fn context<'a>(&'a self, cr: &'a ContainerStorageModule, module: &'a Module) -> ModuleContext<'a> {
        ModuleContext {
            cr,
            module,
            config: &self.config,
            resolver: &self.resolver,
            renderer: &self.renderer,
            lookup: self.lookup.as_ref(),
        }
    }

    async fn install(
        &self,
        cr: &ContainerStorageModule,
        cancel: &CancellationToken,
    ) -> Result<ReconcileReport> {
        let mut workloads = render_driver(&self.config, &self.renderer, cr)?;
        let mut report = ReconcileReport::new(ReconcileMode::Install);

        for module in plan_modules(cr) {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let ctx = self.context(cr, &module);
            let outcome = if module.enabled {
                self.install_module(&ctx, &mut workloads, cancel)
                    .await
                    .map(|n| (ModuleState::Applied, n))
            } else {
                self.remove_module(&ctx, cancel)
                    .await
                    .map(|n| (ModuleState::Removed, n))
            };
            self.record(&mut report, module.name, outcome)?;
        }

        self.sync_driver(workloads.into_objects(), false, &mut report, cancel)
            .await?;
        Ok(report)
    }

    async fn uninstall(
        &self,
        cr: &ContainerStorageModule,
        cancel: &CancellationToken,
    ) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::new(ReconcileMode::Uninstall);

        for module in plan_modules(cr) {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let ctx = self.context(cr, &module);
            let outcome = self
                .remove_module(&ctx, cancel)
                .await
                .map(|n| (ModuleState::Removed, n));
            self.record(&mut report, module.name, outcome)?;
        }

        match render_driver(&self.config, &self.renderer, cr) {
            Ok(workloads) => {
                self.sync_driver(workloads.into_objects(), true, &mut report, cancel)
                    .await?
            }
            Err(e) => {
                error!("Cannot render driver of {} for removal: {}", cr.name(), e);
                report.driver.error = Some(e.to_string());
            }
        }
        Ok(report)
    }

    /// Precheck, resolve, render, inject and apply one enabled module.
    /// Driver workloads only change when every step succeeds.
    async fn install_module(
        &self,
        ctx: &ModuleContext<'_>,
        workloads: &mut DriverWorkloads,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let module = capability(ctx.module.name);

        let outcome = module.precheck(ctx).await?;
        let spec = self.resolver.resolve(ctx.module, &ctx.cr.spec.driver)?;
        debug!("Resolved {} to {}", spec.module, spec.version);

        let output = module.render(ctx, &spec, &outcome)?;
        let mut candidate = workloads.clone();
        module.inject(&output, &mut candidate)?;

        let summary = reconcile(&output.objects, false, self.client.as_ref(), cancel).await?;
        *workloads = candidate;
        Ok(summary.total())
    }

    /// Delete the standalone objects of a module. Absent objects are fine.
    async fn remove_module(&self, ctx: &ModuleContext<'_>, cancel: &CancellationToken) -> Result<usize> {
        if registry::supports(ctx.module.name, ctx.driver_type()).is_none() {
            debug!("{} never deployed for {}", ctx.module.name, ctx.driver_type().as_str());
            return Ok(0);
        }

        let module = capability(ctx.module.name);
        let spec = match self.resolver.resolve(ctx.module, &ctx.cr.spec.driver) {
            Ok(spec) => spec,
            // An unresolvable version could never have been installed
            Err(e @ (Error::UnsupportedVersion { .. } | Error::DefaultVersionNotFound { .. })) => {
                debug!("{} never deployed: {}", ctx.module.name, e);
                return Ok(0);
            }
            Err(e) => return Err(e),
        };
        let output = module.render(ctx, &spec, &module.assumed_outcome(ctx))?;

        let summary = reconcile(&output.objects, true, self.client.as_ref(), cancel).await?;
        Ok(summary.changed.len())
    }

    async fn sync_driver(
        &self,
        objects: Vec<RenderedObject>,
        deleting: bool,
        report: &mut ReconcileReport,
        cancel: &CancellationToken,
    ) -> Result<()> {
        match reconcile(&objects, deleting, self.client.as_ref(), cancel).await {
            Ok(summary) => {
                let changed = summary.changed.len();
                if let Some(metrics) = &self.metrics {
                    metrics.record_objects(changed, deleting);
                }
                report.driver.objects = changed;
                Ok(())
            }
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(e) => {
                error!("Driver workloads failed: {}", e);
                report.driver.error = Some(e.to_string());
                Ok(())
            }
        }
    }

    /// Add a module outcome to the report. Cancellation ends the pass.
    fn record(
        &self,
        report: &mut ReconcileReport,
        module: ModuleType,
        outcome: Result<(ModuleState, usize)>,
    ) -> Result<()> {
        let entry = match outcome {
            Ok((state, objects)) => {
                info!("Module {} {:?} ({} objects)", module, state, objects);
                if let Some(metrics) = &self.metrics {
                    metrics.record_objects(objects, state == ModuleState::Removed);
                }
                ModuleReport {
                    module,
                    state,
                    objects,
                    message: None,
                }
            }
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => {
                warn!("Module {} failed: {}", module, e);
                ModuleReport {
                    module,
                    state: ModuleState::Failed,
                    objects: 0,
                    message: Some(e.to_string()),
                }
            }
        };

        if let Some(metrics) = &self.metrics {
            metrics.record_module(module, entry.state);
        }
        report.modules.push(entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::memory::InMemoryCluster;
    use crate::modules::authorization::{CONFIG_SECRET, INJECTED_ANNOTATION, ROOT_CERTIFICATE, TOKENS_SECRET};
    use crate::modules::inject::PodWorkload;
    use crate::testing::{fixture_config, sample_csm};
    use assert_matches::assert_matches;
    use k8s_openapi::api::apps::v1::Deployment;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use tempfile::TempDir;

    const AUTH_AND_RESILIENCY: &str = r#"
- name: authorization
  enabled: true
  components:
    - name: karavi-authorization-proxy
      envs:
        - name: INSECURE
          value: "true"
- name: resiliency
  enabled: true
"#;

    const REPLICATION: &str = r#"
- name: replication
  enabled: true
  components:
    - name: dell-csi-replicator
    - name: dell-replication-controller-manager
      envs:
        - name: TARGET_CLUSTERS_IDS
          value: self
"#;

    const MANAGER: &str = "Deployment/dell-replication-controller/dell-replication-controller-manager";

    fn engine() -> (ModuleEngine, Arc<InMemoryCluster>, Arc<EngineMetrics>, TempDir) {
        let (config, dir) = fixture_config();
        let cluster = Arc::new(InMemoryCluster::new());
        let metrics = Arc::new(EngineMetrics::new().unwrap());
        let engine = ModuleEngine::new(config, cluster.clone(), cluster.clone())
            .with_metrics(metrics.clone());
        (engine, cluster, metrics, dir)
    }

    fn controller(cluster: &InMemoryCluster, name: &str) -> Deployment {
        match cluster.get(&format!("Deployment/{name}/{name}-controller")) {
            Some(RenderedObject::Deployment(d)) => d,
            other => panic!("controller not applied: {:?}", other.map(|o| o.display_name())),
        }
    }

    fn container_names(deployment: &Deployment) -> Vec<String> {
        deployment
            .pod_spec()
            .unwrap()
            .containers
            .iter()
            .map(|c| c.name.clone())
            .collect()
    }

    #[test]
    fn test_plan_first_entry_wins() {
        let csm = sample_csm(
            "powerscale",
            "- name: resiliency\n  enabled: true\n- name: resiliency\n  enabled: false\n",
        );
        let planned = plan_modules(&csm);
        assert_eq!(planned.len(), 1);
        assert!(planned[0].enabled);
    }

    #[test]
    fn test_plan_adds_reverse_proxy_for_powermax() {
        let planned = plan_modules(&sample_csm("powermax", ""));
        assert_eq!(planned.len(), 1);
        assert_eq!(planned[0].name, ModuleType::ReverseProxy);
        assert!(planned[0].enabled);

        let listed = sample_csm("powermax", "- name: csireverseproxy\n  enabled: false\n");
        let planned = plan_modules(&listed);
        assert_eq!(planned.len(), 1);
        assert!(!planned[0].enabled);

        assert!(plan_modules(&sample_csm("powerstore", "")).is_empty());
    }

    #[tokio::test]
    async fn test_install_insecure_authorization() {
        let (engine, cluster, metrics, _dir) = engine();
        cluster.add_secret("isilon", CONFIG_SECRET);
        cluster.add_secret("isilon", TOKENS_SECRET);
        let csm = sample_csm("powerscale", AUTH_AND_RESILIENCY);

        let report = engine.reconcile(&csm, &CancellationToken::new()).await.unwrap();
        assert!(report.is_success(), "{:?}", report.failures());
        assert_eq!(report.driver.objects, 2);

        let deployment = controller(&cluster, "isilon");
        let names = container_names(&deployment);
        assert!(names.contains(&"karavi-authorization-proxy".to_string()));
        assert!(names.contains(&"podmon".to_string()));
        assert_eq!(
            deployment
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(INJECTED_ANNOTATION))
                .map(String::as_str),
            Some("true")
        );
        let volumes = deployment.pod_spec().unwrap().volumes.clone().unwrap_or_default();
        assert!(volumes.iter().all(|v| v.name != ROOT_CERTIFICATE));
        assert_eq!(metrics.module_count(ModuleType::Authorization, "applied"), 1);
    }

    #[tokio::test]
    async fn test_failed_precheck_gates_only_its_module() {
        let (engine, cluster, metrics, _dir) = engine();
        let csm = sample_csm("powerscale", AUTH_AND_RESILIENCY);

        let report = engine.reconcile(&csm, &CancellationToken::new()).await.unwrap();
        let auth = report.module(ModuleType::Authorization).unwrap();
        assert_eq!(auth.state, ModuleState::Failed);
        assert!(auth.message.as_deref().unwrap().contains(CONFIG_SECRET));
        assert_eq!(report.module(ModuleType::Resiliency).unwrap().state, ModuleState::Applied);
        assert!(!report.is_success());
        assert_eq!(metrics.module_count(ModuleType::Authorization, "failed"), 1);

        let names = container_names(&controller(&cluster, "isilon"));
        assert!(!names.contains(&"karavi-authorization-proxy".to_string()));
        assert!(names.contains(&"podmon".to_string()));

        let status = report.to_status();
        assert_eq!(status.state, CsmState::Failed);
        assert_eq!(status.modules.len(), 2);
        assert!(status.last_reconcile_time.is_some());
    }

    #[tokio::test]
    async fn test_powermax_minimal_manifest_gets_reverse_proxy() {
        let (engine, cluster, _metrics, _dir) = engine();
        cluster.add_secret("powermax", "csirevproxy-tls-secret");
        cluster.add_config_map("powermax", "powermax-reverseproxy-config");
        let csm = sample_csm("powermax", "");

        let report = engine.reconcile(&csm, &CancellationToken::new()).await.unwrap();
        assert!(report.is_success(), "{:?}", report.failures());
        assert_eq!(report.module(ModuleType::ReverseProxy).unwrap().state, ModuleState::Applied);

        let names = container_names(&controller(&cluster, "powermax"));
        assert!(names.contains(&"csipowermax-reverseproxy".to_string()));
    }

    #[tokio::test]
    async fn test_disabling_module_removes_its_objects() {
        let (engine, cluster, _metrics, _dir) = engine();
        let mut csm = sample_csm("powerscale", REPLICATION);

        let report = engine.reconcile(&csm, &CancellationToken::new()).await.unwrap();
        assert!(report.is_success(), "{:?}", report.failures());
        assert!(cluster.contains(MANAGER));
        assert!(container_names(&controller(&cluster, "isilon")).contains(&"dell-csi-replicator".to_string()));

        csm.spec.modules[0].enabled = false;
        let report = engine.reconcile(&csm, &CancellationToken::new()).await.unwrap();
        let replication = report.module(ModuleType::Replication).unwrap();
        assert_eq!(replication.state, ModuleState::Removed);
        assert!(replication.objects > 0);
        assert!(!cluster.contains(MANAGER));
        assert!(!container_names(&controller(&cluster, "isilon")).contains(&"dell-csi-replicator".to_string()));
    }

    #[tokio::test]
    async fn test_uninstall_removes_everything() {
        let (engine, cluster, _metrics, _dir) = engine();
        let mut csm = sample_csm("powerscale", REPLICATION);
        engine.reconcile(&csm, &CancellationToken::new()).await.unwrap();
        assert!(!cluster.is_empty());

        csm.metadata.deletion_timestamp = Some(Time(Utc::now()));
        let report = engine.reconcile(&csm, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.mode, ReconcileMode::Uninstall);
        assert!(report.is_success(), "{:?}", report.failures());
        assert!(cluster.is_empty());

        // Nothing left to delete is not an error
        let report = engine.reconcile(&csm, &CancellationToken::new()).await.unwrap();
        assert!(report.is_success());
        assert_eq!(report.driver.objects, 0);
    }

    #[tokio::test]
    async fn test_unresolvable_module_is_removed_without_error() {
        let (engine, cluster, _metrics, _dir) = engine();
        let mut csm = sample_csm(
            "powerscale",
            "- name: replication\n  enabled: false\n  configVersion: v100000.0.0\n",
        );

        let report = engine.reconcile(&csm, &CancellationToken::new()).await.unwrap();
        assert!(report.is_success(), "{:?}", report.failures());
        let replication = report.module(ModuleType::Replication).unwrap();
        assert_eq!(replication.state, ModuleState::Removed);
        assert_eq!(replication.objects, 0);

        csm.metadata.deletion_timestamp = Some(Time(Utc::now()));
        let report = engine.reconcile(&csm, &CancellationToken::new()).await.unwrap();
        assert!(report.is_success(), "{:?}", report.failures());
        assert!(cluster.is_empty());
    }

    #[tokio::test]
    async fn test_lookup_error_fails_module() {
        let (engine, cluster, _metrics, _dir) = engine();
        cluster.fail_lookups("secrets is forbidden");
        let csm = sample_csm("powerscale", AUTH_AND_RESILIENCY);

        let report = engine.reconcile(&csm, &CancellationToken::new()).await.unwrap();
        let auth = report.module(ModuleType::Authorization).unwrap();
        assert_eq!(auth.state, ModuleState::Failed);
        assert!(auth.message.as_deref().unwrap().contains("forbidden"));
        assert!(!container_names(&controller(&cluster, "isilon"))
            .contains(&"karavi-authorization-proxy".to_string()));
    }

    #[tokio::test]
    async fn test_driver_failure_recorded() {
        let (engine, cluster, _metrics, _dir) = engine();
        cluster.fail_object("DaemonSet/isilon/isilon-node", "admission denied");
        let csm = sample_csm("powerscale", "");

        let report = engine.reconcile(&csm, &CancellationToken::new()).await.unwrap();
        assert!(report.driver.error.as_deref().unwrap().contains("admission denied"));
        assert_eq!(report.to_status().state, CsmState::Failed);
    }

    #[tokio::test]
    async fn test_missing_driver_templates_fail_pass() {
        let (engine, _cluster, _metrics, _dir) = engine();
        let mut csm = sample_csm("powerscale", "");
        csm.spec.driver.config_version = "v9.9.9".to_string();
        assert_matches!(
            engine.reconcile(&csm, &CancellationToken::new()).await,
            Err(Error::TemplateRead { .. })
        );
    }

    #[tokio::test]
    async fn test_cancelled_pass() {
        let (engine, cluster, _metrics, _dir) = engine();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let csm = sample_csm("powerscale", REPLICATION);
        assert_matches!(engine.reconcile(&csm, &cancel).await, Err(Error::Cancelled));
        assert!(cluster.is_empty());
    }
}
