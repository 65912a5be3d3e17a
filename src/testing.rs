//! Shared test fixtures
//!
//! Copies the shipped `operatorconfig/` template store into a temporary
//! directory so tests can add or break files without touching the tree.

use crate::config::OperatorConfig;
use crate::controlplane::memory::InMemoryCluster;
use crate::crd::{ContainerStorageModule, Module, ModuleType};
use crate::modules::template::{
    FlatSubstituter, Substitutions, TemplateRenderer, TokenSubstituter,
    TOKEN_CONFIG_PARAMS_VOLUME_MOUNT, TOKEN_IMAGE_PULL_POLICY, TOKEN_PLUGIN_IDENTIFIER,
    TOKEN_RELEASE_NAME, TOKEN_RELEASE_NAMESPACE,
};
use crate::modules::version::VersionResolver;
use crate::modules::ModuleContext;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Shipped template store
pub fn shipped_config_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("operatorconfig")
}

fn copy_tree(from: &Path, to: &Path) {
    std::fs::create_dir_all(to).unwrap();
    for entry in std::fs::read_dir(from).unwrap() {
        let entry = entry.unwrap();
        let target = to.join(entry.file_name());
        if entry.file_type().unwrap().is_dir() {
            copy_tree(&entry.path(), &target);
        } else {
            std::fs::copy(entry.path(), &target).unwrap();
        }
    }
}

/// Writable copy of the template store and a config rooted at it
pub fn fixture_config() -> (OperatorConfig, TempDir) {
    let dir = TempDir::new().unwrap();
    copy_tree(&shipped_config_dir(), dir.path());
    (OperatorConfig::with_config_directory(dir.path()), dir)
}

/// Custom resource for a driver alias. The name and namespace are the
/// driver's plugin identifier; `modules` is a YAML list of module entries.
pub fn sample_csm(driver: &str, modules: &str) -> ContainerStorageModule {
    let name = match driver {
        "powerscale" | "isilon" => "isilon",
        "powerflex" | "vxflexos" => "vxflexos",
        other => other,
    };
    let manifest = format!(
        "apiVersion: storage.dell.com/v1\n\
         kind: ContainerStorageModule\n\
         metadata:\n  name: {name}\n  namespace: {name}\n\
         spec:\n  driver:\n    csiDriverType: {driver}\n    configVersion: v2.13.0\n"
    );
    let mut csm: ContainerStorageModule = serde_yaml::from_str(&manifest).unwrap();
    if !modules.trim().is_empty() {
        csm.spec.modules = serde_yaml::from_str::<Vec<Module>>(modules).unwrap();
    }
    csm
}

fn driver_template(file: &str) -> String {
    let text = std::fs::read_to_string(
        shipped_config_dir()
            .join("driverconfig/powerscale/v2.13.0")
            .join(file),
    )
    .unwrap();
    let mut subs = Substitutions::new();
    subs.set(TOKEN_RELEASE_NAME, "isilon")
        .set(TOKEN_RELEASE_NAMESPACE, "isilon")
        .set(TOKEN_IMAGE_PULL_POLICY, "IfNotPresent")
        .set(TOKEN_PLUGIN_IDENTIFIER, "isilon")
        .set(TOKEN_CONFIG_PARAMS_VOLUME_MOUNT, "csi-isilon-config-params")
        .set("<DriverDefaultReplicas>", "2");
    FlatSubstituter.substitute(&text, &subs)
}

/// PowerScale controller Deployment as rendered from the shipped template
pub fn sample_deployment() -> Deployment {
    serde_yaml::from_str(&driver_template("controller.yaml")).unwrap()
}

/// PowerScale node DaemonSet as rendered from the shipped template
pub fn sample_daemonset() -> DaemonSet {
    serde_yaml::from_str(&driver_template("node.yaml")).unwrap()
}

/// Resolver, renderer and in-memory cluster over a fixture store
pub struct Fixture {
    pub config: OperatorConfig,
    pub resolver: VersionResolver,
    pub renderer: TemplateRenderer,
    pub cluster: InMemoryCluster,
    _dir: TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        let (config, dir) = fixture_config();
        Self {
            resolver: VersionResolver::new(&config),
            renderer: TemplateRenderer::new(&config),
            cluster: InMemoryCluster::new(),
            config,
            _dir: dir,
        }
    }

    pub fn context<'a>(&'a self, cr: &'a ContainerStorageModule, module: &'a Module) -> ModuleContext<'a> {
        ModuleContext {
            cr,
            module,
            config: &self.config,
            resolver: &self.resolver,
            renderer: &self.renderer,
            lookup: &self.cluster,
        }
    }
}

/// First module entry of a given type, panicking if absent
pub fn module_of(cr: &ContainerStorageModule, module: ModuleType) -> &Module {
    cr.module(module).unwrap()
}
