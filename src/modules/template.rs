//! Template Renderer
//!
//! Loads versioned template artifacts from
//! `moduleconfig/<module>/<version>/<artifact>`, replaces angle-bracket
//! tokens in order and deserializes the result into typed objects.
//!
//! Substitution is flat literal replacement. Token names of different
//! modules never overlap, so replacement order only matters within a
//! single substitution set.

use crate::config::OperatorConfig;
use crate::crd::{Component, ContainerStorageModule};
use crate::domain::objects::RenderedObject;
use crate::error::{Error, Result};
use crate::modules::inject::{set_container_image, PodWorkload};
use crate::modules::registry::SupportedDriver;
use crate::modules::version::VersionSpec;
use indexmap::IndexMap;
use k8s_openapi::api::core::v1::Container;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

// =============================================================================
// Common Tokens
// =============================================================================

pub const TOKEN_RELEASE_NAME: &str = "<DriverDefaultReleaseName>";
pub const TOKEN_RELEASE_NAMESPACE: &str = "<DriverDefaultReleaseNamespace>";
pub const TOKEN_IMAGE_PULL_POLICY: &str = "<DriverDefaultImagePullPolicy>";
pub const TOKEN_PLUGIN_IDENTIFIER: &str = "<DriverPluginIdentifier>";
pub const TOKEN_CONFIG_PARAMS_VOLUME_MOUNT: &str = "<DriverConfigParamsVolumeMount>";

pub const DEFAULT_IMAGE_PULL_POLICY: &str = "IfNotPresent";

// =============================================================================
// Substitutions
// =============================================================================

/// Ordered token -> value replacements
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Substitutions {
    entries: IndexMap<String, String>,
}

impl Substitutions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tokens every artifact may reference: release name and namespace,
    /// pull policy and, when the driver is supported, its plugin parameters
    pub fn common(cr: &ContainerStorageModule, driver: Option<SupportedDriver>) -> Self {
        let pull_policy = cr
            .spec
            .driver
            .common
            .image_pull_policy
            .clone()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| DEFAULT_IMAGE_PULL_POLICY.to_string());

        let mut subs = Self::new();
        subs.set(TOKEN_RELEASE_NAME, cr.name())
            .set(TOKEN_RELEASE_NAMESPACE, cr.namespace())
            .set(TOKEN_IMAGE_PULL_POLICY, pull_policy);

        if let Some(driver) = driver {
            subs.set(TOKEN_PLUGIN_IDENTIFIER, driver.plugin_identifier)
                .set(
                    TOKEN_CONFIG_PARAMS_VOLUME_MOUNT,
                    driver.config_params_volume_mount,
                );
        }

        subs
    }

    /// Set a token, replacing any earlier value but keeping its position
    pub fn set(&mut self, token: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.entries.insert(token.into(), value.into());
        self
    }

    /// Set a token from a component env var, falling back to `default`
    /// when the component or the variable is absent
    pub fn from_env(
        &mut self,
        component: Option<&Component>,
        token: impl Into<String>,
        env_name: &str,
        default: impl Into<String>,
    ) -> &mut Self {
        let value = component
            .and_then(|c| c.env(env_name))
            .map(str::to_string)
            .unwrap_or_else(|| default.into());
        self.set(token, value)
    }

    pub fn get(&self, token: &str) -> Option<&str> {
        self.entries.get(token).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// =============================================================================
// Token Substituter
// =============================================================================

/// Turns template text plus substitutions into manifest text
pub trait TokenSubstituter: Send + Sync {
    fn substitute(&self, template: &str, substitutions: &Substitutions) -> String;
}

/// Literal, ordered find-and-replace of every token
#[derive(Debug, Clone, Copy, Default)]
pub struct FlatSubstituter;

impl TokenSubstituter for FlatSubstituter {
    fn substitute(&self, template: &str, substitutions: &Substitutions) -> String {
        substitutions
            .iter()
            .fold(template.to_string(), |text, (token, value)| {
                text.replace(token, value)
            })
    }
}

// =============================================================================
// Template Renderer
// =============================================================================

/// Renders module artifacts from the template store
#[derive(Clone)]
pub struct TemplateRenderer {
    module_root: PathBuf,
    substituter: Arc<dyn TokenSubstituter>,
}

impl std::fmt::Debug for TemplateRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateRenderer")
            .field("module_root", &self.module_root)
            .finish()
    }
}

impl TemplateRenderer {
    pub fn new(config: &OperatorConfig) -> Self {
        Self::with_substituter(config, Arc::new(FlatSubstituter))
    }

    pub fn with_substituter(config: &OperatorConfig, substituter: Arc<dyn TokenSubstituter>) -> Self {
        Self {
            module_root: config.module_config_root(),
            substituter,
        }
    }

    pub fn artifact_path(&self, spec: &VersionSpec, artifact: &str) -> PathBuf {
        self.module_root
            .join(spec.module.as_str())
            .join(&spec.version)
            .join(artifact)
    }

    /// Read and substitute an artifact of a module version
    pub fn render(
        &self,
        spec: &VersionSpec,
        artifact: &str,
        substitutions: &Substitutions,
    ) -> Result<String> {
        let path = self.artifact_path(spec, artifact);
        debug!("Rendering {} {} {}", spec.module, spec.version, artifact);
        self.render_file(&path, substitutions)
    }

    /// Read and substitute an arbitrary template file
    pub fn render_file(&self, path: &Path, substitutions: &Substitutions) -> Result<String> {
        let template = std::fs::read_to_string(path).map_err(|source| Error::TemplateRead {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(self.substituter.substitute(&template, substitutions))
    }

    /// Render an artifact into a single typed value
    pub fn render_as<T: DeserializeOwned>(
        &self,
        spec: &VersionSpec,
        artifact: &str,
        substitutions: &Substitutions,
    ) -> Result<T> {
        let text = self.render(spec, artifact, substitutions)?;
        parse_as(&text, spec.module.as_str(), artifact)
    }

    /// Render a multi-document artifact into rendered objects
    pub fn render_objects(
        &self,
        spec: &VersionSpec,
        artifact: &str,
        substitutions: &Substitutions,
    ) -> Result<Vec<RenderedObject>> {
        let text = self.render(spec, artifact, substitutions)?;
        RenderedObject::parse_manifest(&text).map_err(|e| Error::Render {
            module: spec.module.to_string(),
            artifact: artifact.to_string(),
            reason: e.to_string(),
        })
    }

    /// Render a sidecar container and apply the component's image override
    pub fn render_container(
        &self,
        spec: &VersionSpec,
        artifact: &str,
        substitutions: &Substitutions,
        component: &str,
    ) -> Result<Container> {
        let mut container: Container = self.render_as(spec, artifact, substitutions)?;
        if let Some(image) = spec.image_for(component) {
            container.image = Some(image.to_string());
        }
        Ok(container)
    }
}

/// Replace the image of `container` in every pod workload of `objects` when
/// the custom resource overrides the component's image
pub fn apply_image_override(
    objects: &mut [RenderedObject],
    spec: &VersionSpec,
    component: &str,
    container: &str,
) {
    let Some(image) = spec.image_for(component) else {
        return;
    };
    for object in objects.iter_mut() {
        let pod_spec = match object {
            RenderedObject::Deployment(o) => o.pod_spec_mut(),
            RenderedObject::DaemonSet(o) => o.pod_spec_mut(),
            RenderedObject::StatefulSet(o) => o.pod_spec_mut(),
            _ => None,
        };
        if let Some(pod_spec) = pod_spec {
            set_container_image(pod_spec, container, image);
        }
    }
}

/// Deserialize rendered text, reporting failures as render errors
pub fn parse_as<T: DeserializeOwned>(text: &str, module: &str, artifact: &str) -> Result<T> {
    serde_yaml::from_str(text).map_err(|e| Error::Render {
        module: module.to_string(),
        artifact: artifact.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{EnvVar, ModuleType};
    use crate::modules::registry::POWERSCALE;
    use crate::testing::{fixture_config, sample_csm};
    use assert_matches::assert_matches;
    use k8s_openapi::api::core::v1::Volume;

    #[test]
    fn test_flat_substitution_replaces_every_occurrence() {
        let mut subs = Substitutions::new();
        subs.set("<A>", "alpha").set("<B>", "beta");
        let out = FlatSubstituter.substitute("<A>-<B>-<A>-<C>", &subs);
        assert_eq!(out, "alpha-beta-alpha-<C>");
    }

    #[test]
    fn test_substitutions_keep_insertion_order() {
        let mut subs = Substitutions::new();
        subs.set("<Z>", "1").set("<A>", "2").set("<Z>", "3");
        let tokens: Vec<_> = subs.iter().collect();
        assert_eq!(tokens, vec![("<Z>", "3"), ("<A>", "2")]);
    }

    #[test]
    fn test_env_override_beats_default() {
        let component = Component {
            name: "karavi-authorization-proxy".into(),
            envs: vec![EnvVar::new("PROXY_HOST", "auth.example.com")],
            ..Default::default()
        };
        let mut subs = Substitutions::new();
        subs.from_env(Some(&component), "<HOST>", "PROXY_HOST", "csm-authorization.com")
            .from_env(Some(&component), "<PORT>", "PROXY_PORT", "443")
            .from_env(None, "<OTHER>", "PROXY_HOST", "fallback");
        assert_eq!(subs.get("<HOST>"), Some("auth.example.com"));
        assert_eq!(subs.get("<PORT>"), Some("443"));
        assert_eq!(subs.get("<OTHER>"), Some("fallback"));
    }

    #[test]
    fn test_empty_env_value_still_wins() {
        let component = Component {
            name: "c".into(),
            envs: vec![EnvVar::new("LOG_LEVEL", "")],
            ..Default::default()
        };
        let mut subs = Substitutions::new();
        subs.from_env(Some(&component), "<LOG>", "LOG_LEVEL", "INFO");
        assert_eq!(subs.get("<LOG>"), Some(""));
    }

    #[test]
    fn test_common_substitutions() {
        let csm = sample_csm("powerscale", "");
        let subs = Substitutions::common(&csm, Some(POWERSCALE));
        assert_eq!(subs.get(TOKEN_RELEASE_NAME), Some("isilon"));
        assert_eq!(subs.get(TOKEN_RELEASE_NAMESPACE), Some("isilon"));
        assert_eq!(subs.get(TOKEN_IMAGE_PULL_POLICY), Some("IfNotPresent"));
        assert_eq!(subs.get(TOKEN_PLUGIN_IDENTIFIER), Some("isilon"));

        let subs = Substitutions::common(&csm, None);
        assert_eq!(subs.get(TOKEN_PLUGIN_IDENTIFIER), None);
    }

    #[test]
    fn test_render_is_deterministic() {
        let (config, _dir) = fixture_config();
        let renderer = TemplateRenderer::new(&config);
        let spec = VersionSpec::new(ModuleType::Observability, "v1.12.0");
        let csm = sample_csm("powerscale", "");
        let subs = Substitutions::common(&csm, Some(POWERSCALE));

        let first = renderer.render_objects(&spec, "karavi-topology.yaml", &subs).unwrap();
        let second = renderer.render_objects(&spec, "karavi-topology.yaml", &subs).unwrap();
        let first: Vec<String> = first.iter().map(|o| o.to_yaml().unwrap()).collect();
        let second: Vec<String> = second.iter().map(|o| o.to_yaml().unwrap()).collect();
        assert!(!first.is_empty());
        assert_eq!(first, second);
    }

    #[test]
    fn test_render_volumes() {
        let (config, _dir) = fixture_config();
        let renderer = TemplateRenderer::new(&config);
        let spec = VersionSpec::new(ModuleType::Authorization, "v2.13.0");
        let csm = sample_csm("powerscale", "");
        let subs = Substitutions::common(&csm, Some(POWERSCALE));

        let volumes: Vec<Volume> = renderer.render_as(&spec, "volumes.yaml", &subs).unwrap();
        assert!(volumes
            .iter()
            .any(|v| v.name == "proxy-server-root-certificate"));
    }

    #[test]
    fn test_container_image_override() {
        let (config, _dir) = fixture_config();
        let renderer = TemplateRenderer::new(&config);
        let mut spec = VersionSpec::new(ModuleType::Authorization, "v2.13.0");
        spec.image_overrides.insert(
            "karavi-authorization-proxy".into(),
            "mirror.local/sidecar:dev".into(),
        );
        let csm = sample_csm("powerscale", "");
        let subs = Substitutions::common(&csm, Some(POWERSCALE));

        let container = renderer
            .render_container(&spec, "container.yaml", &subs, "karavi-authorization-proxy")
            .unwrap();
        assert_eq!(container.image.as_deref(), Some("mirror.local/sidecar:dev"));
    }

    #[test]
    fn test_image_override_on_rendered_objects() {
        let (config, _dir) = fixture_config();
        let renderer = TemplateRenderer::new(&config);
        let mut spec = VersionSpec::new(ModuleType::Observability, "v1.12.0");
        let csm = sample_csm("powerscale", "");
        let subs = Substitutions::common(&csm, Some(POWERSCALE));
        let mut objects = renderer.render_objects(&spec, "karavi-topology.yaml", &subs).unwrap();

        spec.image_overrides.insert("topology".into(), "mirror.local/topology:dev".into());
        apply_image_override(&mut objects, &spec, "topology", "karavi-topology");

        let image = objects
            .iter()
            .find_map(|o| match o {
                RenderedObject::Deployment(d) => Some(d.pod_spec()?.containers[0].image.clone()),
                _ => None,
            })
            .flatten();
        assert_eq!(image.as_deref(), Some("mirror.local/topology:dev"));
    }

    #[test]
    fn test_missing_artifact_is_read_error() {
        let (config, _dir) = fixture_config();
        let renderer = TemplateRenderer::new(&config);
        let spec = VersionSpec::new(ModuleType::Authorization, "v2.13.0");
        let err = renderer
            .render(&spec, "does-not-exist.yaml", &Substitutions::new())
            .unwrap_err();
        assert_matches!(err, Error::TemplateRead { .. });
    }

    #[test]
    fn test_malformed_render_is_render_error() {
        let (config, dir) = fixture_config();
        std::fs::write(
            dir.path()
                .join("moduleconfig/authorization/v2.13.0/broken.yaml"),
            "name: [unterminated\n",
        )
        .unwrap();
        let renderer = TemplateRenderer::new(&config);
        let spec = VersionSpec::new(ModuleType::Authorization, "v2.13.0");
        let err = renderer
            .render_as::<Container>(&spec, "broken.yaml", &Substitutions::new())
            .unwrap_err();
        assert_matches!(err, Error::Render { ref artifact, .. } if artifact == "broken.yaml");
    }

    #[test]
    fn test_custom_substituter() {
        struct Upper;
        impl TokenSubstituter for Upper {
            fn substitute(&self, template: &str, _: &Substitutions) -> String {
                template.to_uppercase()
            }
        }

        let (config, dir) = fixture_config();
        let path = dir.path().join("plain.txt");
        std::fs::write(&path, "abc").unwrap();
        let renderer = TemplateRenderer::with_substituter(&config, Arc::new(Upper));
        assert_eq!(renderer.render_file(&path, &Substitutions::new()).unwrap(), "ABC");
    }
}
