//! Workload Injector
//!
//! Merges module sidecars, volumes, environment and annotations into
//! already-rendered driver workloads.
//!
//! The injector does not check for an earlier injection. Callers re-derive
//! workloads from freshly rendered templates on every pass, so appending is
//! always applied to a clean workload.

use crate::error::{Error, Result};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Container, EnvVar, PodSpec, PodTemplateSpec, Volume, VolumeMount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

/// Reserved name of the principal driver container
pub const DRIVER_CONTAINER: &str = "driver";

// =============================================================================
// Pod Workload
// =============================================================================

/// Anything carrying a pod template the injector can mutate
pub trait PodWorkload {
    /// Kind/name label for errors
    fn workload_name(&self) -> String;

    fn workload_metadata_mut(&mut self) -> &mut ObjectMeta;

    fn pod_spec(&self) -> Option<&PodSpec>;

    fn pod_spec_mut(&mut self) -> Option<&mut PodSpec>;
}

fn label(kind: &str, meta: &ObjectMeta) -> String {
    format!("{}/{}", kind, meta.name.as_deref().unwrap_or("unnamed"))
}

impl PodWorkload for Deployment {
    fn workload_name(&self) -> String {
        label("Deployment", &self.metadata)
    }

    fn workload_metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn pod_spec(&self) -> Option<&PodSpec> {
        self.spec.as_ref()?.template.spec.as_ref()
    }

    fn pod_spec_mut(&mut self) -> Option<&mut PodSpec> {
        self.spec.as_mut()?.template.spec.as_mut()
    }
}

impl PodWorkload for DaemonSet {
    fn workload_name(&self) -> String {
        label("DaemonSet", &self.metadata)
    }

    fn workload_metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn pod_spec(&self) -> Option<&PodSpec> {
        self.spec.as_ref()?.template.spec.as_ref()
    }

    fn pod_spec_mut(&mut self) -> Option<&mut PodSpec> {
        self.spec.as_mut()?.template.spec.as_mut()
    }
}

impl PodWorkload for StatefulSet {
    fn workload_name(&self) -> String {
        label("StatefulSet", &self.metadata)
    }

    fn workload_metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn pod_spec(&self) -> Option<&PodSpec> {
        self.spec.as_ref()?.template.spec.as_ref()
    }

    fn pod_spec_mut(&mut self) -> Option<&mut PodSpec> {
        self.spec.as_mut()?.template.spec.as_mut()
    }
}

impl PodWorkload for PodTemplateSpec {
    fn workload_name(&self) -> String {
        match &self.metadata {
            Some(meta) => label("PodTemplate", meta),
            None => "PodTemplate/unnamed".to_string(),
        }
    }

    fn workload_metadata_mut(&mut self) -> &mut ObjectMeta {
        self.metadata.get_or_insert_with(ObjectMeta::default)
    }

    fn pod_spec(&self) -> Option<&PodSpec> {
        self.spec.as_ref()
    }

    fn pod_spec_mut(&mut self) -> Option<&mut PodSpec> {
        self.spec.as_mut()
    }
}

/// Pod spec of a workload, or an `Inject` error if it has none
pub fn require_pod_spec<W: PodWorkload + ?Sized>(workload: &mut W) -> Result<&mut PodSpec> {
    let name = workload.workload_name();
    workload.pod_spec_mut().ok_or_else(|| Error::Inject {
        workload: name,
        reason: "workload has no pod template spec".to_string(),
    })
}

// =============================================================================
// Primitive Operations
// =============================================================================

/// Append a container; it becomes the last entry
pub fn append_container<W: PodWorkload + ?Sized>(workload: &mut W, container: Container) -> Result<()> {
    require_pod_spec(workload)?.containers.push(container);
    Ok(())
}

/// Append volumes to the pod volume list
pub fn append_volumes<W: PodWorkload + ?Sized>(workload: &mut W, volumes: Vec<Volume>) -> Result<()> {
    if volumes.is_empty() {
        return Ok(());
    }
    require_pod_spec(workload)?
        .volumes
        .get_or_insert_with(Vec::new)
        .extend(volumes);
    Ok(())
}

/// Remove every element whose name matches, returning how many were removed.
///
/// Each match is swapped with the last element and the vector truncated, so
/// the relative order of the remaining elements is NOT preserved.
pub fn remove_named<T>(items: &mut Vec<T>, name: &str, name_of: impl Fn(&T) -> &str) -> usize {
    let mut removed = 0;
    let mut i = 0;
    while i < items.len() {
        if name_of(&items[i]) == name {
            items.swap_remove(i);
            removed += 1;
        } else {
            i += 1;
        }
    }
    removed
}

/// Overlay user-declared volumes on rendered ones. A volume replaces the
/// rendered volume of the same name; the rest are appended.
pub fn overlay_volumes(volumes: &mut Vec<Volume>, overrides: &[Volume]) {
    for volume in overrides {
        match volumes.iter_mut().find(|v| v.name == volume.name) {
            Some(existing) => *existing = volume.clone(),
            None => volumes.push(volume.clone()),
        }
    }
}

/// Remove a volume by name from a workload
pub fn remove_volume<W: PodWorkload + ?Sized>(workload: &mut W, name: &str) -> Result<usize> {
    let spec = require_pod_spec(workload)?;
    Ok(spec
        .volumes
        .as_mut()
        .map(|volumes| remove_named(volumes, name, |v: &Volume| v.name.as_str()))
        .unwrap_or(0))
}

/// Remove a volume mount by name from a container
pub fn remove_volume_mount(container: &mut Container, name: &str) -> usize {
    container
        .volume_mounts
        .as_mut()
        .map(|mounts| remove_named(mounts, name, |m: &VolumeMount| m.name.as_str()))
        .unwrap_or(0)
}

/// Append env entries to the `driver` container. Returns false, without
/// error, when the workload has no such container.
pub fn inject_driver_env<W: PodWorkload + ?Sized>(workload: &mut W, envs: &[EnvVar]) -> Result<bool> {
    let spec = require_pod_spec(workload)?;
    let Some(driver) = spec.containers.iter_mut().find(|c| c.name == DRIVER_CONTAINER) else {
        return Ok(false);
    };
    driver.env.get_or_insert_with(Vec::new).extend_from_slice(envs);
    Ok(true)
}

/// Set an annotation on the workload's own metadata
pub fn stamp_annotation<W: PodWorkload + ?Sized>(workload: &mut W, key: &str, value: &str) {
    workload
        .workload_metadata_mut()
        .annotations
        .get_or_insert_with(Default::default)
        .insert(key.to_string(), value.to_string());
}

/// Replace the image of a named container. Returns whether it was found.
pub fn set_container_image(spec: &mut PodSpec, container: &str, image: &str) -> bool {
    match spec.containers.iter_mut().find(|c| c.name == container) {
        Some(c) => {
            c.image = Some(image.to_string());
            true
        }
        None => false,
    }
}

/// Build a plain name/value env entry
pub fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

// =============================================================================
// Sidecar Payload
// =============================================================================

/// Everything one module contributes to one workload
#[derive(Debug, Clone, Default)]
pub struct SidecarPayload {
    /// Sidecar appended after the existing containers
    pub container: Option<Container>,
    pub volumes: Vec<Volume>,
    /// Env entries for the `driver` container
    pub driver_env: Vec<EnvVar>,
    pub annotations: Vec<(String, String)>,
    /// Volumes (and their mounts on the sidecar) to leave out
    pub omit_volumes: Vec<String>,
}

impl SidecarPayload {
    pub fn with_container(container: Container) -> Self {
        Self {
            container: Some(container),
            ..Default::default()
        }
    }

    pub fn env_only(driver_env: Vec<EnvVar>) -> Self {
        Self {
            driver_env,
            ..Default::default()
        }
    }

    /// Inject into a workload. The workload is mutated on a copy and only
    /// replaced once every step succeeded.
    pub fn inject_into<W: PodWorkload + Clone>(&self, workload: &mut W) -> Result<()> {
        let mut staged = workload.clone();
        self.apply(&mut staged)?;
        *workload = staged;
        Ok(())
    }

    fn apply<W: PodWorkload>(&self, workload: &mut W) -> Result<()> {
        // Fail on malformed input before touching anything
        require_pod_spec(workload)?;

        if let Some(container) = &self.container {
            let mut container = container.clone();
            for name in &self.omit_volumes {
                remove_volume_mount(&mut container, name);
            }
            append_container(workload, container)?;
        }

        let mut volumes = self.volumes.clone();
        for name in &self.omit_volumes {
            remove_named(&mut volumes, name, |v: &Volume| v.name.as_str());
        }
        append_volumes(workload, volumes)?;

        for name in &self.omit_volumes {
            remove_volume(workload, name)?;
        }

        if !self.driver_env.is_empty() {
            inject_driver_env(workload, &self.driver_env)?;
        }

        for (key, value) in &self.annotations {
            stamp_annotation(workload, key, value);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sample_daemonset, sample_deployment};
    use assert_matches::assert_matches;
    use k8s_openapi::api::core::v1::SecretVolumeSource;

    fn names<T>(items: &[T], name_of: impl Fn(&T) -> &str) -> Vec<String> {
        items.iter().map(|i| name_of(i).to_string()).collect()
    }

    fn volume(name: &str) -> Volume {
        Volume {
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn sidecar(name: &str) -> Container {
        Container {
            name: name.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_remove_named_at_any_position() {
        for position in 0..4 {
            let mut volumes: Vec<Volume> = (0..4).map(|i| volume(&format!("v{}", i))).collect();
            volumes[position].name = "root-certificate".to_string();

            let removed = remove_named(&mut volumes, "root-certificate", |v| v.name.as_str());
            assert_eq!(removed, 1);
            assert_eq!(volumes.len(), 3);
            assert!(!volumes.iter().any(|v| v.name == "root-certificate"));
        }
    }

    #[test]
    fn test_remove_named_to_empty() {
        let mut volumes = vec![volume("root-certificate")];
        remove_named(&mut volumes, "root-certificate", |v| v.name.as_str());
        assert!(volumes.is_empty());

        let mut volumes = vec![volume("a"), volume("a"), volume("b")];
        assert_eq!(remove_named(&mut volumes, "a", |v| v.name.as_str()), 2);
        assert_eq!(names(&volumes, |v| v.name.as_str()), vec!["b"]);
    }

    #[test]
    fn test_append_container_is_last() {
        let mut ds = sample_daemonset();
        let before = ds.pod_spec().unwrap().containers.len();

        append_container(&mut ds, sidecar("karavi-authorization-proxy")).unwrap();

        let containers = &ds.pod_spec().unwrap().containers;
        assert_eq!(containers.len(), before + 1);
        assert_eq!(containers.last().unwrap().name, "karavi-authorization-proxy");
    }

    #[test]
    fn test_driver_env_only_touches_driver() {
        let mut deploy = sample_deployment();
        let spec = deploy.pod_spec().unwrap();
        let driver_before = spec
            .containers
            .iter()
            .find(|c| c.name == DRIVER_CONTAINER)
            .and_then(|c| c.env.as_ref())
            .map(Vec::len)
            .unwrap_or(0);
        let others_before: Vec<usize> = spec
            .containers
            .iter()
            .filter(|c| c.name != DRIVER_CONTAINER)
            .map(|c| c.env.as_ref().map(Vec::len).unwrap_or(0))
            .collect();

        let injected = vec![env("X_CSI_PODMON_ENABLED", "true"), env("X_CSI_PODMON_API_PORT", "8083")];
        assert!(inject_driver_env(&mut deploy, &injected).unwrap());

        let spec = deploy.pod_spec().unwrap();
        let driver = spec.containers.iter().find(|c| c.name == DRIVER_CONTAINER).unwrap();
        assert_eq!(driver.env.as_ref().unwrap().len(), driver_before + injected.len());
        let others_after: Vec<usize> = spec
            .containers
            .iter()
            .filter(|c| c.name != DRIVER_CONTAINER)
            .map(|c| c.env.as_ref().map(Vec::len).unwrap_or(0))
            .collect();
        assert_eq!(others_before, others_after);
    }

    #[test]
    fn test_driver_env_without_driver_is_noop() {
        let mut template = PodTemplateSpec {
            metadata: None,
            spec: Some(PodSpec {
                containers: vec![sidecar("podmon")],
                ..Default::default()
            }),
        };
        assert!(!inject_driver_env(&mut template, &[env("A", "1")]).unwrap());
        assert!(template.spec.unwrap().containers[0].env.is_none());
    }

    #[test]
    fn test_missing_pod_spec_is_inject_error() {
        let mut deploy = Deployment::default();
        let err = append_container(&mut deploy, sidecar("x")).unwrap_err();
        assert_matches!(err, Error::Inject { .. });
    }

    #[test]
    fn test_payload_omits_volume_and_mount() {
        let mut ds = sample_daemonset();
        let volumes_before = ds.pod_spec().unwrap().volumes.as_ref().map(Vec::len).unwrap_or(0);

        let mut container = sidecar("karavi-authorization-proxy");
        container.volume_mounts = Some(vec![
            VolumeMount {
                name: "karavi-authorization-config".into(),
                mount_path: "/etc/karavi-authorization/config".into(),
                ..Default::default()
            },
            VolumeMount {
                name: "proxy-server-root-certificate".into(),
                mount_path: "/etc/karavi-authorization/root-certificates".into(),
                ..Default::default()
            },
        ]);
        let payload = SidecarPayload {
            container: Some(container),
            volumes: vec![volume("karavi-authorization-config"), volume("proxy-server-root-certificate")],
            omit_volumes: vec!["proxy-server-root-certificate".into()],
            annotations: vec![("com.dell.karavi-authorization-proxy".into(), "true".into())],
            ..Default::default()
        };
        payload.inject_into(&mut ds).unwrap();

        let spec = ds.pod_spec().unwrap();
        let volumes = spec.volumes.as_ref().unwrap();
        assert_eq!(volumes.len(), volumes_before + 1);
        assert!(!volumes.iter().any(|v| v.name == "proxy-server-root-certificate"));
        let proxy = spec.containers.last().unwrap();
        assert!(!proxy
            .volume_mounts
            .as_ref()
            .unwrap()
            .iter()
            .any(|m| m.name == "proxy-server-root-certificate"));
        assert_eq!(
            ds.metadata.annotations.as_ref().unwrap()["com.dell.karavi-authorization-proxy"],
            "true"
        );
    }

    #[test]
    fn test_overlay_volumes_replaces_by_name() {
        let mut volumes = vec![volume("karavi-authorization-config"), volume("proxy-server-root-certificate")];
        let custom = Volume {
            name: "proxy-server-root-certificate".into(),
            secret: Some(SecretVolumeSource {
                secret_name: Some("my-root-ca".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        overlay_volumes(&mut volumes, &[custom, volume("extra")]);

        assert_eq!(volumes.len(), 3);
        assert_eq!(volumes[0].name, "karavi-authorization-config");
        assert_eq!(
            volumes[1].secret.as_ref().unwrap().secret_name.as_deref(),
            Some("my-root-ca")
        );
        assert_eq!(volumes[2].name, "extra");
    }

    #[test]
    fn test_failed_injection_leaves_workload_untouched() {
        let mut deploy = Deployment {
            metadata: ObjectMeta {
                name: Some("broken".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        let payload = SidecarPayload {
            container: Some(sidecar("x")),
            annotations: vec![("k".into(), "v".into())],
            ..Default::default()
        };
        let err = payload.inject_into(&mut deploy).unwrap_err();
        assert_matches!(err, Error::Inject { ref workload, .. } if workload == "Deployment/broken");
        assert!(deploy.metadata.annotations.is_none());
    }

    #[test]
    fn test_rederived_workload_converges() {
        let payload = SidecarPayload::with_container(sidecar("podmon"));

        let mut first = sample_deployment();
        payload.inject_into(&mut first).unwrap();
        let mut second = sample_deployment();
        payload.inject_into(&mut second).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn test_set_container_image() {
        let mut deploy = sample_deployment();
        let spec = deploy.pod_spec_mut().unwrap();
        assert!(set_container_image(spec, DRIVER_CONTAINER, "registry.local/csi:dev"));
        assert!(!set_container_image(spec, "absent", "x"));
    }
}
