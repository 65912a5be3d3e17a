//! Rendered Objects
//!
//! Typed control-plane objects produced by template rendering. A rendered
//! object carries no provenance beyond its own kind and name.

use crate::error::{Error, Result};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret, Service, ServiceAccount};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::DynamicObject;
use kube::core::GroupVersionKind;
use serde::Serialize;

/// Kinds that live outside any namespace
const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "Namespace",
    "CustomResourceDefinition",
    "ClusterRole",
    "ClusterRoleBinding",
    "ClusterIssuer",
    "StorageClass",
    "CSIDriver",
];

// =============================================================================
// Rendered Object
// =============================================================================

/// A typed object ready to be applied or deleted
#[derive(Debug, Clone)]
pub enum RenderedObject {
    Namespace(Namespace),
    CustomResourceDefinition(CustomResourceDefinition),
    ServiceAccount(ServiceAccount),
    ClusterRole(ClusterRole),
    ClusterRoleBinding(ClusterRoleBinding),
    Role(Role),
    RoleBinding(RoleBinding),
    ConfigMap(ConfigMap),
    Secret(Secret),
    Service(Service),
    Ingress(Ingress),
    Deployment(Deployment),
    DaemonSet(DaemonSet),
    StatefulSet(StatefulSet),
    /// Any kind without a typed representation (cert-manager issuers, ...)
    Dynamic(DynamicObject),
}

macro_rules! dispatch {
    ($self:expr, $obj:ident => $typed:expr, $dynobj:ident => $dynamic:expr) => {
        match $self {
            RenderedObject::Namespace($obj) => $typed,
            RenderedObject::CustomResourceDefinition($obj) => $typed,
            RenderedObject::ServiceAccount($obj) => $typed,
            RenderedObject::ClusterRole($obj) => $typed,
            RenderedObject::ClusterRoleBinding($obj) => $typed,
            RenderedObject::Role($obj) => $typed,
            RenderedObject::RoleBinding($obj) => $typed,
            RenderedObject::ConfigMap($obj) => $typed,
            RenderedObject::Secret($obj) => $typed,
            RenderedObject::Service($obj) => $typed,
            RenderedObject::Ingress($obj) => $typed,
            RenderedObject::Deployment($obj) => $typed,
            RenderedObject::DaemonSet($obj) => $typed,
            RenderedObject::StatefulSet($obj) => $typed,
            RenderedObject::Dynamic($dynobj) => $dynamic,
        }
    };
}

fn kind_of<T: k8s_openapi::Resource>(_: &T) -> &'static str {
    T::KIND
}

fn api_version_of<T: k8s_openapi::Resource>(_: &T) -> &'static str {
    T::API_VERSION
}

impl RenderedObject {
    /// Parse one YAML document, dispatching on its `kind`
    pub fn from_document(doc: &str) -> Result<Self> {
        let value: serde_yaml::Value = serde_yaml::from_str(doc)?;
        let kind = value
            .get("kind")
            .and_then(|k| k.as_str())
            .ok_or_else(|| Error::Internal("document has no kind".to_string()))?
            .to_string();

        let object = match kind.as_str() {
            "Namespace" => RenderedObject::Namespace(serde_yaml::from_value(value)?),
            "CustomResourceDefinition" => {
                RenderedObject::CustomResourceDefinition(serde_yaml::from_value(value)?)
            }
            "ServiceAccount" => RenderedObject::ServiceAccount(serde_yaml::from_value(value)?),
            "ClusterRole" => RenderedObject::ClusterRole(serde_yaml::from_value(value)?),
            "ClusterRoleBinding" => {
                RenderedObject::ClusterRoleBinding(serde_yaml::from_value(value)?)
            }
            "Role" => RenderedObject::Role(serde_yaml::from_value(value)?),
            "RoleBinding" => RenderedObject::RoleBinding(serde_yaml::from_value(value)?),
            "ConfigMap" => RenderedObject::ConfigMap(serde_yaml::from_value(value)?),
            "Secret" => RenderedObject::Secret(serde_yaml::from_value(value)?),
            "Service" => RenderedObject::Service(serde_yaml::from_value(value)?),
            "Ingress" => RenderedObject::Ingress(serde_yaml::from_value(value)?),
            "Deployment" => RenderedObject::Deployment(serde_yaml::from_value(value)?),
            "DaemonSet" => RenderedObject::DaemonSet(serde_yaml::from_value(value)?),
            "StatefulSet" => RenderedObject::StatefulSet(serde_yaml::from_value(value)?),
            _ => RenderedObject::Dynamic(serde_yaml::from_value(value)?),
        };

        Ok(object)
    }

    /// Parse a multi-document manifest. Empty and comment-only documents
    /// are skipped.
    pub fn parse_manifest(manifest: &str) -> Result<Vec<Self>> {
        split_documents(manifest)
            .into_iter()
            .map(|doc| Self::from_document(&doc))
            .collect()
    }

    pub fn kind(&self) -> &str {
        dispatch!(self, o => kind_of(o), d => d
            .types
            .as_ref()
            .map(|t| t.kind.as_str())
            .unwrap_or_default())
    }

    pub fn api_version(&self) -> &str {
        dispatch!(self, o => api_version_of(o), d => d
            .types
            .as_ref()
            .map(|t| t.api_version.as_str())
            .unwrap_or("v1"))
    }

    pub fn metadata(&self) -> &ObjectMeta {
        dispatch!(self, o => &o.metadata, d => &d.metadata)
    }

    pub fn metadata_mut(&mut self) -> &mut ObjectMeta {
        dispatch!(self, o => &mut o.metadata, d => &mut d.metadata)
    }

    pub fn name(&self) -> &str {
        self.metadata().name.as_deref().unwrap_or("unnamed")
    }

    pub fn namespace(&self) -> Option<&str> {
        self.metadata().namespace.as_deref()
    }

    pub fn is_cluster_scoped(&self) -> bool {
        CLUSTER_SCOPED_KINDS.contains(&self.kind())
    }

    /// Fill in the namespace of a namespaced object that has none
    pub fn ensure_namespace(&mut self, namespace: &str) {
        if !self.is_cluster_scoped() && self.metadata().namespace.is_none() {
            self.metadata_mut().namespace = Some(namespace.to_string());
        }
    }

    /// Kind/namespace/name label for logs and errors
    pub fn display_name(&self) -> String {
        match self.namespace() {
            Some(ns) if !self.is_cluster_scoped() => {
                format!("{}/{}/{}", self.kind(), ns, self.name())
            }
            _ => format!("{}/{}", self.kind(), self.name()),
        }
    }

    pub fn gvk(&self) -> GroupVersionKind {
        let (group, version) = match self.api_version().split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", self.api_version()),
        };
        GroupVersionKind::gvk(group, version, self.kind())
    }

    /// Convert into an untyped object for the dynamic API
    pub fn to_dynamic(&self) -> Result<DynamicObject> {
        let value = dispatch!(self, o => to_json(o)?, d => to_json(d)?);
        Ok(serde_json::from_value(value)?)
    }

    pub fn to_yaml(&self) -> Result<String> {
        let text = dispatch!(self, o => serde_yaml::to_string(o)?, d => serde_yaml::to_string(d)?);
        Ok(text)
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<serde_json::Value> {
    Ok(serde_json::to_value(value)?)
}

/// Split a manifest on `---` separator lines
pub fn split_documents(manifest: &str) -> Vec<String> {
    let mut documents = Vec::new();
    let mut current = String::new();

    for line in manifest.lines() {
        if line.trim_end() == "---" || line.starts_with("--- ") {
            documents.push(std::mem::take(&mut current));
            continue;
        }
        current.push_str(line);
        current.push('\n');
    }
    documents.push(current);

    documents
        .into_iter()
        .filter(|doc| {
            !doc.lines()
                .all(|l| l.trim().is_empty() || l.trim_start().starts_with('#'))
        })
        .collect()
}
