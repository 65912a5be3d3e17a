//! Kubernetes adapters for the domain ports
//!
//! Objects go through the dynamic API with server-side apply, so any kind a
//! template produces can be applied without a typed client for it.

use crate::domain::objects::RenderedObject;
use crate::domain::ports::{ObjectClient, ResourceLookup};
use crate::error::{Error, Result};
use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams, PropagationPolicy};
use kube::discovery::ApiResource;
use kube::Client;
use std::time::Duration;
use tracing::debug;

/// Upper bound on retrying apply conflicts
const CONFLICT_RETRY_WINDOW: Duration = Duration::from_secs(30);

// =============================================================================
// Object Client
// =============================================================================

/// `ObjectClient` backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeObjectClient {
    client: Client,
    field_manager: String,
}

impl KubeObjectClient {
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }

    fn api_for(&self, object: &RenderedObject) -> Api<DynamicObject> {
        let resource = ApiResource::from_gvk(&object.gvk());
        match object.namespace() {
            Some(ns) if !object.is_cluster_scoped() => {
                Api::namespaced_with(self.client.clone(), ns, &resource)
            }
            _ => Api::all_with(self.client.clone(), &resource),
        }
    }

    async fn patch_once(
        &self,
        api: &Api<DynamicObject>,
        name: &str,
        params: &PatchParams,
        patch: &DynamicObject,
    ) -> std::result::Result<(), backoff::Error<Error>> {
        match api.patch(name, params, &Patch::Apply(patch)).await {
            Ok(_) => Ok(()),
            Err(e) => {
                let err = Error::Kube(e);
                if err.is_conflict() {
                    debug!("Conflict applying {}, retrying", name);
                    Err(backoff::Error::transient(err))
                } else {
                    Err(backoff::Error::permanent(err))
                }
            }
        }
    }
}

#[async_trait]
impl ObjectClient for KubeObjectClient {
    async fn apply(&self, object: &RenderedObject) -> Result<()> {
        let display = object.display_name();
        let patch = object.to_dynamic()?;
        let api = self.api_for(object);

        let mut params = PatchParams::apply(&self.field_manager);
        params.force = true;

        let policy = ExponentialBackoffBuilder::new()
            .with_max_elapsed_time(Some(CONFLICT_RETRY_WINDOW))
            .build();

        backoff::future::retry(policy, || self.patch_once(&api, object.name(), &params, &patch))
            .await
            .map_err(|e| Error::Apply {
                object: display,
                reason: e.to_string(),
            })
    }

    async fn delete(&self, object: &RenderedObject) -> Result<()> {
        let params = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            ..Default::default()
        };

        match self.api_for(object).delete(object.name(), &params).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Err(Error::ResourceNotFound {
                kind: object.kind().to_string(),
                name: object.name().to_string(),
            }),
            Err(e) => Err(Error::Delete {
                object: object.display_name(),
                reason: e.to_string(),
            }),
        }
    }
}

// =============================================================================
// Resource Lookup
// =============================================================================

/// `ResourceLookup` backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeResourceLookup {
    client: Client,
}

impl KubeResourceLookup {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ResourceLookup for KubeResourceLookup {
    async fn secret_exists(&self, namespace: &str, name: &str) -> Result<bool> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?.is_some())
    }

    async fn config_map_exists(&self, namespace: &str, name: &str) -> Result<bool> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?.is_some())
    }
}
