//! In-Memory Control Plane
//!
//! `ObjectClient` and `ResourceLookup` over process memory. Backs the
//! `render` CLI mode and the test suite.

use crate::domain::objects::RenderedObject;
use crate::domain::ports::{ObjectClient, ResourceLookup};
use crate::error::{Error, Result};
use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// One call recorded against the cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Apply(String),
    Delete(String),
}

#[derive(Default)]
struct ClusterState {
    /// Live objects keyed by display name, in first-apply order
    objects: IndexMap<String, RenderedObject>,
    secrets: HashSet<(String, String)>,
    config_maps: HashSet<(String, String)>,
    operations: Vec<Operation>,
    /// Display name -> reason for objects whose apply/delete must fail
    failures: HashMap<String, String>,
    lookup_failure: Option<String>,
    assume_prerequisites: bool,
}

/// Control plane held in memory
#[derive(Default)]
pub struct InMemoryCluster {
    state: RwLock<ClusterState>,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_secret(&self, namespace: &str, name: &str) {
        self.state
            .write()
            .secrets
            .insert((namespace.to_string(), name.to_string()));
    }

    pub fn add_config_map(&self, namespace: &str, name: &str) {
        self.state
            .write()
            .config_maps
            .insert((namespace.to_string(), name.to_string()));
    }

    /// Make every lookup fail with an internal error
    #[cfg(test)]
    pub fn fail_lookups(&self, reason: &str) {
        self.state.write().lookup_failure = Some(reason.to_string());
    }

    /// Report every secret and config map as present
    pub fn assume_prerequisites(&self) {
        self.state.write().assume_prerequisites = true;
    }

    /// Make apply and delete of one object fail
    #[cfg(test)]
    pub fn fail_object(&self, display_name: &str, reason: &str) {
        self.state
            .write()
            .failures
            .insert(display_name.to_string(), reason.to_string());
    }

    pub fn contains(&self, display_name: &str) -> bool {
        self.state.read().objects.contains_key(display_name)
    }

    pub fn get(&self, display_name: &str) -> Option<RenderedObject> {
        self.state.read().objects.get(display_name).cloned()
    }

    /// Live objects in first-apply order
    pub fn objects(&self) -> Vec<RenderedObject> {
        self.state.read().objects.values().cloned().collect()
    }

    pub fn operations(&self) -> Vec<Operation> {
        self.state.read().operations.clone()
    }

    pub fn len(&self) -> usize {
        self.state.read().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn injected_failure(&self, display_name: &str) -> Option<String> {
        self.state.read().failures.get(display_name).cloned()
    }

    fn lookup(
        &self,
        set: fn(&ClusterState) -> &HashSet<(String, String)>,
        namespace: &str,
        name: &str,
    ) -> Result<bool> {
        let state = self.state.read();
        if let Some(reason) = &state.lookup_failure {
            return Err(Error::Internal(reason.clone()));
        }
        if state.assume_prerequisites {
            return Ok(true);
        }
        Ok(set(&state).contains(&(namespace.to_string(), name.to_string())))
    }
}

#[async_trait]
impl ObjectClient for InMemoryCluster {
    async fn apply(&self, object: &RenderedObject) -> Result<()> {
        let name = object.display_name();
        if let Some(reason) = self.injected_failure(&name) {
            return Err(Error::Apply { object: name, reason });
        }

        debug!("Applying {}", name);
        let mut state = self.state.write();
        state.operations.push(Operation::Apply(name.clone()));
        state.objects.insert(name, object.clone());
        Ok(())
    }

    async fn delete(&self, object: &RenderedObject) -> Result<()> {
        let name = object.display_name();
        if let Some(reason) = self.injected_failure(&name) {
            return Err(Error::Delete { object: name, reason });
        }

        let mut state = self.state.write();
        state.operations.push(Operation::Delete(name.clone()));
        match state.objects.shift_remove(&name) {
            Some(_) => {
                debug!("Deleted {}", name);
                Ok(())
            }
            None => Err(Error::ResourceNotFound {
                kind: object.kind().to_string(),
                name: object.name().to_string(),
            }),
        }
    }
}

#[async_trait]
impl ResourceLookup for InMemoryCluster {
    async fn secret_exists(&self, namespace: &str, name: &str) -> Result<bool> {
        self.lookup(|s| &s.secrets, namespace, name)
    }

    async fn config_map_exists(&self, namespace: &str, name: &str) -> Result<bool> {
        self.lookup(|s| &s.config_maps, namespace, name)
    }
}
