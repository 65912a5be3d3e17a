//! Domain Ports - Collaborator traits consumed by the module engine
//!
//! The engine never talks to the control plane directly. Applying objects
//! and checking for prerequisites go through these traits so the outer
//! controller can supply a live client and tests can supply an in-memory one.

use crate::domain::objects::RenderedObject;
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

// =============================================================================
// Object Client Port
// =============================================================================

/// Create-or-update and delete primitive for rendered objects
#[async_trait]
pub trait ObjectClient: Send + Sync {
    /// Converge the object: create when absent, update when present
    async fn apply(&self, object: &RenderedObject) -> Result<()>;

    /// Delete the object. An absent object is reported as
    /// `Error::ResourceNotFound`; callers decide whether that is fatal.
    async fn delete(&self, object: &RenderedObject) -> Result<()>;
}

// =============================================================================
// Resource Lookup Port
// =============================================================================

/// Existence checks for prerequisites the operator does not create itself
#[async_trait]
pub trait ResourceLookup: Send + Sync {
    async fn secret_exists(&self, namespace: &str, name: &str) -> Result<bool>;

    async fn config_map_exists(&self, namespace: &str, name: &str) -> Result<bool>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type ObjectClientRef = Arc<dyn ObjectClient>;
pub type ResourceLookupRef = Arc<dyn ResourceLookup>;
