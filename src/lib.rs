//! CSM Module Operator - Module Composition & Reconciliation Engine
//!
//! A Kubernetes operator that deploys a Dell CSI driver together with its
//! optional feature modules, driven by one `ContainerStorageModule` resource.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                 Controller (finalizer, status patch)                 │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                           Module Engine                              │
//! │  ┌──────────┐  ┌──────────┐  ┌──────────┐  ┌──────────┐             │
//! │  │ Precheck │─▶│ Version  │─▶│ Template │─▶│ Workload │             │
//! │  │          │  │ Resolver │  │ Renderer │  │ Injector │             │
//! │  └────┬─────┘  └──────────┘  └──────────┘  └────┬─────┘             │
//! │       │          Module Registry (static)        │                   │
//! ├───────┴──────────────────────────────────────────┴──────────────────┤
//! │                     Apply/Delete Reconciler                          │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │   ResourceLookup / ObjectClient ports                                │
//! │   ┌────────────────────────┐  ┌──────────────────────────────┐      │
//! │   │  Kubernetes (SSA)      │  │  In-memory (render, tests)   │      │
//! │   └────────────────────────┘  └──────────────────────────────┘      │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controlplane`]: Engine, reconciler, cluster adapters and controller
//! - [`modules`]: Per-module precheck, render and inject
//! - [`driver`]: Driver controller/node workloads
//! - [`crd`]: Custom Resource Definitions
//! - [`domain`]: Rendered objects and port traits
//! - [`error`]: Error types and handling

pub mod config;
pub mod controlplane;
pub mod crd;
pub mod domain;
pub mod driver;
pub mod error;
pub mod metrics;
pub mod modules;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use config::OperatorConfig;

pub use controlplane::{
    InMemoryCluster, KubeObjectClient, KubeResourceLookup, ModuleEngine, ReconcileMode,
    ReconcileReport,
};

pub use crd::{
    ContainerStorageModule, ContainerStorageModuleSpec, ContainerStorageModuleStatus, Driver,
    DriverType, Module, ModuleType,
};

pub use domain::{ObjectClient, RenderedObject, ResourceLookup};

pub use error::{Error, ErrorAction, Result};

pub use metrics::EngineMetrics;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
