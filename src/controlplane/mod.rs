//! Control Plane
//!
//! Everything that touches the cluster: the module engine, the apply/delete
//! reconciler, adapters for the domain ports and the controller loop.

pub mod controller;
pub mod engine;
pub mod kube_client;
pub mod memory;
pub mod reconciler;

pub use engine::{plan_modules, ModuleEngine, ModuleReport, ReconcileMode, ReconcileReport};
pub use kube_client::{KubeObjectClient, KubeResourceLookup};
pub use memory::InMemoryCluster;
pub use reconciler::{reconcile, ReconcileSummary};
