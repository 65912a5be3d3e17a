//! Custom Resource Definitions for the CSM Module Operator
//!
//! - ContainerStorageModule: driver plus ordered feature modules

pub mod container_storage_module;

pub use container_storage_module::*;
