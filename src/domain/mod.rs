//! Domain layer - Rendered object model and port definitions
//!
//! This module defines the core traits (ports) that adapters implement,
//! following hexagonal architecture principles.

pub mod objects;
pub mod ports;

pub use objects::*;
pub use ports::*;
