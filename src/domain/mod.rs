//! Domain layer - load balancer model and port definitions
//!
//! This module defines the model shared by both load balancer families and
//! the traits (ports) that cloud and configuration adapters implement,
//! following hexagonal architecture principles.

pub mod model;
pub mod network;
pub mod ports;
pub mod tags;

pub use model::*;
pub use network::*;
pub use ports::*;
pub use tags::Tags;
