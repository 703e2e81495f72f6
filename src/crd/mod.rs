//! Custom Resource Definitions
//!
//! - ControlPlaneLoadBalancer: load balancer fronting the API servers

pub mod load_balancer;

pub use load_balancer::*;
