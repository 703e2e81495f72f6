//! API Server Load Balancer Operator
//!
//! Reconciles the load balancers that front a cluster's Kubernetes API
//! servers: classic ELBs and the network/application/gateway family.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                        ELB Service (per cluster)                             │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────────┐  │
//! │  │  Spec Builder   │  │    Describe     │  │     Create / Reconcile      │  │
//! │  │  (naming, SGs)  │  │   (lookup)      │  │     (diff + apply, tags)    │  │
//! │  └────────┬────────┘  └────────┬────────┘  └─────────────┬───────────────┘  │
//! │           │                    │                         │                   │
//! │           └────────────────────┼─────────────────────────┘                   │
//! │                                │                                             │
//! │              ┌─────────────────┴──────────────────┐                          │
//! │              │  Teardown  │  Instance Registration │                          │
//! │              └─────────────────┬──────────────────┘                          │
//! ├────────────────────────────────┼────────────────────────────────────────────┤
//! │                           Cloud Ports                                        │
//! │  ┌───────────┐ ┌───────────┐ ┌───────────┐ ┌─────────────┐ ┌─────────────┐  │
//! │  │ Classic   │ │  ELB v2   │ │  Subnets  │ │  Addresses  │ │  Tagging    │  │
//! │  └───────────┘ └───────────┘ └───────────┘ └─────────────┘ └─────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`elb`]: Load balancer service (reconcile, delete, register)
//! - [`cloud`]: Provider error translation and the in-memory cloud
//! - [`config`]: Cluster configuration
//! - [`crd`]: Custom Resource Definitions
//! - [`domain`]: Core domain types and cloud ports
//! - [`naming`]: Deterministic load balancer names
//! - [`retry`]: Bounded retry of eventually consistent calls
//! - [`metrics`]: Prometheus metrics
//! - [`error`]: Error types and handling

pub mod cloud;
pub mod config;
pub mod crd;
pub mod domain;
pub mod elb;
pub mod error;
pub mod metrics;
pub mod naming;
pub mod retry;

// Re-export commonly used types
pub use cloud::{CloudClients, InMemoryCloud};

pub use config::{ApiEndpoint, ClusterConfig, ReconcilerConfig};

pub use crd::{
    ControlPlaneLoadBalancer, ControlPlaneLoadBalancerSpec, ControlPlaneLoadBalancerStatus,
    LoadBalancerType, Scheme,
};

pub use domain::{ElbScope, Instance, LoadBalancer, LoadBalancerKind, Tags};

pub use elb::{NameLocks, Service, TagDelta};

pub use error::{Error, ErrorAction, Result};

pub use metrics::ReconcileMetrics;

pub use retry::RetryPolicy;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
