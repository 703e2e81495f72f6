//! Domain Ports - boundaries between the reconciler and the outside world
//!
//! The reconciler talks to the cloud through these traits and reads cluster
//! configuration through [`ElbScope`]. Adapters implement them:
//! - `cloud::memory::InMemoryCloud` implements every cloud port
//! - `config::ClusterConfig` implements the scope
//!
//! Cloud ports return raw [`Error::Provider`](crate::error::Error::Provider)
//! values; translation into domain sentinels happens in `cloud::errors`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::model::{Attributes, ClassicHealthCheck, ClassicListener};
use super::network::{Subnets, VpcSpec};
use super::tags::Tags;
use crate::crd::{ControlPlaneLoadBalancerSpec, LoadBalancerType, Protocol, Scheme};
use crate::error::Result;

// =============================================================================
// Classic Load Balancer API
// =============================================================================

/// Classic load balancer as reported by the provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassicLoadBalancerDescription {
    pub name: String,
    pub dns_name: String,
    pub scheme: Scheme,
    pub vpc_id: Option<String>,
    pub subnets: Vec<String>,
    pub availability_zones: Vec<String>,
    pub security_groups: Vec<String>,
    pub listeners: Vec<ClassicListener>,
    pub health_check: Option<ClassicHealthCheck>,
    /// Registered instance IDs
    pub instances: Vec<String>,
}

/// Request to create a classic load balancer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateClassicLoadBalancerInput {
    pub name: String,
    pub scheme: Scheme,
    pub subnets: Vec<String>,
    pub security_groups: Vec<String>,
    pub listeners: Vec<ClassicListener>,
    pub tags: Tags,
}

/// Tags attached to one load balancer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagDescription {
    /// Load balancer name (classic) or ARN (modern)
    pub resource: String,
    pub tags: Tags,
}

/// Port for the classic load balancer API
#[async_trait]
pub trait ClassicElbApi: Send + Sync {
    /// Describe load balancers by name; an empty slice lists all of them
    async fn describe_load_balancers(
        &self,
        names: &[String],
    ) -> Result<Vec<ClassicLoadBalancerDescription>>;

    async fn describe_load_balancer_attributes(&self, name: &str) -> Result<Attributes>;

    /// Describe tags of up to 20 load balancers
    async fn describe_tags(&self, names: &[String]) -> Result<Vec<TagDescription>>;

    /// Create a load balancer and return its DNS name
    async fn create_load_balancer(&self, input: CreateClassicLoadBalancerInput) -> Result<String>;

    async fn configure_health_check(&self, name: &str, health_check: &ClassicHealthCheck)
        -> Result<()>;

    async fn modify_load_balancer_attributes(&self, name: &str, attributes: &Attributes)
        -> Result<()>;

    async fn attach_to_subnets(&self, name: &str, subnets: &[String]) -> Result<()>;

    async fn apply_security_groups(&self, name: &str, security_groups: &[String]) -> Result<()>;

    async fn add_tags(&self, name: &str, tags: &Tags) -> Result<()>;

    async fn remove_tags(&self, name: &str, keys: &[String]) -> Result<()>;

    async fn delete_load_balancer(&self, name: &str) -> Result<()>;

    async fn register_instances(&self, name: &str, instance_ids: &[String]) -> Result<()>;

    async fn deregister_instances(&self, name: &str, instance_ids: &[String]) -> Result<()>;
}

// =============================================================================
// Modern Load Balancer API
// =============================================================================

/// Provisioning state of a modern load balancer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadBalancerState {
    Provisioning,
    Active,
    Failed,
}

/// Subnet placement of a modern load balancer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityZone {
    pub zone_name: String,
    pub subnet_id: String,
}

/// Modern load balancer as reported by the provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadBalancerV2Description {
    pub arn: String,
    pub name: String,
    pub dns_name: String,
    pub load_balancer_type: LoadBalancerType,
    pub scheme: Scheme,
    pub vpc_id: Option<String>,
    pub availability_zones: Vec<AvailabilityZone>,
    pub security_groups: Vec<String>,
    pub state: LoadBalancerState,
}

/// Subnet with an optional pre-allocated public address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetMapping {
    pub subnet_id: String,
    pub allocation_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpAddressType {
    #[default]
    Ipv4,
    Dualstack,
    /// Target groups only
    Ipv6,
}

/// Request to create a modern load balancer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateLoadBalancerV2Input {
    pub name: String,
    pub load_balancer_type: LoadBalancerType,
    pub scheme: Scheme,
    pub subnets: Vec<String>,
    pub subnet_mappings: Vec<SubnetMapping>,
    pub security_groups: Vec<String>,
    pub ip_address_type: IpAddressType,
    pub tags: Tags,
}

/// Fully resolved health check settings sent to the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckSettings {
    pub protocol: Protocol,
    pub port: Option<String>,
    pub path: Option<String>,
    pub interval_seconds: u32,
    pub timeout_seconds: u32,
    pub healthy_threshold: u32,
    pub unhealthy_threshold: u32,
}

/// Request to create a target group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateTargetGroupInput {
    pub name: String,
    pub port: u16,
    pub protocol: Protocol,
    pub vpc_id: String,
    pub ip_address_type: IpAddressType,
    pub health_check: HealthCheckSettings,
    pub tags: Tags,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetGroupDescription {
    pub arn: String,
    pub name: String,
    pub port: u16,
    pub protocol: Protocol,
    /// Load balancers forwarding to this group through a listener
    pub load_balancer_arns: Vec<String>,
}

/// Request to create a forwarding listener
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateListenerInput {
    pub load_balancer_arn: String,
    pub port: u16,
    pub protocol: Protocol,
    pub target_group_arn: String,
    pub tags: Tags,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenerDescription {
    pub arn: String,
    pub load_balancer_arn: String,
    pub port: u16,
    pub protocol: Protocol,
    pub target_group_arn: String,
}

/// Port for the modern (network/application/gateway) load balancer API
#[async_trait]
pub trait ElbV2Api: Send + Sync {
    async fn describe_load_balancers(&self, names: &[String])
        -> Result<Vec<LoadBalancerV2Description>>;

    async fn describe_load_balancers_by_arn(
        &self,
        arns: &[String],
    ) -> Result<Vec<LoadBalancerV2Description>>;

    async fn describe_load_balancer_attributes(&self, arn: &str) -> Result<Attributes>;

    async fn describe_tags(&self, arns: &[String]) -> Result<Vec<TagDescription>>;

    async fn create_load_balancer(
        &self,
        input: CreateLoadBalancerV2Input,
    ) -> Result<LoadBalancerV2Description>;

    async fn modify_load_balancer_attributes(&self, arn: &str, attributes: &Attributes)
        -> Result<()>;

    async fn set_subnets(&self, arn: &str, subnets: &[String]) -> Result<()>;

    async fn set_security_groups(&self, arn: &str, security_groups: &[String]) -> Result<()>;

    async fn add_tags(&self, arn: &str, tags: &Tags) -> Result<()>;

    async fn remove_tags(&self, arn: &str, keys: &[String]) -> Result<()>;

    async fn delete_load_balancer(&self, arn: &str) -> Result<()>;

    /// Target groups attached to a load balancer through its listeners
    async fn describe_target_groups(&self, load_balancer_arn: &str)
        -> Result<Vec<TargetGroupDescription>>;

    async fn create_target_group(&self, input: CreateTargetGroupInput)
        -> Result<TargetGroupDescription>;

    async fn modify_target_group_attributes(&self, arn: &str, attributes: &Attributes)
        -> Result<()>;

    async fn delete_target_group(&self, arn: &str) -> Result<()>;

    async fn describe_listeners(&self, load_balancer_arn: &str) -> Result<Vec<ListenerDescription>>;

    async fn create_listener(&self, input: CreateListenerInput) -> Result<ListenerDescription>;

    async fn delete_listener(&self, arn: &str) -> Result<()>;

    async fn register_targets(&self, target_group_arn: &str, target_ids: &[String]) -> Result<()>;

    async fn deregister_targets(&self, target_group_arn: &str, target_ids: &[String])
        -> Result<()>;

    /// IDs of the targets registered with a target group
    async fn describe_target_health(&self, target_group_arn: &str) -> Result<Vec<String>>;
}

// =============================================================================
// Supporting APIs
// =============================================================================

/// Subnet as reported by the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetDescription {
    pub subnet_id: String,
    pub availability_zone: String,
    pub vpc_id: String,
}

/// Port for subnet lookups
#[async_trait]
pub trait SubnetApi: Send + Sync {
    async fn describe_subnets(&self, ids: &[String]) -> Result<Vec<SubnetDescription>>;
}

/// Port for public address allocation from a BYOIP pool
#[async_trait]
pub trait AddressAllocator: Send + Sync {
    /// Return allocation IDs for `count` addresses tagged with `name` and `role`,
    /// reusing addresses already allocated under that name
    ///
    /// With `fallback_to_provider_pool`, addresses `pool` cannot supply are
    /// taken from the provider's own pool instead.
    async fn get_or_allocate_addresses(
        &self,
        pool: &str,
        fallback_to_provider_pool: bool,
        count: usize,
        name: &str,
        role: &str,
    ) -> Result<Vec<String>>;
}

/// Resource type accepted by the tagging API for load balancers
pub const LOAD_BALANCER_RESOURCE_TYPE: &str = "elasticloadbalancing:loadbalancer";

/// Port for resource discovery by tag
#[async_trait]
pub trait ResourceTaggingApi: Send + Sync {
    /// ARNs of resources of `resource_type` whose `tag_key` has one of `values`
    async fn get_resources(
        &self,
        resource_type: &str,
        tag_key: &str,
        values: &[String],
    ) -> Result<Vec<String>>;
}

// =============================================================================
// Scope Port
// =============================================================================

/// Cluster configuration consumed by the reconciler
pub trait ElbScope: Send + Sync {
    /// Cluster name
    fn name(&self) -> &str;

    fn namespace(&self) -> &str;

    /// `namespace/name`, used in error messages
    fn infra_cluster_name(&self) -> String {
        format!("{}/{}", self.namespace(), self.name())
    }

    fn region(&self) -> &str;

    fn vpc(&self) -> &VpcSpec;

    fn subnets(&self) -> &Subnets;

    /// Security group created for the API server load balancer
    fn api_server_lb_security_group(&self) -> Option<&str>;

    /// User tags applied to every resource
    fn additional_tags(&self) -> &Tags;

    fn control_plane_load_balancer(&self) -> Option<&ControlPlaneLoadBalancerSpec>;

    fn secondary_control_plane_load_balancer(&self) -> Option<&ControlPlaneLoadBalancerSpec>;

    /// Every declared load balancer; the primary defaults to a classic one
    fn control_plane_load_balancers(&self) -> Vec<ControlPlaneLoadBalancerSpec> {
        let primary = self
            .control_plane_load_balancer()
            .cloned()
            .unwrap_or_default();
        std::iter::once(primary)
            .chain(self.secondary_control_plane_load_balancer().cloned())
            .collect()
    }

    /// Control plane endpoint has already been published
    fn control_plane_endpoint_valid(&self) -> bool;

    /// Port clients use to reach the API server through the load balancer
    fn api_server_port(&self) -> u16;

    /// Upper bound for waiting on a new load balancer to become available
    fn max_wait(&self) -> Duration;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type ClassicElbApiRef = Arc<dyn ClassicElbApi>;
pub type ElbV2ApiRef = Arc<dyn ElbV2Api>;
pub type SubnetApiRef = Arc<dyn SubnetApi>;
pub type AddressAllocatorRef = Arc<dyn AddressAllocator>;
pub type ResourceTaggingApiRef = Arc<dyn ResourceTaggingApi>;
pub type ElbScopeRef = Arc<dyn ElbScope>;
