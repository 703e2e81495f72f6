//! Cloud adapters
//!
//! Provides:
//! - Provider error codes and their translation into domain errors
//! - An in-memory implementation of every cloud port

pub mod errors;
pub mod memory;

pub use memory::InMemoryCloud;

use crate::domain::ports::{
    AddressAllocator, AddressAllocatorRef, ClassicElbApi, ClassicElbApiRef, ElbV2Api,
    ElbV2ApiRef, ResourceTaggingApi, ResourceTaggingApiRef, SubnetApi, SubnetApiRef,
};
use std::sync::Arc;

/// Set of cloud clients injected into the load balancer service
#[derive(Clone)]
pub struct CloudClients {
    pub elb: ClassicElbApiRef,
    pub elbv2: ElbV2ApiRef,
    pub ec2: SubnetApiRef,
    pub addresses: AddressAllocatorRef,
    pub tagging: ResourceTaggingApiRef,
}

impl CloudClients {
    /// Use one adapter for every API
    pub fn shared<C>(cloud: Arc<C>) -> Self
    where
        C: ClassicElbApi + ElbV2Api + SubnetApi + AddressAllocator + ResourceTaggingApi + 'static,
    {
        Self {
            elb: cloud.clone(),
            elbv2: cloud.clone(),
            ec2: cloud.clone(),
            addresses: cloud.clone(),
            tagging: cloud,
        }
    }
}
