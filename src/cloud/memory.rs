//! In-memory cloud adapter
//!
//! Implements every cloud port over `parking_lot`-guarded maps so the
//! reconciler can run without a provider account. The adapter:
//! - records every call as `<api>:<operation>` for later inspection
//! - fails the next N calls of an operation with injected provider codes
//! - mirrors provider semantics the reconciler relies on (not-found codes,
//!   target group association through listeners, idempotent deletes)
//! - persists its state to a JSON file between CLI runs

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use tracing::{debug, info};

use super::errors as codes;
use crate::domain::{
    AddressAllocator, Attributes, AvailabilityZone, ClassicElbApi, ClassicHealthCheck,
    ClassicLoadBalancerDescription, CreateClassicLoadBalancerInput, CreateListenerInput,
    CreateLoadBalancerV2Input, CreateTargetGroupInput, ElbV2Api, HealthCheckSettings,
    IpAddressType, ListenerDescription, LoadBalancerState, LoadBalancerV2Description,
    ResourceTaggingApi, SubnetApi, SubnetDescription, TagDescription, Tags,
    TargetGroupDescription, LOAD_BALANCER_RESOURCE_TYPE,
};
use crate::error::{Error, Result};

const DEFAULT_ACCOUNT_ID: &str = "000000000000";
const MAX_DESCRIBE_TAGS: usize = 20;

/// Pool that backs addresses the custom pool could not supply
pub const PROVIDER_POOL: &str = "amazon";

// =============================================================================
// State
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ClassicRecord {
    description: ClassicLoadBalancerDescription,
    attributes: Attributes,
    tags: Tags,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LoadBalancerRecord {
    description: LoadBalancerV2Description,
    attributes: Attributes,
    tags: Tags,
    ip_address_type: IpAddressType,
    allocation_ids: Vec<String>,
    /// Describe polls left before a provisioning load balancer turns active
    polls_until_active: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TargetGroupRecord {
    description: TargetGroupDescription,
    health_check: HealthCheckSettings,
    attributes: Attributes,
    tags: Tags,
    targets: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ListenerRecord {
    description: ListenerDescription,
    tags: Tags,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AddressRecord {
    pool: String,
    name: String,
    role: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CloudState {
    region: String,
    account_id: String,
    sequence: u64,
    subnets: BTreeMap<String, SubnetDescription>,
    classic: BTreeMap<String, ClassicRecord>,
    /// Modern load balancers keyed by ARN
    load_balancers: BTreeMap<String, LoadBalancerRecord>,
    target_groups: BTreeMap<String, TargetGroupRecord>,
    listeners: BTreeMap<String, ListenerRecord>,
    addresses: BTreeMap<String, AddressRecord>,
    /// Remaining addresses per pool; pools not listed are unlimited
    pool_capacity: BTreeMap<String, usize>,
    activation_polls: u32,
}

impl CloudState {
    fn next_id(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    fn arn_prefix(&self) -> String {
        format!(
            "arn:aws:elasticloadbalancing:{}:{}",
            self.region, self.account_id
        )
    }

    fn classic_arn(&self, name: &str) -> String {
        format!("{}:loadbalancer/{}", self.arn_prefix(), name)
    }

    fn zones_for(&self, subnets: &[String]) -> Result<Vec<AvailabilityZone>> {
        subnets
            .iter()
            .map(|id| {
                self.subnets
                    .get(id)
                    .map(|s| AvailabilityZone {
                        zone_name: s.availability_zone.clone(),
                        subnet_id: id.clone(),
                    })
                    .ok_or_else(|| subnet_not_found(id))
            })
            .collect()
    }

    fn vpc_for(&self, subnets: &[String]) -> Option<String> {
        subnets
            .first()
            .and_then(|id| self.subnets.get(id))
            .map(|s| s.vpc_id.clone())
    }

    fn classic_mut(&mut self, name: &str) -> Result<&mut ClassicRecord> {
        self.classic
            .get_mut(name)
            .ok_or_else(|| classic_not_found(name))
    }

    fn load_balancer_mut(&mut self, arn: &str) -> Result<&mut LoadBalancerRecord> {
        self.load_balancers
            .get_mut(arn)
            .ok_or_else(|| v2_not_found(arn))
    }

    fn target_group_mut(&mut self, arn: &str) -> Result<&mut TargetGroupRecord> {
        self.target_groups
            .get_mut(arn)
            .ok_or_else(|| target_group_not_found(arn))
    }

    /// Drop the group's association with a load balancer once no listener uses it
    fn unlink_target_group(&mut self, target_group_arn: &str, load_balancer_arn: &str) {
        let still_used = self.listeners.values().any(|l| {
            l.description.target_group_arn == target_group_arn
                && l.description.load_balancer_arn == load_balancer_arn
        });
        if still_used {
            return;
        }
        if let Some(group) = self.target_groups.get_mut(target_group_arn) {
            group
                .description
                .load_balancer_arns
                .retain(|arn| arn != load_balancer_arn);
        }
    }
}

fn classic_not_found(name: &str) -> Error {
    Error::provider(
        codes::LOAD_BALANCER_NOT_FOUND,
        format!("There is no ACTIVE Load Balancer named '{}'", name),
    )
}

fn v2_not_found(id: &str) -> Error {
    Error::provider(
        codes::LOAD_BALANCER_NOT_FOUND,
        format!("One or more load balancers not found: {}", id),
    )
}

fn target_group_not_found(arn: &str) -> Error {
    Error::provider(
        codes::TARGET_GROUP_NOT_FOUND,
        format!("One or more target groups not found: {}", arn),
    )
}

fn subnet_not_found(id: &str) -> Error {
    Error::provider(
        codes::SUBNET_NOT_FOUND,
        format!("The subnet ID '{}' does not exist", id),
    )
}

// =============================================================================
// In-Memory Cloud
// =============================================================================

/// Cloud adapter backed by process memory
pub struct InMemoryCloud {
    state: RwLock<CloudState>,
    calls: Mutex<Vec<String>>,
    faults: Mutex<HashMap<String, VecDeque<String>>>,
}

impl Default for InMemoryCloud {
    fn default() -> Self {
        Self::new("us-east-1")
    }
}

impl InMemoryCloud {
    /// Create an empty cloud for `region`
    pub fn new(region: impl Into<String>) -> Self {
        Self::from_state(CloudState {
            region: region.into(),
            account_id: DEFAULT_ACCOUNT_ID.to_string(),
            ..Default::default()
        })
    }

    fn from_state(state: CloudState) -> Self {
        Self {
            state: RwLock::new(state),
            calls: Mutex::new(Vec::new()),
            faults: Mutex::new(HashMap::new()),
        }
    }

    /// Load state previously written by [`InMemoryCloud::save`]
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path.as_ref())?;
        let state: CloudState = serde_json::from_str(&data)?;
        info!(
            "Loaded cloud state from {} ({} classic, {} modern load balancers)",
            path.as_ref().display(),
            state.classic.len(),
            state.load_balancers.len()
        );
        Ok(Self::from_state(state))
    }

    /// Write the current state as JSON
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let data = serde_json::to_string_pretty(&*self.state.read())?;
        std::fs::write(path.as_ref(), data)?;
        debug!("Saved cloud state to {}", path.as_ref().display());
        Ok(())
    }

    pub fn region(&self) -> String {
        self.state.read().region.clone()
    }

    // =========================================================================
    // Seeding
    // =========================================================================

    /// Register a subnet so load balancers can be placed in it
    pub fn add_subnet(&self, subnet_id: &str, availability_zone: &str, vpc_id: &str) {
        self.state.write().subnets.insert(
            subnet_id.to_string(),
            SubnetDescription {
                subnet_id: subnet_id.to_string(),
                availability_zone: availability_zone.to_string(),
                vpc_id: vpc_id.to_string(),
            },
        );
    }

    /// Insert a classic load balancer created outside the reconciler
    pub fn insert_classic_load_balancer(
        &self,
        description: ClassicLoadBalancerDescription,
        tags: Tags,
    ) {
        self.state.write().classic.insert(
            description.name.clone(),
            ClassicRecord {
                description,
                attributes: Attributes::new(),
                tags,
            },
        );
    }

    /// New modern load balancers stay provisioning for `polls` describe calls
    pub fn set_activation_polls(&self, polls: u32) {
        self.state.write().activation_polls = polls;
    }

    /// Limit how many more addresses `pool` can hand out
    pub fn set_pool_capacity(&self, pool: &str, capacity: usize) {
        self.state
            .write()
            .pool_capacity
            .insert(pool.to_string(), capacity);
    }

    /// Fail the next call of `operation` with provider error `code`
    pub fn inject_error(&self, operation: &str, code: &str) {
        self.inject_errors(operation, code, 1);
    }

    /// Fail the next `times` calls of `operation` with provider error `code`
    pub fn inject_errors(&self, operation: &str, code: &str, times: usize) {
        let mut faults = self.faults.lock();
        let queue = faults.entry(operation.to_string()).or_default();
        queue.extend(std::iter::repeat(code.to_string()).take(times));
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Every call made so far, in order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Calls that change cloud state
    pub fn mutating_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|call| {
                let op = call.split_once(':').map(|(_, op)| op).unwrap_or(call.as_str());
                !(op.starts_with("describe") || op.starts_with("get_"))
            })
            .collect()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    pub fn classic_load_balancer(&self, name: &str) -> Option<ClassicLoadBalancerDescription> {
        self.state
            .read()
            .classic
            .get(name)
            .map(|r| r.description.clone())
    }

    pub fn classic_attributes(&self, name: &str) -> Option<Attributes> {
        self.state
            .read()
            .classic
            .get(name)
            .map(|r| r.attributes.clone())
    }

    pub fn classic_tags(&self, name: &str) -> Option<Tags> {
        self.state.read().classic.get(name).map(|r| r.tags.clone())
    }

    pub fn classic_names(&self) -> Vec<String> {
        self.state.read().classic.keys().cloned().collect()
    }

    /// Modern load balancer by name
    pub fn load_balancer(&self, name: &str) -> Option<LoadBalancerV2Description> {
        self.state
            .read()
            .load_balancers
            .values()
            .find(|r| r.description.name == name)
            .map(|r| r.description.clone())
    }

    pub fn load_balancer_attributes(&self, arn: &str) -> Option<Attributes> {
        self.state
            .read()
            .load_balancers
            .get(arn)
            .map(|r| r.attributes.clone())
    }

    pub fn load_balancer_tags(&self, arn: &str) -> Option<Tags> {
        self.state
            .read()
            .load_balancers
            .get(arn)
            .map(|r| r.tags.clone())
    }

    pub fn ip_address_type(&self, arn: &str) -> Option<IpAddressType> {
        self.state
            .read()
            .load_balancers
            .get(arn)
            .map(|r| r.ip_address_type)
    }

    /// Address allocations attached through subnet mappings
    pub fn allocation_ids(&self, arn: &str) -> Vec<String> {
        self.state
            .read()
            .load_balancers
            .get(arn)
            .map(|r| r.allocation_ids.clone())
            .unwrap_or_default()
    }

    /// Pool an allocated address was taken from
    pub fn address_pool(&self, allocation_id: &str) -> Option<String> {
        self.state
            .read()
            .addresses
            .get(allocation_id)
            .map(|a| a.pool.clone())
    }

    pub fn target_groups(&self) -> Vec<TargetGroupDescription> {
        self.state
            .read()
            .target_groups
            .values()
            .map(|r| r.description.clone())
            .collect()
    }

    pub fn target_group_attributes(&self, arn: &str) -> Option<Attributes> {
        self.state
            .read()
            .target_groups
            .get(arn)
            .map(|r| r.attributes.clone())
    }

    pub fn target_group_health_check(&self, arn: &str) -> Option<HealthCheckSettings> {
        self.state
            .read()
            .target_groups
            .get(arn)
            .map(|r| r.health_check.clone())
    }

    pub fn listeners(&self) -> Vec<ListenerDescription> {
        self.state
            .read()
            .listeners
            .values()
            .map(|r| r.description.clone())
            .collect()
    }

    // =========================================================================
    // Call Recording
    // =========================================================================

    fn call(&self, operation: &str) -> Result<()> {
        self.calls.lock().push(operation.to_string());
        let injected = self
            .faults
            .lock()
            .get_mut(operation)
            .and_then(|queue| queue.pop_front());
        match injected {
            Some(code) => {
                debug!("Injecting {} into {}", code, operation);
                Err(Error::provider(
                    code,
                    format!("injected failure for {}", operation),
                ))
            }
            None => Ok(()),
        }
    }
}

// =============================================================================
// Classic Load Balancer API
// =============================================================================

#[async_trait]
impl ClassicElbApi for InMemoryCloud {
    async fn describe_load_balancers(
        &self,
        names: &[String],
    ) -> Result<Vec<ClassicLoadBalancerDescription>> {
        self.call("elb:describe_load_balancers")?;
        let state = self.state.read();
        if names.is_empty() {
            return Ok(state.classic.values().map(|r| r.description.clone()).collect());
        }
        names
            .iter()
            .map(|name| {
                state
                    .classic
                    .get(name)
                    .map(|r| r.description.clone())
                    .ok_or_else(|| classic_not_found(name))
            })
            .collect()
    }

    async fn describe_load_balancer_attributes(&self, name: &str) -> Result<Attributes> {
        self.call("elb:describe_load_balancer_attributes")?;
        self.state
            .read()
            .classic
            .get(name)
            .map(|r| r.attributes.clone())
            .ok_or_else(|| classic_not_found(name))
    }

    async fn describe_tags(&self, names: &[String]) -> Result<Vec<TagDescription>> {
        self.call("elb:describe_tags")?;
        if names.len() > MAX_DESCRIBE_TAGS {
            return Err(Error::provider(
                "ValidationError",
                format!("at most {} load balancer names per request", MAX_DESCRIBE_TAGS),
            ));
        }
        let state = self.state.read();
        names
            .iter()
            .map(|name| {
                state
                    .classic
                    .get(name)
                    .map(|r| TagDescription {
                        resource: name.clone(),
                        tags: r.tags.clone(),
                    })
                    .ok_or_else(|| classic_not_found(name))
            })
            .collect()
    }

    async fn create_load_balancer(&self, input: CreateClassicLoadBalancerInput) -> Result<String> {
        self.call("elb:create_load_balancer")?;
        let mut state = self.state.write();
        if state.classic.contains_key(&input.name) {
            return Err(Error::provider(
                codes::DUPLICATE_LOAD_BALANCER_NAME,
                format!("Load Balancer named '{}' already exists", input.name),
            ));
        }

        let zones = state.zones_for(&input.subnets)?;
        let id = state.next_id();
        let dns_name = format!("{}-{}.{}.elb.amazonaws.com", input.name, id, state.region);
        let description = ClassicLoadBalancerDescription {
            name: input.name.clone(),
            dns_name: dns_name.clone(),
            scheme: input.scheme,
            vpc_id: state.vpc_for(&input.subnets),
            subnets: input.subnets,
            availability_zones: zones.into_iter().map(|z| z.zone_name).collect(),
            security_groups: input.security_groups,
            listeners: input.listeners,
            health_check: None,
            instances: Vec::new(),
        };
        state.classic.insert(
            input.name,
            ClassicRecord {
                description,
                attributes: Attributes::new(),
                tags: input.tags,
            },
        );
        Ok(dns_name)
    }

    async fn configure_health_check(
        &self,
        name: &str,
        health_check: &ClassicHealthCheck,
    ) -> Result<()> {
        self.call("elb:configure_health_check")?;
        let mut state = self.state.write();
        state.classic_mut(name)?.description.health_check = Some(health_check.clone());
        Ok(())
    }

    async fn modify_load_balancer_attributes(
        &self,
        name: &str,
        attributes: &Attributes,
    ) -> Result<()> {
        self.call("elb:modify_load_balancer_attributes")?;
        let mut state = self.state.write();
        let record = state.classic_mut(name)?;
        record
            .attributes
            .extend(attributes.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    async fn attach_to_subnets(&self, name: &str, subnets: &[String]) -> Result<()> {
        self.call("elb:attach_to_subnets")?;
        let mut state = self.state.write();
        state.zones_for(subnets)?;

        let mut attached = state.classic_mut(name)?.description.subnets.clone();
        for subnet in subnets {
            if !attached.contains(subnet) {
                attached.push(subnet.clone());
            }
        }
        let zones = state.zones_for(&attached)?;
        let record = state.classic_mut(name)?;
        record.description.subnets = attached;
        record.description.availability_zones = zones.into_iter().map(|z| z.zone_name).collect();
        Ok(())
    }

    async fn apply_security_groups(&self, name: &str, security_groups: &[String]) -> Result<()> {
        self.call("elb:apply_security_groups")?;
        let mut state = self.state.write();
        state.classic_mut(name)?.description.security_groups = security_groups.to_vec();
        Ok(())
    }

    async fn add_tags(&self, name: &str, tags: &Tags) -> Result<()> {
        self.call("elb:add_tags")?;
        let mut state = self.state.write();
        state
            .classic_mut(name)?
            .tags
            .extend(tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    async fn remove_tags(&self, name: &str, keys: &[String]) -> Result<()> {
        self.call("elb:remove_tags")?;
        let mut state = self.state.write();
        let record = state.classic_mut(name)?;
        for key in keys {
            record.tags.remove(key);
        }
        Ok(())
    }

    async fn delete_load_balancer(&self, name: &str) -> Result<()> {
        self.call("elb:delete_load_balancer")?;
        self.state.write().classic.remove(name);
        Ok(())
    }

    async fn register_instances(&self, name: &str, instance_ids: &[String]) -> Result<()> {
        self.call("elb:register_instances")?;
        let mut state = self.state.write();
        let record = state.classic_mut(name)?;
        for id in instance_ids {
            if !record.description.instances.contains(id) {
                record.description.instances.push(id.clone());
            }
        }
        Ok(())
    }

    async fn deregister_instances(&self, name: &str, instance_ids: &[String]) -> Result<()> {
        self.call("elb:deregister_instances")?;
        let mut state = self.state.write();
        let record = state.classic_mut(name)?;
        if let Some(missing) = instance_ids
            .iter()
            .find(|id| !record.description.instances.contains(id))
        {
            return Err(Error::provider(
                codes::INVALID_INSTANCE,
                format!("Instance {} is not registered with {}", missing, name),
            ));
        }
        record
            .description
            .instances
            .retain(|id| !instance_ids.contains(id));
        Ok(())
    }
}

// =============================================================================
// Modern Load Balancer API
// =============================================================================

#[async_trait]
impl ElbV2Api for InMemoryCloud {
    async fn describe_load_balancers(
        &self,
        names: &[String],
    ) -> Result<Vec<LoadBalancerV2Description>> {
        self.call("elbv2:describe_load_balancers")?;
        let state = self.state.read();
        if names.is_empty() {
            return Ok(state
                .load_balancers
                .values()
                .map(|r| r.description.clone())
                .collect());
        }
        names
            .iter()
            .map(|name| {
                state
                    .load_balancers
                    .values()
                    .find(|r| &r.description.name == name)
                    .map(|r| r.description.clone())
                    .ok_or_else(|| v2_not_found(name))
            })
            .collect()
    }

    async fn describe_load_balancers_by_arn(
        &self,
        arns: &[String],
    ) -> Result<Vec<LoadBalancerV2Description>> {
        self.call("elbv2:describe_load_balancers_by_arn")?;
        let mut state = self.state.write();
        arns.iter()
            .map(|arn| {
                let record = state.load_balancer_mut(arn)?;
                if record.description.state == LoadBalancerState::Provisioning {
                    if record.polls_until_active == 0 {
                        record.description.state = LoadBalancerState::Active;
                    } else {
                        record.polls_until_active -= 1;
                    }
                }
                Ok(record.description.clone())
            })
            .collect()
    }

    async fn describe_load_balancer_attributes(&self, arn: &str) -> Result<Attributes> {
        self.call("elbv2:describe_load_balancer_attributes")?;
        self.state
            .read()
            .load_balancers
            .get(arn)
            .map(|r| r.attributes.clone())
            .ok_or_else(|| v2_not_found(arn))
    }

    async fn describe_tags(&self, arns: &[String]) -> Result<Vec<TagDescription>> {
        self.call("elbv2:describe_tags")?;
        let state = self.state.read();
        arns.iter()
            .map(|arn| {
                if let Some(record) = state.load_balancers.get(arn) {
                    return Ok(TagDescription {
                        resource: arn.clone(),
                        tags: record.tags.clone(),
                    });
                }
                state
                    .target_groups
                    .get(arn)
                    .map(|r| TagDescription {
                        resource: arn.clone(),
                        tags: r.tags.clone(),
                    })
                    .ok_or_else(|| v2_not_found(arn))
            })
            .collect()
    }

    async fn create_load_balancer(
        &self,
        input: CreateLoadBalancerV2Input,
    ) -> Result<LoadBalancerV2Description> {
        self.call("elbv2:create_load_balancer")?;
        let mut state = self.state.write();
        if state
            .load_balancers
            .values()
            .any(|r| r.description.name == input.name)
        {
            return Err(Error::provider(
                codes::DUPLICATE_LOAD_BALANCER_NAME,
                format!("A load balancer with the name '{}' already exists", input.name),
            ));
        }

        let subnets: Vec<String> = if input.subnet_mappings.is_empty() {
            input.subnets.clone()
        } else {
            input
                .subnet_mappings
                .iter()
                .map(|m| m.subnet_id.clone())
                .collect()
        };
        let zones = state.zones_for(&subnets)?;
        let id = state.next_id();
        let arn = format!(
            "{}:loadbalancer/{}/{}/{:016x}",
            state.arn_prefix(),
            input.load_balancer_type.arn_segment(),
            input.name,
            id
        );
        let polls = state.activation_polls;
        let description = LoadBalancerV2Description {
            arn: arn.clone(),
            name: input.name.clone(),
            dns_name: format!("{}-{:016x}.elb.{}.amazonaws.com", input.name, id, state.region),
            load_balancer_type: input.load_balancer_type,
            scheme: input.scheme,
            vpc_id: state.vpc_for(&subnets),
            availability_zones: zones,
            security_groups: input.security_groups,
            state: if polls == 0 {
                LoadBalancerState::Active
            } else {
                LoadBalancerState::Provisioning
            },
        };
        state.load_balancers.insert(
            arn,
            LoadBalancerRecord {
                description: description.clone(),
                attributes: Attributes::new(),
                tags: input.tags,
                ip_address_type: input.ip_address_type,
                allocation_ids: input
                    .subnet_mappings
                    .into_iter()
                    .filter_map(|m| m.allocation_id)
                    .collect(),
                polls_until_active: polls,
            },
        );
        Ok(description)
    }

    async fn modify_load_balancer_attributes(
        &self,
        arn: &str,
        attributes: &Attributes,
    ) -> Result<()> {
        self.call("elbv2:modify_load_balancer_attributes")?;
        let mut state = self.state.write();
        state
            .load_balancer_mut(arn)?
            .attributes
            .extend(attributes.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    async fn set_subnets(&self, arn: &str, subnets: &[String]) -> Result<()> {
        self.call("elbv2:set_subnets")?;
        let mut state = self.state.write();
        let zones = state.zones_for(subnets)?;
        state.load_balancer_mut(arn)?.description.availability_zones = zones;
        Ok(())
    }

    async fn set_security_groups(&self, arn: &str, security_groups: &[String]) -> Result<()> {
        self.call("elbv2:set_security_groups")?;
        let mut state = self.state.write();
        state.load_balancer_mut(arn)?.description.security_groups = security_groups.to_vec();
        Ok(())
    }

    async fn add_tags(&self, arn: &str, tags: &Tags) -> Result<()> {
        self.call("elbv2:add_tags")?;
        let mut state = self.state.write();
        state
            .load_balancer_mut(arn)?
            .tags
            .extend(tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    async fn remove_tags(&self, arn: &str, keys: &[String]) -> Result<()> {
        self.call("elbv2:remove_tags")?;
        let mut state = self.state.write();
        let record = state.load_balancer_mut(arn)?;
        for key in keys {
            record.tags.remove(key);
        }
        Ok(())
    }

    async fn delete_load_balancer(&self, arn: &str) -> Result<()> {
        self.call("elbv2:delete_load_balancer")?;
        let mut state = self.state.write();
        if state.load_balancers.remove(arn).is_none() {
            return Ok(());
        }

        // Listeners go away with their load balancer
        let orphaned: Vec<(String, String)> = state
            .listeners
            .iter()
            .filter(|(_, l)| l.description.load_balancer_arn == arn)
            .map(|(id, l)| (id.clone(), l.description.target_group_arn.clone()))
            .collect();
        for (listener_arn, target_group_arn) in orphaned {
            state.listeners.remove(&listener_arn);
            state.unlink_target_group(&target_group_arn, arn);
        }
        Ok(())
    }

    async fn describe_target_groups(
        &self,
        load_balancer_arn: &str,
    ) -> Result<Vec<TargetGroupDescription>> {
        self.call("elbv2:describe_target_groups")?;
        let state = self.state.read();
        if !state.load_balancers.contains_key(load_balancer_arn) {
            return Err(v2_not_found(load_balancer_arn));
        }
        Ok(state
            .target_groups
            .values()
            .filter(|r| {
                r.description
                    .load_balancer_arns
                    .iter()
                    .any(|arn| arn == load_balancer_arn)
            })
            .map(|r| r.description.clone())
            .collect())
    }

    async fn create_target_group(
        &self,
        input: CreateTargetGroupInput,
    ) -> Result<TargetGroupDescription> {
        self.call("elbv2:create_target_group")?;
        let mut state = self.state.write();
        if state
            .target_groups
            .values()
            .any(|r| r.description.name == input.name)
        {
            return Err(Error::provider(
                codes::DUPLICATE_TARGET_GROUP_NAME,
                format!("A target group with the name '{}' already exists", input.name),
            ));
        }

        let id = state.next_id();
        let arn = format!(
            "{}:targetgroup/{}/{:016x}",
            state.arn_prefix(),
            input.name,
            id
        );
        let description = TargetGroupDescription {
            arn: arn.clone(),
            name: input.name,
            port: input.port,
            protocol: input.protocol,
            load_balancer_arns: Vec::new(),
        };
        state.target_groups.insert(
            arn,
            TargetGroupRecord {
                description: description.clone(),
                health_check: input.health_check,
                attributes: Attributes::new(),
                tags: input.tags,
                targets: Vec::new(),
            },
        );
        Ok(description)
    }

    async fn modify_target_group_attributes(
        &self,
        arn: &str,
        attributes: &Attributes,
    ) -> Result<()> {
        self.call("elbv2:modify_target_group_attributes")?;
        let mut state = self.state.write();
        state
            .target_group_mut(arn)?
            .attributes
            .extend(attributes.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    async fn delete_target_group(&self, arn: &str) -> Result<()> {
        self.call("elbv2:delete_target_group")?;
        let mut state = self.state.write();
        if state
            .listeners
            .values()
            .any(|l| l.description.target_group_arn == arn)
        {
            return Err(Error::provider(
                codes::RESOURCE_IN_USE,
                format!("Target group '{}' is currently in use by a listener", arn),
            ));
        }
        state.target_groups.remove(arn);
        Ok(())
    }

    async fn describe_listeners(&self, load_balancer_arn: &str) -> Result<Vec<ListenerDescription>> {
        self.call("elbv2:describe_listeners")?;
        let state = self.state.read();
        if !state.load_balancers.contains_key(load_balancer_arn) {
            return Err(v2_not_found(load_balancer_arn));
        }
        Ok(state
            .listeners
            .values()
            .filter(|l| l.description.load_balancer_arn == load_balancer_arn)
            .map(|l| l.description.clone())
            .collect())
    }

    async fn create_listener(&self, input: CreateListenerInput) -> Result<ListenerDescription> {
        self.call("elbv2:create_listener")?;
        let mut state = self.state.write();
        state.load_balancer_mut(&input.load_balancer_arn)?;
        state.target_group_mut(&input.target_group_arn)?;
        if state.listeners.values().any(|l| {
            l.description.load_balancer_arn == input.load_balancer_arn
                && l.description.port == input.port
        }) {
            return Err(Error::provider(
                codes::DUPLICATE_LISTENER,
                format!("A listener already exists on port {}", input.port),
            ));
        }

        let id = state.next_id();
        let arn = format!(
            "{}:listener/{:016x}",
            state.arn_prefix(),
            id
        );
        let description = ListenerDescription {
            arn: arn.clone(),
            load_balancer_arn: input.load_balancer_arn.clone(),
            port: input.port,
            protocol: input.protocol,
            target_group_arn: input.target_group_arn.clone(),
        };
        state.listeners.insert(
            arn,
            ListenerRecord {
                description: description.clone(),
                tags: input.tags,
            },
        );

        let group = state.target_group_mut(&input.target_group_arn)?;
        if !group
            .description
            .load_balancer_arns
            .contains(&input.load_balancer_arn)
        {
            group
                .description
                .load_balancer_arns
                .push(input.load_balancer_arn);
        }
        Ok(description)
    }

    async fn delete_listener(&self, arn: &str) -> Result<()> {
        self.call("elbv2:delete_listener")?;
        let mut state = self.state.write();
        let record = state.listeners.remove(arn).ok_or_else(|| {
            Error::provider(
                codes::LISTENER_NOT_FOUND,
                format!("One or more listeners not found: {}", arn),
            )
        })?;
        state.unlink_target_group(
            &record.description.target_group_arn,
            &record.description.load_balancer_arn,
        );
        Ok(())
    }

    async fn register_targets(&self, target_group_arn: &str, target_ids: &[String]) -> Result<()> {
        self.call("elbv2:register_targets")?;
        let mut state = self.state.write();
        let group = state.target_group_mut(target_group_arn)?;
        for id in target_ids {
            if !group.targets.contains(id) {
                group.targets.push(id.clone());
            }
        }
        Ok(())
    }

    async fn deregister_targets(
        &self,
        target_group_arn: &str,
        target_ids: &[String],
    ) -> Result<()> {
        self.call("elbv2:deregister_targets")?;
        let mut state = self.state.write();
        let group = state.target_group_mut(target_group_arn)?;
        if let Some(missing) = target_ids.iter().find(|id| !group.targets.contains(id)) {
            return Err(Error::provider(
                codes::INVALID_TARGET,
                format!("Target {} is not registered with {}", missing, target_group_arn),
            ));
        }
        group.targets.retain(|id| !target_ids.contains(id));
        Ok(())
    }

    async fn describe_target_health(&self, target_group_arn: &str) -> Result<Vec<String>> {
        self.call("elbv2:describe_target_health")?;
        self.state
            .read()
            .target_groups
            .get(target_group_arn)
            .map(|r| r.targets.clone())
            .ok_or_else(|| target_group_not_found(target_group_arn))
    }
}

// =============================================================================
// Supporting APIs
// =============================================================================

#[async_trait]
impl SubnetApi for InMemoryCloud {
    async fn describe_subnets(&self, ids: &[String]) -> Result<Vec<SubnetDescription>> {
        self.call("ec2:describe_subnets")?;
        let state = self.state.read();
        if ids.is_empty() {
            return Ok(state.subnets.values().cloned().collect());
        }
        ids.iter()
            .map(|id| {
                state
                    .subnets
                    .get(id)
                    .cloned()
                    .ok_or_else(|| subnet_not_found(id))
            })
            .collect()
    }
}

#[async_trait]
impl AddressAllocator for InMemoryCloud {
    async fn get_or_allocate_addresses(
        &self,
        pool: &str,
        fallback_to_provider_pool: bool,
        count: usize,
        name: &str,
        role: &str,
    ) -> Result<Vec<String>> {
        self.call("ec2:get_or_allocate_addresses")?;
        let mut state = self.state.write();

        let usable = |a: &AddressRecord| {
            a.name == name && (a.pool == pool || (fallback_to_provider_pool && a.pool == PROVIDER_POOL))
        };
        let mut allocations: Vec<String> = state
            .addresses
            .iter()
            .filter(|(_, a)| usable(a))
            .map(|(id, _)| id.clone())
            .take(count)
            .collect();

        let wanted = count.saturating_sub(allocations.len());
        let available = state.pool_capacity.get(pool).copied().unwrap_or(usize::MAX);
        let granted = wanted.min(available);
        if let Some(remaining) = state.pool_capacity.get_mut(pool) {
            *remaining -= granted;
        }

        let mut grants = vec![pool; granted];
        if fallback_to_provider_pool && granted < wanted {
            debug!(
                "Pool {} exhausted, allocating {} addresses from the provider pool",
                pool,
                wanted - granted
            );
            grants.extend(std::iter::repeat(PROVIDER_POOL).take(wanted - granted));
        }
        for source in grants {
            let id = format!("eipalloc-{:016x}", state.next_id());
            state.addresses.insert(
                id.clone(),
                AddressRecord {
                    pool: source.to_string(),
                    name: name.to_string(),
                    role: role.to_string(),
                },
            );
            allocations.push(id);
        }
        Ok(allocations)
    }
}

#[async_trait]
impl ResourceTaggingApi for InMemoryCloud {
    async fn get_resources(
        &self,
        resource_type: &str,
        tag_key: &str,
        values: &[String],
    ) -> Result<Vec<String>> {
        self.call("tagging:get_resources")?;
        if resource_type != LOAD_BALANCER_RESOURCE_TYPE {
            return Ok(Vec::new());
        }

        let state = self.state.read();
        let matches = |tags: &Tags| tags.get(tag_key).is_some_and(|v| values.contains(v));
        let classic = state
            .classic
            .iter()
            .filter(|(_, r)| matches(&r.tags))
            .map(|(name, _)| state.classic_arn(name));
        let modern = state
            .load_balancers
            .iter()
            .filter(|(_, r)| matches(&r.tags))
            .map(|(arn, _)| arn.clone());
        Ok(classic.chain(modern).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{LoadBalancerType, Protocol, Scheme};
    use crate::domain::ClassicListener;
    use assert_matches::assert_matches;

    fn seeded() -> InMemoryCloud {
        let cloud = InMemoryCloud::new("us-east-1");
        cloud.add_subnet("subnet-a", "us-east-1a", "vpc-1");
        cloud.add_subnet("subnet-b", "us-east-1b", "vpc-1");
        cloud
    }

    fn classic_input(name: &str) -> CreateClassicLoadBalancerInput {
        CreateClassicLoadBalancerInput {
            name: name.to_string(),
            scheme: Scheme::InternetFacing,
            subnets: vec!["subnet-a".to_string()],
            security_groups: vec!["sg-1".to_string()],
            listeners: vec![ClassicListener {
                protocol: Protocol::Tcp,
                port: 6443,
                instance_protocol: Protocol::Tcp,
                instance_port: 6443,
            }],
            tags: Tags::new(),
        }
    }

    #[tokio::test]
    async fn test_classic_lifecycle() {
        let cloud = seeded();
        let dns = ClassicElbApi::create_load_balancer(&cloud, classic_input("lb"))
            .await
            .unwrap();
        assert!(dns.starts_with("lb-"));

        let described = ClassicElbApi::describe_load_balancers(&cloud, &["lb".to_string()])
            .await
            .unwrap();
        assert_eq!(described[0].vpc_id.as_deref(), Some("vpc-1"));
        assert_eq!(described[0].availability_zones, vec!["us-east-1a"]);

        ClassicElbApi::delete_load_balancer(&cloud, "lb").await.unwrap();
        let err = ClassicElbApi::describe_load_balancers(&cloud, &["lb".to_string()])
            .await
            .unwrap_err();
        assert_eq!(err.provider_code(), Some(codes::LOAD_BALANCER_NOT_FOUND));
    }

    #[tokio::test]
    async fn test_injected_errors_are_consumed() {
        let cloud = seeded();
        cloud.inject_errors("elb:create_load_balancer", codes::THROTTLING, 2);

        for _ in 0..2 {
            let err = ClassicElbApi::create_load_balancer(&cloud, classic_input("lb"))
                .await
                .unwrap_err();
            assert!(err.is_throttled());
        }
        assert!(ClassicElbApi::create_load_balancer(&cloud, classic_input("lb"))
            .await
            .is_ok());
        assert_eq!(cloud.mutating_calls().len(), 3);
    }

    #[tokio::test]
    async fn test_target_group_in_use_cannot_be_deleted() {
        let cloud = seeded();
        let lb = ElbV2Api::create_load_balancer(
            &cloud,
            CreateLoadBalancerV2Input {
                name: "nlb".to_string(),
                load_balancer_type: LoadBalancerType::Nlb,
                scheme: Scheme::Internal,
                subnets: vec!["subnet-a".to_string(), "subnet-b".to_string()],
                subnet_mappings: vec![],
                security_groups: vec![],
                ip_address_type: IpAddressType::Ipv4,
                tags: Tags::new(),
            },
        )
        .await
        .unwrap();
        assert!(lb.arn.contains(":loadbalancer/net/nlb/"));

        let group = cloud
            .create_target_group(CreateTargetGroupInput {
                name: "apiserver-target-abcde".to_string(),
                port: 6443,
                protocol: Protocol::Tcp,
                vpc_id: "vpc-1".to_string(),
                ip_address_type: IpAddressType::Ipv4,
                health_check: HealthCheckSettings {
                    protocol: Protocol::Tcp,
                    port: None,
                    path: None,
                    interval_seconds: 10,
                    timeout_seconds: 5,
                    healthy_threshold: 5,
                    unhealthy_threshold: 3,
                },
                tags: Tags::new(),
            })
            .await
            .unwrap();
        let listener = cloud
            .create_listener(CreateListenerInput {
                load_balancer_arn: lb.arn.clone(),
                port: 6443,
                protocol: Protocol::Tcp,
                target_group_arn: group.arn.clone(),
                tags: Tags::new(),
            })
            .await
            .unwrap();

        assert_eq!(cloud.describe_target_groups(&lb.arn).await.unwrap().len(), 1);

        let err = cloud.delete_target_group(&group.arn).await.unwrap_err();
        assert_eq!(err.provider_code(), Some(codes::RESOURCE_IN_USE));

        cloud.delete_listener(&listener.arn).await.unwrap();
        assert!(cloud.describe_target_groups(&lb.arn).await.unwrap().is_empty());
        cloud.delete_target_group(&group.arn).await.unwrap();
    }

    #[tokio::test]
    async fn test_address_pool_capacity() {
        let cloud = seeded();
        cloud.set_pool_capacity("ipv4pool-ec2-1", 1);

        let ids = cloud
            .get_or_allocate_addresses("ipv4pool-ec2-1", false, 2, "lb-x-eip", "lb")
            .await
            .unwrap();
        assert_eq!(ids.len(), 1);

        let again = cloud
            .get_or_allocate_addresses("ipv4pool-ec2-1", false, 1, "lb-x-eip", "lb")
            .await
            .unwrap();
        assert_eq!(again, ids);
    }

    #[tokio::test]
    async fn test_address_pool_fallback() {
        let cloud = seeded();
        cloud.set_pool_capacity("ipv4pool-ec2-1", 1);

        let ids = cloud
            .get_or_allocate_addresses("ipv4pool-ec2-1", true, 3, "lb-x-eip", "lb")
            .await
            .unwrap();
        assert_eq!(ids.len(), 3);
        assert_eq!(cloud.address_pool(&ids[0]).as_deref(), Some("ipv4pool-ec2-1"));
        assert_eq!(cloud.address_pool(&ids[1]).as_deref(), Some(PROVIDER_POOL));
        assert_eq!(cloud.address_pool(&ids[2]).as_deref(), Some(PROVIDER_POOL));

        // Fallback addresses are reused under the same name
        let again = cloud
            .get_or_allocate_addresses("ipv4pool-ec2-1", true, 3, "lb-x-eip", "lb")
            .await
            .unwrap();
        assert_eq!(again.len(), 3);
        assert!(again.iter().all(|id| ids.contains(id)));
    }

    #[tokio::test]
    async fn test_unknown_subnet() {
        let cloud = seeded();
        let err = cloud
            .describe_subnets(&["subnet-zzz".to_string()])
            .await
            .unwrap_err();
        assert_matches!(err, Error::Provider { code, .. } if code == codes::SUBNET_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cloud.json");

        let cloud = seeded();
        ClassicElbApi::create_load_balancer(&cloud, classic_input("lb"))
            .await
            .unwrap();
        cloud.save(&path).unwrap();

        let restored = InMemoryCloud::load(&path).unwrap();
        assert_eq!(restored.classic_names(), vec!["lb".to_string()]);
        assert!(restored.calls().is_empty());
    }
}
