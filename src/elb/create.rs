//! Creation of load balancers, target groups and listeners

use tracing::{debug, info, trace};

use super::spec::{
    health_check_settings, target_group_matches, CONNECTION_TERMINATION_ATTRIBUTE,
    DRAINING_INTERVAL_ATTRIBUTE, PRESERVE_CLIENT_IP_ATTRIBUTE, UNHEALTHY_DRAINING_INTERVAL_SECS,
};
use super::Service;
use crate::cloud::errors::{self as codes, translate};
use crate::crd::{ControlPlaneLoadBalancerSpec, LoadBalancerType};
use crate::domain::tags::APISERVER_ROLE;
use crate::domain::{
    Attributes, ClassicHealthCheck, CreateClassicLoadBalancerInput, CreateListenerInput,
    CreateLoadBalancerV2Input, CreateTargetGroupInput, IpAddressType, LoadBalancer, SubnetMapping,
    Tags, TargetGroupSpec,
};
use crate::error::{Error, Result, ResultExt};
use crate::retry::retry_until;

/// Isolated regions that reject security groups on load balancer creation
const REGIONS_WITHOUT_LB_SECURITY_GROUPS: &[&str] =
    &["us-iso-east-1", "us-iso-west-1", "us-isob-east-1"];

/// Attributes applied to a freshly created target group
pub fn target_group_attributes(network: bool, preserve_client_ip: bool) -> Attributes {
    let mut attributes = Attributes::new();
    if network {
        attributes.insert(CONNECTION_TERMINATION_ATTRIBUTE.to_string(), "false".to_string());
        attributes.insert(
            DRAINING_INTERVAL_ATTRIBUTE.to_string(),
            UNHEALTHY_DRAINING_INTERVAL_SECS.to_string(),
        );
    }
    if !preserve_client_ip {
        attributes.insert(PRESERVE_CLIENT_IP_ATTRIBUTE.to_string(), "false".to_string());
    }
    attributes
}

impl Service {
    /// Create the classic load balancer described by `desired`
    ///
    /// The returned value has no attributes, so the reconcile that follows
    /// applies them.
    pub(super) async fn create_classic(&self, desired: &LoadBalancer) -> Result<LoadBalancer> {
        let classic = desired.kind.classic().ok_or_else(|| {
            Error::Internal(format!("load balancer {:?} is not a classic load balancer", desired.name))
        })?;

        let input = CreateClassicLoadBalancerInput {
            name: desired.name.clone(),
            scheme: desired.scheme,
            subnets: desired.subnet_ids.clone(),
            security_groups: desired.security_group_ids.clone(),
            listeners: classic.listeners.clone(),
            tags: desired.tags.clone(),
        };
        let dns_name = self
            .elb
            .create_load_balancer(input)
            .await
            .map_err(translate)
            .with_context(|| format!("failed to create classic load balancer {:?}", desired.name))?;
        self.mutated("elb:create_load_balancer");
        info!("Created classic load balancer: {} ({})", desired.name, dns_name);

        if let Some(health_check) = &classic.health_check {
            self.configure_health_check(&desired.name, health_check).await?;
        }

        let mut created = desired.clone();
        created.attributes = Attributes::new();
        created.dns_name = dns_name;
        Ok(created)
    }

    /// Configure the health check, waiting out a load balancer that is not
    /// visible yet
    pub(super) async fn configure_health_check(
        &self,
        name: &str,
        health_check: &ClassicHealthCheck,
    ) -> Result<()> {
        let elb = &self.elb;
        let policy = self.retry.retrying(codes::is_load_balancer_not_found);
        retry_until(&policy, || async move {
            elb.configure_health_check(name, health_check).await?;
            Ok(true)
        })
        .await
        .map_err(translate)
        .with_context(|| format!("failed to configure health check for classic load balancer {:?}", name))?;

        self.mutated("elb:configure_health_check");
        debug!("Configured health check {} on {}", health_check.target, name);
        Ok(())
    }

    /// Create the network, application or gateway load balancer described by
    /// `desired`, together with its target groups and listeners
    pub(super) async fn create_v2(
        &self,
        desired: &LoadBalancer,
        lb_spec: &ControlPlaneLoadBalancerSpec,
    ) -> Result<LoadBalancer> {
        let mut security_groups = desired.security_group_ids.clone();
        if REGIONS_WITHOUT_LB_SECURITY_GROUPS.contains(&self.scope.region()) {
            trace!("Region {} does not take load balancer security groups", self.scope.region());
            security_groups.clear();
        }

        let ip_address_type = if self.scope.vpc().ipv6 {
            IpAddressType::Dualstack
        } else {
            IpAddressType::Ipv4
        };

        let mut input = CreateLoadBalancerV2Input {
            name: desired.name.clone(),
            load_balancer_type: desired.kind.load_balancer_type(),
            scheme: desired.scheme,
            subnets: desired.subnet_ids.clone(),
            subnet_mappings: Vec::new(),
            security_groups,
            ip_address_type,
            tags: desired.tags.clone(),
        };
        if desired.scheme.is_internet_facing() {
            self.allocate_public_addresses(&mut input).await?;
        }

        let created = self
            .elbv2
            .create_load_balancer(input)
            .await
            .map_err(translate)
            .with_context(|| format!("failed to create load balancer {:?}", desired.name))?;
        self.mutated("elbv2:create_load_balancer");
        info!(
            "Created {} load balancer: {} ({})",
            desired.kind.load_balancer_type(),
            desired.name,
            created.dns_name
        );

        self.reconcile_target_groups_and_listeners(&created.arn, desired, lb_spec)
            .await
            .with_context(|| {
                format!("failed to create target groups/listeners for load balancer {:?}", desired.name)
            })?;

        let mut lb = desired.clone().with_arn(created.arn);
        lb.attributes = Attributes::new();
        lb.dns_name = created.dns_name;
        Ok(lb)
    }

    /// Assign addresses from the VPC's public IPv4 pool, one per subnet
    async fn allocate_public_addresses(&self, input: &mut CreateLoadBalancerV2Input) -> Result<()> {
        let vpc = self.scope.vpc();
        let Some(pool) = vpc.public_ipv4_pool() else {
            return Ok(());
        };

        if input.load_balancer_type != LoadBalancerType::Nlb {
            return Err(Error::Unsupported(format!(
                "public IPv4 pool {:?} can only be used with network load balancers, not {}",
                pool, input.load_balancer_type
            )));
        }
        if !input.subnet_mappings.is_empty() {
            return Err(Error::Unsupported(format!(
                "load balancer {:?} already has subnet mappings, addresses from public IPv4 pool {:?} cannot be assigned",
                input.name, pool
            )));
        }

        let allocations = self
            .addresses
            .get_or_allocate_addresses(
                pool,
                vpc.fallback_to_provider_pool(),
                input.subnets.len(),
                &input.name,
                APISERVER_ROLE,
            )
            .await
            .map_err(translate)
            .with_context(|| format!("failed to allocate addresses from public IPv4 pool {:?}", pool))?;
        self.mutated("ec2:get_or_allocate_addresses");

        if allocations.len() != input.subnets.len() {
            return Err(Error::AddressCountMismatch {
                pool: pool.to_string(),
                allocated: allocations.len(),
                subnets: input.subnets.len(),
            });
        }

        input.subnet_mappings = input
            .subnets
            .drain(..)
            .zip(allocations)
            .map(|(subnet_id, allocation_id)| SubnetMapping {
                subnet_id,
                allocation_id: Some(allocation_id),
            })
            .collect();
        debug!("Assigned {} addresses from pool {} to {}", input.subnet_mappings.len(), pool, input.name);
        Ok(())
    }

    /// Ensure every desired listener exists and forwards to a matching
    /// target group; existing ones are left alone
    pub(super) async fn reconcile_target_groups_and_listeners(
        &self,
        load_balancer_arn: &str,
        desired: &LoadBalancer,
        lb_spec: &ControlPlaneLoadBalancerSpec,
    ) -> Result<()> {
        let existing_groups = self
            .elbv2
            .describe_target_groups(load_balancer_arn)
            .await
            .map_err(translate)
            .with_context(|| format!("failed to describe target groups of {}", load_balancer_arn))?;
        let existing_listeners = self
            .elbv2
            .describe_listeners(load_balancer_arn)
            .await
            .map_err(translate)
            .with_context(|| format!("failed to describe listeners of {}", load_balancer_arn))?;

        let ip_address_type = if self.scope.vpc().ipv6 {
            IpAddressType::Ipv6
        } else {
            IpAddressType::Ipv4
        };
        let attributes =
            target_group_attributes(desired.kind.is_network(), lb_spec.preserve_client_ip);

        for listener in desired.listeners() {
            let group = &listener.target_group;
            let matched = existing_groups
                .iter()
                .find(|g| target_group_matches(&g.name, g.port, g.protocol, group));
            let group_arn = match matched {
                Some(existing) => {
                    trace!("Target group {} serves port {}", existing.name, listener.port);
                    existing.arn.clone()
                }
                None => {
                    self.create_target_group(group, ip_address_type, &attributes, &desired.tags)
                        .await?
                }
            };

            if existing_listeners
                .iter()
                .any(|l| l.target_group_arn == group_arn)
            {
                continue;
            }

            let created = self
                .elbv2
                .create_listener(CreateListenerInput {
                    load_balancer_arn: load_balancer_arn.to_string(),
                    port: listener.port,
                    protocol: listener.protocol,
                    target_group_arn: group_arn,
                    tags: desired.tags.clone(),
                })
                .await
                .map_err(translate)
                .with_context(|| format!("failed to create listener on port {}", listener.port))?;
            self.mutated("elbv2:create_listener");
            info!("Created listener: {} on port {}", created.arn, created.port);
        }
        Ok(())
    }

    async fn create_target_group(
        &self,
        group: &TargetGroupSpec,
        ip_address_type: IpAddressType,
        attributes: &Attributes,
        tags: &Tags,
    ) -> Result<String> {
        let created = self
            .elbv2
            .create_target_group(CreateTargetGroupInput {
                name: group.name.clone(),
                port: group.port,
                protocol: group.protocol,
                vpc_id: group.vpc_id.clone(),
                ip_address_type,
                health_check: health_check_settings(group),
                tags: tags.clone(),
            })
            .await
            .map_err(translate)
            .with_context(|| format!("failed to create target group {:?}", group.name))?;
        self.mutated("elbv2:create_target_group");
        info!("Created target group: {}", created.name);

        if !attributes.is_empty() {
            debug!("Configuring target group {} attributes: {:?}", created.name, attributes);
            self.elbv2
                .modify_target_group_attributes(&created.arn, attributes)
                .await
                .map_err(translate)
                .context("failed to modify target group attributes")?;
            self.mutated("elbv2:modify_target_group_attributes");
        }
        Ok(created.arn)
    }
}
