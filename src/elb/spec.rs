//! Desired state of the API server load balancers
//!
//! Builds the `LoadBalancer` value a reconcile converges towards:
//! - subnet placement (explicit subnets, or one cluster subnet per zone)
//! - the API server listener plus user-declared additional listeners
//! - health checks, attributes, security groups and ownership tags

use indexmap::IndexMap;
use rand::Rng;
use std::time::Duration;
use tracing::trace;

use super::Service;
use crate::cloud::errors::translate;
use crate::config::DEFAULT_API_SERVER_PORT;
use crate::crd::{AdditionalListenerSpec, ControlPlaneLoadBalancerSpec, Protocol, Scheme};
use crate::domain::model::{CROSS_ZONE_ATTRIBUTE, IDLE_TIMEOUT_ATTRIBUTE};
use crate::domain::tags::{self, BuildParams, APISERVER_ROLE};
use crate::domain::{
    Attributes, ClassicConfig, ClassicHealthCheck, ClassicListener, HealthCheckSettings,
    LoadBalancer, LoadBalancerKind, Listener, Subnets, TargetGroupHealthCheck, TargetGroupSpec,
    V2Config,
};
use crate::error::{Error, Result, ResultExt};

pub const API_SERVER_HEALTH_CHECK_PATH: &str = "/readyz";
pub const DEFAULT_HEALTH_CHECK_INTERVAL_SECS: u32 = 10;
pub const DEFAULT_HEALTH_CHECK_TIMEOUT_SECS: u32 = 5;
pub const DEFAULT_HEALTHY_THRESHOLD: u32 = 5;
pub const DEFAULT_UNHEALTHY_THRESHOLD: u32 = 3;

pub const CLASSIC_IDLE_TIMEOUT_SECS: u32 = 600;
pub const V2_IDLE_TIMEOUT_SECS: u32 = 60;

pub const API_SERVER_TARGET_GROUP_PREFIX: &str = "apiserver-target-";
pub const ADDITIONAL_TARGET_GROUP_PREFIX: &str = "additional-listener-";

pub const PRESERVE_CLIENT_IP_ATTRIBUTE: &str = "preserve_client_ip.enabled";
pub const CONNECTION_TERMINATION_ATTRIBUTE: &str =
    "target_health_state.unhealthy.connection_termination.enabled";
pub const DRAINING_INTERVAL_ATTRIBUTE: &str =
    "target_health_state.unhealthy.draining_interval_seconds";
pub const UNHEALTHY_DRAINING_INTERVAL_SECS: u32 = 300;

const NAME_SUFFIX_LENGTH: usize = 5;
const NAME_SUFFIX_ALPHABET: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";

/// `prefix` followed by five random characters
pub fn generate_target_group_name(prefix: &str) -> String {
    let mut rng = rand::thread_rng();
    let mut name = String::with_capacity(prefix.len() + NAME_SUFFIX_LENGTH);
    name.push_str(prefix);
    name.extend(
        (0..NAME_SUFFIX_LENGTH)
            .map(|_| NAME_SUFFIX_ALPHABET[rng.gen_range(0..NAME_SUFFIX_ALPHABET.len())] as char),
    );
    name
}

/// Pick at most one subnet per availability zone, first wins
///
/// Private non-CNI subnets are preferred; public ones are used for
/// internet-facing load balancers and for clusters without private subnets.
pub fn select_subnets(subnets: &Subnets, scheme: Scheme) -> (Vec<String>, Vec<String>) {
    let mut candidates: Vec<_> = subnets.private().collect();
    if scheme.is_internet_facing() || candidates.is_empty() {
        candidates = subnets.public().collect();
    }

    let mut by_zone: IndexMap<&str, &str> = IndexMap::new();
    for subnet in candidates {
        by_zone
            .entry(subnet.availability_zone.as_str())
            .or_insert_with(|| subnet.resource_id());
    }
    by_zone
        .into_iter()
        .map(|(zone, id)| (id.to_string(), zone.to_string()))
        .unzip()
}

/// Classic health check target, e.g. `TCP:6443` or `HTTPS:6443/readyz`
pub fn classic_health_check_target(protocol: Option<Protocol>) -> String {
    let protocol = protocol.unwrap_or(Protocol::Tcp);
    if protocol.is_http() {
        format!(
            "{}:{}{}",
            protocol, DEFAULT_API_SERVER_PORT, API_SERVER_HEALTH_CHECK_PATH
        )
    } else {
        format!("{}:{}", protocol, DEFAULT_API_SERVER_PORT)
    }
}

/// Health check of the API server target group
///
/// Only the counters can be overridden; protocol and path follow
/// `health_check_protocol`.
pub fn api_target_group_health_check(lb_spec: &ControlPlaneLoadBalancerSpec) -> TargetGroupHealthCheck {
    let protocol = lb_spec.health_check_protocol.unwrap_or(Protocol::Tcp);
    let mut health_check = TargetGroupHealthCheck {
        protocol: Some(protocol),
        port: Some(DEFAULT_API_SERVER_PORT.to_string()),
        path: protocol
            .is_http()
            .then(|| API_SERVER_HEALTH_CHECK_PATH.to_string()),
        interval_seconds: Some(DEFAULT_HEALTH_CHECK_INTERVAL_SECS),
        timeout_seconds: Some(DEFAULT_HEALTH_CHECK_TIMEOUT_SECS),
        threshold_count: Some(DEFAULT_HEALTHY_THRESHOLD),
        unhealthy_threshold_count: Some(DEFAULT_UNHEALTHY_THRESHOLD),
    };

    if let Some(overrides) = &lb_spec.health_check {
        trace!("Applying health check overrides to the API server target group");
        health_check.interval_seconds = overrides.interval_seconds.or(health_check.interval_seconds);
        health_check.timeout_seconds = overrides.timeout_seconds.or(health_check.timeout_seconds);
        health_check.threshold_count = overrides.threshold_count.or(health_check.threshold_count);
        health_check.unhealthy_threshold_count = overrides
            .unhealthy_threshold_count
            .or(health_check.unhealthy_threshold_count);
    }
    health_check
}

/// Health check of an additional listener's target group
pub fn additional_target_group_health_check(listener: &AdditionalListenerSpec) -> TargetGroupHealthCheck {
    let Some(declared) = &listener.health_check else {
        return TargetGroupHealthCheck {
            protocol: Some(listener.protocol),
            port: Some(listener.port.to_string()),
            ..Default::default()
        };
    };

    let counters = &declared.counters;
    TargetGroupHealthCheck {
        protocol: Some(declared.protocol.unwrap_or(listener.protocol)),
        port: Some(
            declared
                .port
                .clone()
                .unwrap_or_else(|| listener.port.to_string()),
        ),
        path: declared.path.clone(),
        interval_seconds: Some(
            counters
                .interval_seconds
                .unwrap_or(DEFAULT_HEALTH_CHECK_INTERVAL_SECS),
        ),
        timeout_seconds: Some(
            counters
                .timeout_seconds
                .unwrap_or(DEFAULT_HEALTH_CHECK_TIMEOUT_SECS),
        ),
        threshold_count: Some(counters.threshold_count.unwrap_or(DEFAULT_HEALTHY_THRESHOLD)),
        unhealthy_threshold_count: Some(
            counters
                .unhealthy_threshold_count
                .unwrap_or(DEFAULT_UNHEALTHY_THRESHOLD),
        ),
    }
}

/// Resolve a target group health check into the settings sent on create
pub fn health_check_settings(group: &TargetGroupSpec) -> HealthCheckSettings {
    let declared = group.health_check.clone().unwrap_or_default();
    HealthCheckSettings {
        protocol: declared.protocol.unwrap_or(group.protocol),
        port: declared.port,
        path: declared.path,
        interval_seconds: declared
            .interval_seconds
            .unwrap_or(DEFAULT_HEALTH_CHECK_INTERVAL_SECS),
        timeout_seconds: declared
            .timeout_seconds
            .unwrap_or(DEFAULT_HEALTH_CHECK_TIMEOUT_SECS),
        healthy_threshold: declared.threshold_count.unwrap_or(DEFAULT_HEALTHY_THRESHOLD),
        unhealthy_threshold: declared
            .unhealthy_threshold_count
            .unwrap_or(DEFAULT_UNHEALTHY_THRESHOLD),
    }
}

/// Check whether an existing target group was created for `spec`
///
/// Target group names carry a random suffix, so groups are matched on
/// prefix, port and protocol. Groups without a known prefix were not
/// created by the reconciler and never match.
pub fn target_group_matches(existing_name: &str, port: u16, protocol: Protocol, spec: &TargetGroupSpec) -> bool {
    let prefix = [API_SERVER_TARGET_GROUP_PREFIX, ADDITIONAL_TARGET_GROUP_PREFIX]
        .into_iter()
        .find(|p| existing_name.starts_with(p));
    match prefix {
        Some(prefix) if spec.name.starts_with(prefix) => {
            port == spec.port && protocol.as_str().eq_ignore_ascii_case(spec.protocol.as_str())
        }
        _ => false,
    }
}

fn lb_security_groups(service: &Service, lb_spec: &ControlPlaneLoadBalancerSpec) -> Vec<String> {
    let mut groups = lb_spec.additional_security_groups.clone();
    if let Some(api_server_group) = service.scope.api_server_lb_security_group() {
        groups.push(api_server_group.to_string());
    }
    groups
}

impl Service {
    fn desired_tags(&self, name: &str) -> tags::Tags {
        tags::build(
            BuildParams::owned(self.scope.name(), self.scope.additional_tags())
                .with_name(name)
                .with_role(APISERVER_ROLE),
        )
    }

    /// Subnets and zones for a load balancer
    async fn placement(
        &self,
        lb_spec: &ControlPlaneLoadBalancerSpec,
        scheme: Scheme,
    ) -> Result<(Vec<String>, Vec<String>)> {
        if lb_spec.subnets.is_empty() {
            return Ok(select_subnets(self.scope.subnets(), scheme));
        }

        // Explicit subnets may not be part of the cluster network
        let described = self
            .ec2
            .describe_subnets(&lb_spec.subnets)
            .await
            .map_err(translate)
            .with_context(|| format!("failed to describe subnets {:?}", lb_spec.subnets))?;
        Ok(described
            .into_iter()
            .map(|s| (s.subnet_id, s.availability_zone))
            .unzip())
    }

    /// Desired state of the primary classic load balancer
    pub async fn build_classic_spec(
        &self,
        name: &str,
        lb_spec: &ControlPlaneLoadBalancerSpec,
    ) -> Result<LoadBalancer> {
        let scheme = lb_spec.scheme.unwrap_or_default();
        let (subnet_ids, availability_zones) = self.placement(lb_spec, scheme).await?;

        let mut attributes = Attributes::new();
        attributes.insert(
            IDLE_TIMEOUT_ATTRIBUTE.to_string(),
            CLASSIC_IDLE_TIMEOUT_SECS.to_string(),
        );
        attributes.insert(
            CROSS_ZONE_ATTRIBUTE.to_string(),
            lb_spec.cross_zone_load_balancing.to_string(),
        );

        Ok(LoadBalancer {
            name: name.to_string(),
            scheme,
            kind: LoadBalancerKind::Classic(ClassicConfig {
                listeners: vec![ClassicListener {
                    protocol: Protocol::Tcp,
                    port: self.scope.api_server_port(),
                    instance_protocol: Protocol::Tcp,
                    instance_port: DEFAULT_API_SERVER_PORT,
                }],
                health_check: Some(ClassicHealthCheck {
                    target: classic_health_check_target(lb_spec.health_check_protocol),
                    interval: Duration::from_secs(DEFAULT_HEALTH_CHECK_INTERVAL_SECS.into()),
                    timeout: Duration::from_secs(DEFAULT_HEALTH_CHECK_TIMEOUT_SECS.into()),
                    healthy_threshold: DEFAULT_HEALTHY_THRESHOLD,
                    unhealthy_threshold: DEFAULT_UNHEALTHY_THRESHOLD,
                }),
            }),
            subnet_ids,
            availability_zones,
            security_group_ids: lb_security_groups(self, lb_spec),
            attributes,
            tags: self.desired_tags(name),
            dns_name: String::new(),
        })
    }

    /// Desired state of a network, application or gateway load balancer
    pub async fn build_v2_spec(
        &self,
        name: &str,
        lb_spec: &ControlPlaneLoadBalancerSpec,
    ) -> Result<LoadBalancer> {
        let vpc_id = self.scope.vpc().id.clone();

        let mut listeners = vec![Listener {
            protocol: Protocol::Tcp,
            port: DEFAULT_API_SERVER_PORT,
            target_group: TargetGroupSpec {
                name: generate_target_group_name(API_SERVER_TARGET_GROUP_PREFIX),
                port: DEFAULT_API_SERVER_PORT,
                protocol: Protocol::Tcp,
                vpc_id: vpc_id.clone(),
                health_check: Some(api_target_group_health_check(lb_spec)),
            },
        }];
        listeners.extend(lb_spec.additional_listeners.iter().map(|listener| Listener {
            protocol: listener.protocol,
            port: listener.port,
            target_group: TargetGroupSpec {
                name: generate_target_group_name(ADDITIONAL_TARGET_GROUP_PREFIX),
                port: listener.port,
                protocol: listener.protocol,
                vpc_id: vpc_id.clone(),
                health_check: Some(additional_target_group_health_check(listener)),
            },
        }));

        let kind = LoadBalancerKind::v2(
            lb_spec.load_balancer_type,
            V2Config {
                arn: None,
                listeners,
            },
        )
        .ok_or_else(|| {
            Error::Unsupported(format!(
                "load balancer {:?} of type {} is not a listener-based load balancer",
                name, lb_spec.load_balancer_type
            ))
        })?;

        let mut attributes = Attributes::new();
        if !kind.is_network() {
            attributes.insert(
                IDLE_TIMEOUT_ATTRIBUTE.to_string(),
                V2_IDLE_TIMEOUT_SECS.to_string(),
            );
        }
        attributes.insert(
            CROSS_ZONE_ATTRIBUTE.to_string(),
            lb_spec.cross_zone_load_balancing.to_string(),
        );

        let security_group_ids = if kind.supports_security_groups() {
            lb_security_groups(self, lb_spec)
        } else {
            Vec::new()
        };

        let scheme = lb_spec.scheme.unwrap_or_default();
        let (subnet_ids, availability_zones) = self.placement(lb_spec, scheme).await?;

        Ok(LoadBalancer {
            name: name.to_string(),
            scheme,
            kind,
            subnet_ids,
            availability_zones,
            security_group_ids,
            attributes,
            tags: self.desired_tags(name),
            dns_name: String::new(),
        })
    }
}
