//! Load balancer model shared by both families
//!
//! The same `LoadBalancer` value describes both the desired state produced
//! by the spec builder and the actual state rebuilt from the provider. Family
//! specific data lives in [`LoadBalancerKind`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use super::tags::{self, Tags};
use crate::crd::{LoadBalancerType, Protocol, Scheme};

/// Load balancer attributes, keyed by provider attribute name
pub type Attributes = BTreeMap<String, String>;

pub const IDLE_TIMEOUT_ATTRIBUTE: &str = "idle_timeout.timeout_seconds";
pub const CROSS_ZONE_ATTRIBUTE: &str = "load_balancing.cross_zone.enabled";

// =============================================================================
// Classic Family
// =============================================================================

/// Listener of a classic load balancer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassicListener {
    pub protocol: Protocol,
    pub port: u16,
    pub instance_protocol: Protocol,
    pub instance_port: u16,
}

/// Health check of a classic load balancer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassicHealthCheck {
    /// `PROTO:PORT[/path]`
    pub target: String,
    pub interval: Duration,
    pub timeout: Duration,
    pub healthy_threshold: u32,
    pub unhealthy_threshold: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassicConfig {
    pub listeners: Vec<ClassicListener>,
    pub health_check: Option<ClassicHealthCheck>,
}

// =============================================================================
// Modern Family
// =============================================================================

/// Target group health check; unset fields take provider defaults
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetGroupHealthCheck {
    pub protocol: Option<Protocol>,
    pub port: Option<String>,
    pub path: Option<String>,
    pub interval_seconds: Option<u32>,
    pub timeout_seconds: Option<u32>,
    pub threshold_count: Option<u32>,
    pub unhealthy_threshold_count: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetGroupSpec {
    pub name: String,
    pub port: u16,
    pub protocol: Protocol,
    pub vpc_id: String,
    pub health_check: Option<TargetGroupHealthCheck>,
}

/// Forwarding listener and the target group behind it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listener {
    pub protocol: Protocol,
    pub port: u16,
    pub target_group: TargetGroupSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct V2Config {
    /// Provider handle; known once the load balancer exists
    pub arn: Option<String>,
    pub listeners: Vec<Listener>,
}

// =============================================================================
// Load Balancer
// =============================================================================

/// Family and kind of a load balancer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LoadBalancerKind {
    Classic(ClassicConfig),
    Network(V2Config),
    Application(V2Config),
    Gateway(V2Config),
}

impl LoadBalancerKind {
    /// Modern-family kind for `lb_type`; `None` for the classic type
    pub fn v2(lb_type: LoadBalancerType, config: V2Config) -> Option<Self> {
        match lb_type {
            LoadBalancerType::Classic => None,
            LoadBalancerType::Nlb => Some(LoadBalancerKind::Network(config)),
            LoadBalancerType::Alb => Some(LoadBalancerKind::Application(config)),
            LoadBalancerType::Gateway => Some(LoadBalancerKind::Gateway(config)),
        }
    }

    pub fn load_balancer_type(&self) -> LoadBalancerType {
        match self {
            LoadBalancerKind::Classic(_) => LoadBalancerType::Classic,
            LoadBalancerKind::Network(_) => LoadBalancerType::Nlb,
            LoadBalancerKind::Application(_) => LoadBalancerType::Alb,
            LoadBalancerKind::Gateway(_) => LoadBalancerType::Gateway,
        }
    }

    pub fn classic(&self) -> Option<&ClassicConfig> {
        match self {
            LoadBalancerKind::Classic(config) => Some(config),
            _ => None,
        }
    }

    pub fn v2_config(&self) -> Option<&V2Config> {
        match self {
            LoadBalancerKind::Classic(_) => None,
            LoadBalancerKind::Network(config)
            | LoadBalancerKind::Application(config)
            | LoadBalancerKind::Gateway(config) => Some(config),
        }
    }

    fn v2_config_mut(&mut self) -> Option<&mut V2Config> {
        match self {
            LoadBalancerKind::Classic(_) => None,
            LoadBalancerKind::Network(config)
            | LoadBalancerKind::Application(config)
            | LoadBalancerKind::Gateway(config) => Some(config),
        }
    }

    pub fn is_network(&self) -> bool {
        matches!(self, LoadBalancerKind::Network(_))
    }

    /// Network load balancers do not take part in security group reconciliation
    pub fn supports_security_groups(&self) -> bool {
        !self.is_network()
    }
}

/// Desired or observed state of a load balancer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancer {
    pub name: String,
    pub scheme: Scheme,
    pub kind: LoadBalancerKind,
    pub subnet_ids: Vec<String>,
    pub availability_zones: Vec<String>,
    pub security_group_ids: Vec<String>,
    pub attributes: Attributes,
    pub tags: Tags,
    pub dns_name: String,
}

impl LoadBalancer {
    /// Provider handle of a modern-family load balancer
    pub fn arn(&self) -> Option<&str> {
        self.kind.v2_config().and_then(|c| c.arn.as_deref())
    }

    /// Copy of this value carrying `arn`; classic load balancers are returned as-is
    pub fn with_arn(mut self, arn: impl Into<String>) -> Self {
        if let Some(config) = self.kind.v2_config_mut() {
            config.arn = Some(arn.into());
        }
        self
    }

    pub fn listeners(&self) -> &[Listener] {
        self.kind
            .v2_config()
            .map(|c| c.listeners.as_slice())
            .unwrap_or(&[])
    }

    pub fn classic_health_check(&self) -> Option<&ClassicHealthCheck> {
        self.kind.classic().and_then(|c| c.health_check.as_ref())
    }

    pub fn is_managed(&self, cluster: &str) -> bool {
        tags::is_owned(&self.tags, cluster)
    }

    /// Existing load balancer that belongs to someone else
    pub fn is_unmanaged(&self, cluster: &str) -> bool {
        !self.name.is_empty() && !self.is_managed(cluster)
    }
}

/// Instance placed behind a load balancer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub subnet_id: String,
    /// Primary private address, used for IP-typed target groups
    #[serde(default)]
    pub private_ip: Option<String>,
}

impl Instance {
    pub fn new(id: impl Into<String>, subnet_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            subnet_id: subnet_id.into(),
            private_ip: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn network_lb(tags: Tags) -> LoadBalancer {
        LoadBalancer {
            name: "default-prod-apiserver".to_string(),
            scheme: Scheme::Internal,
            kind: LoadBalancerKind::Network(V2Config::default()),
            subnet_ids: vec![],
            availability_zones: vec![],
            security_group_ids: vec![],
            attributes: Attributes::new(),
            tags,
            dns_name: String::new(),
        }
    }

    #[test]
    fn test_kind_from_type() {
        assert!(LoadBalancerKind::v2(LoadBalancerType::Classic, V2Config::default()).is_none());

        let kind = LoadBalancerKind::v2(LoadBalancerType::Alb, V2Config::default()).unwrap();
        assert_eq!(kind.load_balancer_type(), LoadBalancerType::Alb);
        assert!(kind.supports_security_groups());

        let kind = LoadBalancerKind::v2(LoadBalancerType::Nlb, V2Config::default()).unwrap();
        assert!(kind.is_network());
        assert!(!kind.supports_security_groups());
    }

    #[test]
    fn test_with_arn() {
        let lb = network_lb(Tags::new()).with_arn("arn:aws:elasticloadbalancing:us-east-1:1:loadbalancer/net/x/1");
        assert!(lb.arn().unwrap().ends_with("net/x/1"));
    }

    #[test]
    fn test_ownership() {
        let mut tags = Tags::new();
        tags.insert(tags::cluster_tag_key("prod"), "owned".to_string());

        let lb = network_lb(tags);
        assert!(lb.is_managed("prod"));
        assert!(!lb.is_unmanaged("prod"));
        assert!(lb.is_unmanaged("other"));

        let mut unnamed = network_lb(Tags::new());
        unnamed.name.clear();
        assert!(!unnamed.is_unmanaged("prod"));
    }
}
