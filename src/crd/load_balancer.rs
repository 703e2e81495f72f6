//! ControlPlaneLoadBalancer CRD
//!
//! Declares the load balancer that fronts a cluster's API servers: which
//! family to provision, scheme, subnet placement, extra listeners and
//! health-check overrides. The same spec type is embedded in the cluster
//! configuration file consumed by the standalone reconciler.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::domain::model::LoadBalancer;

// =============================================================================
// ControlPlaneLoadBalancer CRD
// =============================================================================

/// ControlPlaneLoadBalancer describes the load balancer placed in front of
/// the control plane of a cluster.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1alpha1",
    kind = "ControlPlaneLoadBalancer",
    plural = "controlplaneloadbalancers",
    shortname = "cplb",
    status = "ControlPlaneLoadBalancerStatus",
    printcolumn = r#"{"name": "Type", "type": "string", "jsonPath": ".spec.loadBalancerType"}"#,
    printcolumn = r#"{"name": "Scheme", "type": "string", "jsonPath": ".spec.scheme"}"#,
    printcolumn = r#"{"name": "DNS", "type": "string", "jsonPath": ".status.dnsName"}"#,
    printcolumn = r#"{"name": "Ready", "type": "boolean", "jsonPath": ".status.ready"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneLoadBalancerSpec {
    /// Explicit load balancer name; generated from the cluster name when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Load balancer family and kind
    #[serde(default)]
    pub load_balancer_type: LoadBalancerType,

    /// Whether the load balancer is internet-facing or internal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme: Option<Scheme>,

    /// Subnet IDs to attach; selected from the cluster subnets when empty
    #[serde(default)]
    pub subnets: Vec<String>,

    /// Security groups attached in addition to the API server group
    #[serde(default)]
    pub additional_security_groups: Vec<String>,

    /// Listeners exposed next to the API server listener
    #[serde(default)]
    pub additional_listeners: Vec<AdditionalListenerSpec>,

    /// Enable cross-zone load balancing
    #[serde(default)]
    pub cross_zone_load_balancing: bool,

    /// Protocol used for the API server health check (TCP when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check_protocol: Option<Protocol>,

    /// Overrides for the API server target group health check counters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheckOverrides>,

    /// Keep the client source address on forwarded connections
    #[serde(default)]
    pub preserve_client_ip: bool,
}

// =============================================================================
// Sub-Types
// =============================================================================

/// Load balancer kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum LoadBalancerType {
    /// Classic load balancer, identified by name
    #[default]
    Classic,
    /// Network (L4) load balancer
    Nlb,
    /// Application (L7) load balancer
    Alb,
    /// Gateway load balancer
    Gateway,
}

impl LoadBalancerType {
    pub fn is_classic(&self) -> bool {
        matches!(self, LoadBalancerType::Classic)
    }

    /// Path segment used in resource ARNs
    pub fn arn_segment(&self) -> &'static str {
        match self {
            LoadBalancerType::Classic => "",
            LoadBalancerType::Nlb => "net",
            LoadBalancerType::Alb => "app",
            LoadBalancerType::Gateway => "gwy",
        }
    }
}

impl std::fmt::Display for LoadBalancerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadBalancerType::Classic => write!(f, "classic"),
            LoadBalancerType::Nlb => write!(f, "nlb"),
            LoadBalancerType::Alb => write!(f, "alb"),
            LoadBalancerType::Gateway => write!(f, "gateway"),
        }
    }
}

/// Load balancer scheme
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum Scheme {
    #[default]
    InternetFacing,
    Internal,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::InternetFacing => "internet-facing",
            Scheme::Internal => "internal",
        }
    }

    pub fn is_internet_facing(&self) -> bool {
        matches!(self, Scheme::InternetFacing)
    }
}

impl std::fmt::Display for Scheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Listener and health check protocol
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    #[default]
    Tcp,
    Ssl,
    Http,
    Https,
    Tls,
    Udp,
    #[serde(rename = "TCP_UDP")]
    TcpUdp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Ssl => "SSL",
            Protocol::Http => "HTTP",
            Protocol::Https => "HTTPS",
            Protocol::Tls => "TLS",
            Protocol::Udp => "UDP",
            Protocol::TcpUdp => "TCP_UDP",
        }
    }

    /// HTTP-family protocols carry a health check path
    pub fn is_http(&self) -> bool {
        matches!(self, Protocol::Http | Protocol::Https)
    }

    /// Parse a protocol name, ignoring case
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "TCP" => Some(Protocol::Tcp),
            "SSL" => Some(Protocol::Ssl),
            "HTTP" => Some(Protocol::Http),
            "HTTPS" => Some(Protocol::Https),
            "TLS" => Some(Protocol::Tls),
            "UDP" => Some(Protocol::Udp),
            "TCP_UDP" => Some(Protocol::TcpUdp),
            _ => None,
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Extra listener forwarded to the control plane nodes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AdditionalListenerSpec {
    /// Listener port
    pub port: u16,

    /// Listener protocol
    #[serde(default)]
    pub protocol: Protocol,

    /// Health check for this listener's target group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<AdditionalHealthCheck>,
}

/// Health check counter overrides for the API server target group
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_seconds: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unhealthy_threshold_count: Option<u32>,
}

/// Health check declared on an additional listener
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AdditionalHealthCheck {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Protocol>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(flatten)]
    pub counters: HealthCheckOverrides,
}

// =============================================================================
// Status
// =============================================================================

/// Observed state of the control plane load balancer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneLoadBalancerStatus {
    /// Load balancer has been reconciled successfully
    #[serde(default)]
    pub ready: bool,

    /// Name of the load balancer in the cloud
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// DNS name clients connect to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_name: Option<String>,

    /// Resource name of modern-family load balancers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arn: Option<String>,

    /// Attached subnets
    #[serde(default)]
    pub subnet_ids: Vec<String>,

    /// Availability zones covered by the subnets
    #[serde(default)]
    pub availability_zones: Vec<String>,

    /// Last successful reconcile
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconciled: Option<DateTime<Utc>>,
}

impl ControlPlaneLoadBalancerStatus {
    /// Status reflecting a reconciled load balancer
    pub fn from_load_balancer(lb: &LoadBalancer) -> Self {
        Self {
            ready: true,
            name: Some(lb.name.clone()),
            dns_name: (!lb.dns_name.is_empty()).then(|| lb.dns_name.clone()),
            arn: lb.arn().map(str::to_string),
            subnet_ids: lb.subnet_ids.clone(),
            availability_zones: lb.availability_zones.clone(),
            last_reconciled: Some(Utc::now()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn test_spec_defaults() {
        let spec: ControlPlaneLoadBalancerSpec = serde_yaml::from_str("{}").unwrap();
        assert_eq!(spec.load_balancer_type, LoadBalancerType::Classic);
        assert!(spec.scheme.is_none());
        assert!(spec.subnets.is_empty());
        assert!(!spec.cross_zone_load_balancing);
    }

    #[test]
    fn test_spec_from_yaml() {
        let yaml = r#"
loadBalancerType: nlb
scheme: internal
healthCheckProtocol: HTTPS
additionalListeners:
  - port: 2379
    protocol: TCP
  - port: 8443
    protocol: TCP_UDP
    healthCheck:
      protocol: HTTP
      path: /healthz
      intervalSeconds: 15
"#;
        let spec: ControlPlaneLoadBalancerSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.load_balancer_type, LoadBalancerType::Nlb);
        assert_eq!(spec.scheme, Some(Scheme::Internal));
        assert_eq!(spec.health_check_protocol, Some(Protocol::Https));
        assert_eq!(spec.additional_listeners.len(), 2);
        assert_eq!(spec.additional_listeners[1].protocol, Protocol::TcpUdp);

        let hc = spec.additional_listeners[1].health_check.as_ref().unwrap();
        assert_eq!(hc.path.as_deref(), Some("/healthz"));
        assert_eq!(hc.counters.interval_seconds, Some(15));
    }

    #[test]
    fn test_protocol_parse() {
        assert_eq!(Protocol::parse("tcp"), Some(Protocol::Tcp));
        assert_eq!(Protocol::parse("Https"), Some(Protocol::Https));
        assert_eq!(Protocol::parse("tcp_udp"), Some(Protocol::TcpUdp));
        assert_eq!(Protocol::parse("quic"), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", Scheme::InternetFacing), "internet-facing");
        assert_eq!(format!("{}", LoadBalancerType::Nlb), "nlb");
        assert_eq!(format!("{}", Protocol::Https), "HTTPS");
    }

    #[test]
    fn test_crd_generation() {
        let crd = ControlPlaneLoadBalancer::crd();
        assert_eq!(
            crd.metadata.name.as_deref(),
            Some("controlplaneloadbalancers.infrastructure.cluster.x-k8s.io")
        );
    }
}
