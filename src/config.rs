//! Cluster and reconciler configuration
//!
//! `ClusterConfig` is read from a YAML file and implements [`ElbScope`], so
//! the standalone binary and tests drive the reconciler without a
//! management cluster.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::crd::ControlPlaneLoadBalancerSpec;
use crate::domain::{ElbScope, Subnets, Tags, VpcSpec};
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;

/// Default API server port
pub const DEFAULT_API_SERVER_PORT: u16 = 6443;

fn default_namespace() -> String {
    "default".to_string()
}

fn default_api_server_port() -> u16 {
    DEFAULT_API_SERVER_PORT
}

// =============================================================================
// Cluster Configuration
// =============================================================================

/// Published control plane endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiEndpoint {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
}

impl ApiEndpoint {
    pub fn is_valid(&self) -> bool {
        !self.host.is_empty() && self.port != 0
    }
}

/// Everything the reconciler needs to know about one cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    /// Cluster name
    pub name: String,

    #[serde(default = "default_namespace")]
    pub namespace: String,

    pub region: String,

    #[serde(default)]
    pub vpc: VpcSpec,

    #[serde(default)]
    pub subnets: Subnets,

    /// Security group created for the API server load balancer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_server_lb_security_group: Option<String>,

    /// Tags applied to every resource
    #[serde(default)]
    pub additional_tags: Tags,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane_load_balancer: Option<ControlPlaneLoadBalancerSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_control_plane_load_balancer: Option<ControlPlaneLoadBalancerSpec>,

    /// Endpoint already published for the cluster
    #[serde(default)]
    pub control_plane_endpoint: ApiEndpoint,

    #[serde(default = "default_api_server_port")]
    pub api_server_port: u16,

    #[serde(default)]
    pub reconciler: ReconcilerConfig,
}

impl ClusterConfig {
    /// Minimal configuration for `name` in `region`
    pub fn new(name: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: default_namespace(),
            region: region.into(),
            vpc: VpcSpec::default(),
            subnets: Subnets::default(),
            api_server_lb_security_group: None,
            additional_tags: Tags::new(),
            control_plane_load_balancer: None,
            secondary_control_plane_load_balancer: None,
            control_plane_endpoint: ApiEndpoint::default(),
            api_server_port: DEFAULT_API_SERVER_PORT,
            reconciler: ReconcilerConfig::default(),
        }
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: ClusterConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a YAML configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("unable to read {}: {}", path.display(), e))
        })?;
        let config = Self::from_yaml(&yaml)?;
        info!(
            "Loaded cluster configuration {} from {}",
            config.infra_cluster_name(),
            path.display()
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Configuration("cluster name must not be empty".into()));
        }
        if self.region.is_empty() {
            return Err(Error::Configuration("region must not be empty".into()));
        }
        if self.api_server_port == 0 {
            return Err(Error::Configuration("API server port must not be 0".into()));
        }

        if let (Some(primary), Some(secondary)) = (
            &self.control_plane_load_balancer,
            &self.secondary_control_plane_load_balancer,
        ) {
            if secondary.load_balancer_type.is_classic() {
                return Err(Error::Configuration(
                    "secondary control plane load balancer cannot be classic".into(),
                ));
            }
            if primary.name.is_some() && primary.name == secondary.name {
                return Err(Error::Configuration(
                    "primary and secondary load balancers must have different names".into(),
                ));
            }
        }

        for spec in self.control_plane_load_balancers() {
            for listener in &spec.additional_listeners {
                if listener.port == DEFAULT_API_SERVER_PORT {
                    return Err(Error::Configuration(format!(
                        "additional listener port {} conflicts with the API server listener",
                        listener.port
                    )));
                }
            }
        }
        Ok(())
    }
}

impl ElbScope for ClusterConfig {
    fn name(&self) -> &str {
        &self.name
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn region(&self) -> &str {
        &self.region
    }

    fn vpc(&self) -> &VpcSpec {
        &self.vpc
    }

    fn subnets(&self) -> &Subnets {
        &self.subnets
    }

    fn api_server_lb_security_group(&self) -> Option<&str> {
        self.api_server_lb_security_group.as_deref()
    }

    fn additional_tags(&self) -> &Tags {
        &self.additional_tags
    }

    fn control_plane_load_balancer(&self) -> Option<&ControlPlaneLoadBalancerSpec> {
        self.control_plane_load_balancer.as_ref()
    }

    fn secondary_control_plane_load_balancer(&self) -> Option<&ControlPlaneLoadBalancerSpec> {
        self.secondary_control_plane_load_balancer.as_ref()
    }

    fn control_plane_endpoint_valid(&self) -> bool {
        self.control_plane_endpoint.is_valid()
    }

    fn api_server_port(&self) -> u16 {
        self.api_server_port
    }

    fn max_wait(&self) -> Duration {
        Duration::from_secs(self.reconciler.max_wait_secs)
    }
}

// =============================================================================
// Reconciler Configuration
// =============================================================================

/// Retry schedule and wait bounds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconcilerConfig {
    pub initial_interval_ms: u64,
    pub multiplier: f64,
    pub max_interval_secs: u64,
    pub max_elapsed_secs: u64,
    pub max_attempts: u32,
    /// Upper bound for a new load balancer to become available
    pub max_wait_secs: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: 1000,
            multiplier: 2.0,
            max_interval_secs: 30,
            max_elapsed_secs: 300,
            max_attempts: 32,
            max_wait_secs: 900,
        }
    }
}

impl ReconcilerConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_interval: Duration::from_millis(self.initial_interval_ms),
            multiplier: self.multiplier,
            max_interval: Duration::from_secs(self.max_interval_secs),
            max_elapsed: Some(Duration::from_secs(self.max_elapsed_secs)),
            max_attempts: self.max_attempts,
            ..RetryPolicy::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{LoadBalancerType, Scheme};
    use assert_matches::assert_matches;
    use std::io::Write;

    const CLUSTER_YAML: &str = r#"
name: prod
namespace: infra
region: us-west-2
vpc:
  id: vpc-0123
  ipv6: true
subnets:
  - id: subnet-a
    availabilityZone: us-west-2a
  - id: subnet-b
    availabilityZone: us-west-2b
    isPublic: true
apiServerLbSecurityGroup: sg-apiserver
additionalTags:
  team: platform
controlPlaneLoadBalancer:
  scheme: internal
secondaryControlPlaneLoadBalancer:
  loadBalancerType: nlb
  name: prod-internal
controlPlaneEndpoint:
  host: prod.example.com
  port: 6443
reconciler:
  maxWaitSecs: 60
"#;

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(CLUSTER_YAML.as_bytes()).unwrap();

        let config = ClusterConfig::load(file.path()).unwrap();
        assert_eq!(config.infra_cluster_name(), "infra/prod");
        assert_eq!(config.subnets.private().count(), 1);
        assert_eq!(config.api_server_lb_security_group(), Some("sg-apiserver"));
        assert!(config.control_plane_endpoint_valid());
        assert_eq!(config.max_wait(), Duration::from_secs(60));
        assert_eq!(config.reconciler.max_attempts, 32);

        let specs = config.control_plane_load_balancers();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].scheme, Some(Scheme::Internal));
        assert_eq!(specs[1].load_balancer_type, LoadBalancerType::Nlb);
    }

    #[test]
    fn test_primary_defaults_to_classic() {
        let config = ClusterConfig::new("dev", "us-east-1");
        let specs = config.control_plane_load_balancers();
        assert_eq!(specs.len(), 1);
        assert!(specs[0].load_balancer_type.is_classic());
        assert!(!config.control_plane_endpoint_valid());
    }

    #[test]
    fn test_validation() {
        let err = ClusterConfig::from_yaml("name: ''\nregion: us-east-1\n").unwrap_err();
        assert_matches!(err, Error::Configuration(_));

        let yaml = r#"
name: prod
region: us-east-1
secondaryControlPlaneLoadBalancer:
  loadBalancerType: classic
"#;
        assert_matches!(
            ClusterConfig::from_yaml(yaml).unwrap_err(),
            Error::Configuration(_)
        );

        let yaml = r#"
name: prod
region: us-east-1
controlPlaneLoadBalancer:
  loadBalancerType: nlb
  additionalListeners:
    - port: 6443
"#;
        assert_matches!(
            ClusterConfig::from_yaml(yaml).unwrap_err(),
            Error::Configuration(_)
        );
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = ClusterConfig::load(dir.path().join("missing.yaml")).unwrap_err();
        assert_matches!(err, Error::Configuration(_));
    }

    #[test]
    fn test_retry_policy_from_config() {
        let policy = ReconcilerConfig::default().retry_policy();
        assert_eq!(policy.initial_interval, Duration::from_secs(1));
        assert_eq!(policy.max_elapsed, Some(Duration::from_secs(300)));
    }
}
