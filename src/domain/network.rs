//! Cluster network description consumed by the spec builder

use serde::{Deserialize, Serialize};

/// VPC the cluster lives in
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VpcSpec {
    /// VPC ID; load balancers found in another VPC are rejected
    #[serde(default)]
    pub id: String,

    /// VPC has an IPv6 CIDR; load balancers are created dual-stack
    #[serde(default)]
    pub ipv6: bool,

    /// Public IPv4 pool used to assign addresses to internet-facing network LBs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elastic_ip_pool: Option<ElasticIpPool>,
}

impl VpcSpec {
    pub fn public_ipv4_pool(&self) -> Option<&str> {
        self.elastic_ip_pool
            .as_ref()
            .and_then(|p| p.public_ipv4_pool.as_deref())
    }

    pub fn fallback_to_provider_pool(&self) -> bool {
        self.elastic_ip_pool
            .as_ref()
            .is_some_and(|p| p.fallback_to_provider_pool)
    }
}

/// Bring-your-own-IP address pool
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElasticIpPool {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_ipv4_pool: Option<String>,

    /// Allocate from the provider's pool once the custom pool is exhausted
    #[serde(default)]
    pub fallback_to_provider_pool: bool,
}

/// A subnet known to the cluster
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubnetSpec {
    /// Cluster-level subnet identifier
    pub id: String,

    /// Provider resource ID when it differs from `id`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,

    pub availability_zone: String,

    #[serde(default)]
    pub is_public: bool,

    /// Subnet is reserved for pod networking and never hosts load balancers
    #[serde(default)]
    pub cni_only: bool,
}

impl SubnetSpec {
    /// Provider-facing ID of the subnet
    pub fn resource_id(&self) -> &str {
        self.resource_id.as_deref().unwrap_or(&self.id)
    }

    fn matches(&self, id: &str) -> bool {
        self.id == id || self.resource_id.as_deref() == Some(id)
    }
}

/// Ordered list of cluster subnets
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Subnets(pub Vec<SubnetSpec>);

impl Subnets {
    pub fn iter(&self) -> impl Iterator<Item = &SubnetSpec> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn private(&self) -> impl Iterator<Item = &SubnetSpec> {
        self.0.iter().filter(|s| !s.is_public && !s.cni_only)
    }

    pub fn public(&self) -> impl Iterator<Item = &SubnetSpec> {
        self.0.iter().filter(|s| s.is_public && !s.cni_only)
    }

    /// Find a subnet by cluster ID or provider resource ID
    pub fn find(&self, id: &str) -> Option<&SubnetSpec> {
        self.0.iter().find(|s| s.matches(id))
    }
}

impl From<Vec<SubnetSpec>> for Subnets {
    fn from(subnets: Vec<SubnetSpec>) -> Self {
        Subnets(subnets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subnet(id: &str, az: &str, public: bool) -> SubnetSpec {
        SubnetSpec {
            id: id.to_string(),
            availability_zone: az.to_string(),
            is_public: public,
            ..Default::default()
        }
    }

    #[test]
    fn test_subnet_filters_skip_cni() {
        let mut cni = subnet("subnet-cni", "us-east-1a", false);
        cni.cni_only = true;
        let subnets = Subnets(vec![
            subnet("subnet-a", "us-east-1a", false),
            cni,
            subnet("subnet-pub", "us-east-1a", true),
        ]);

        let private: Vec<_> = subnets.private().map(|s| s.id.as_str()).collect();
        assert_eq!(private, vec!["subnet-a"]);

        let public: Vec<_> = subnets.public().map(|s| s.id.as_str()).collect();
        assert_eq!(public, vec!["subnet-pub"]);
    }

    #[test]
    fn test_find_by_resource_id() {
        let mut sn = subnet("cluster-subnet-1", "us-east-1b", false);
        sn.resource_id = Some("subnet-0abc".to_string());
        let subnets = Subnets(vec![sn]);

        assert_eq!(
            subnets.find("subnet-0abc").map(|s| s.resource_id()),
            Some("subnet-0abc")
        );
        assert!(subnets.find("cluster-subnet-1").is_some());
        assert!(subnets.find("subnet-missing").is_none());
    }

    #[test]
    fn test_public_ipv4_pool() {
        let vpc = VpcSpec {
            id: "vpc-1".to_string(),
            elastic_ip_pool: Some(ElasticIpPool {
                public_ipv4_pool: Some("ipv4pool-ec2-1".to_string()),
                fallback_to_provider_pool: false,
            }),
            ..Default::default()
        };
        assert_eq!(vpc.public_ipv4_pool(), Some("ipv4pool-ec2-1"));
        assert_eq!(VpcSpec::default().public_ipv4_pool(), None);
    }
}
