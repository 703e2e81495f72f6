//! Resource tags and the ownership convention
//!
//! A load balancer is managed by this reconciler iff it carries
//! `sigs.k8s.io/cluster-api-provider-aws/cluster/<cluster>=owned`.
//! Load balancers created by the in-cluster cloud provider carry the
//! narrower `kubernetes.io/cluster/<cluster>=owned` tag instead.

use std::collections::BTreeMap;

/// Tag set on a cloud resource
pub type Tags = BTreeMap<String, String>;

pub const NAME_TAG_KEY: &str = "Name";
pub const ROLE_TAG_KEY: &str = "sigs.k8s.io/cluster-api-provider-aws/role";
pub const APISERVER_ROLE: &str = "apiserver";

const CLUSTER_TAG_PREFIX: &str = "sigs.k8s.io/cluster-api-provider-aws/cluster/";
const CLOUD_PROVIDER_TAG_PREFIX: &str = "kubernetes.io/cluster/";

/// Ownership of a tagged resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceLifecycle {
    /// Created and deleted by the cluster
    Owned,
}

impl ResourceLifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceLifecycle::Owned => "owned",
        }
    }
}

/// Ownership tag key for a cluster
pub fn cluster_tag_key(cluster: &str) -> String {
    format!("{}{}", CLUSTER_TAG_PREFIX, cluster)
}

/// Ownership tag key applied by the in-cluster cloud provider
pub fn cloud_provider_tag_key(cluster: &str) -> String {
    format!("{}{}", CLOUD_PROVIDER_TAG_PREFIX, cluster)
}

/// Check whether `tags` mark the resource as owned by `cluster`
pub fn is_owned(tags: &Tags, cluster: &str) -> bool {
    tags.get(&cluster_tag_key(cluster)).map(String::as_str)
        == Some(ResourceLifecycle::Owned.as_str())
}

/// Inputs for building the tags of a cluster resource
#[derive(Debug, Clone)]
pub struct BuildParams<'a> {
    pub cluster_name: &'a str,
    pub lifecycle: ResourceLifecycle,
    pub name: Option<&'a str>,
    pub role: Option<&'a str>,
    pub additional: &'a Tags,
}

impl<'a> BuildParams<'a> {
    pub fn owned(cluster_name: &'a str, additional: &'a Tags) -> Self {
        Self {
            cluster_name,
            lifecycle: ResourceLifecycle::Owned,
            name: None,
            role: None,
            additional,
        }
    }

    pub fn with_name(mut self, name: &'a str) -> Self {
        self.name = Some(name);
        self
    }

    pub fn with_role(mut self, role: &'a str) -> Self {
        self.role = Some(role);
        self
    }
}

/// Build the tag set: user tags first, then the ownership, name and role tags
pub fn build(params: BuildParams<'_>) -> Tags {
    let mut tags = params.additional.clone();
    tags.insert(
        cluster_tag_key(params.cluster_name),
        params.lifecycle.as_str().to_string(),
    );
    if let Some(name) = params.name {
        tags.insert(NAME_TAG_KEY.to_string(), name.to_string());
    }
    if let Some(role) = params.role {
        tags.insert(ROLE_TAG_KEY.to_string(), role.to_string());
    }
    tags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_overrides_user_tags() {
        let mut additional = Tags::new();
        additional.insert("team".to_string(), "platform".to_string());
        additional.insert(NAME_TAG_KEY.to_string(), "user-supplied".to_string());

        let tags = build(
            BuildParams::owned("prod", &additional)
                .with_name("prod-apiserver")
                .with_role(APISERVER_ROLE),
        );

        assert_eq!(tags.get("team").map(String::as_str), Some("platform"));
        assert_eq!(
            tags.get(NAME_TAG_KEY).map(String::as_str),
            Some("prod-apiserver")
        );
        assert_eq!(
            tags.get(ROLE_TAG_KEY).map(String::as_str),
            Some(APISERVER_ROLE)
        );
        assert!(is_owned(&tags, "prod"));
        assert!(!is_owned(&tags, "staging"));
    }

    #[test]
    fn test_cloud_provider_tag_is_not_ownership() {
        let mut tags = Tags::new();
        tags.insert(cloud_provider_tag_key("prod"), "owned".to_string());
        assert!(!is_owned(&tags, "prod"));

        tags.insert(cluster_tag_key("prod"), "shared".to_string());
        assert!(!is_owned(&tags, "prod"));
    }
}
