//! Deletion of the cluster's load balancers
//!
//! Teardown runs in a fixed order:
//! 1. The primary classic load balancer
//! 2. Classic load balancers the in-cluster cloud provider created for
//!    `LoadBalancer` services
//! 3. Every declared network, application or gateway load balancer, with
//!    listeners removed before target groups
//!
//! Each step waits until the provider no longer reports what it deleted.

use tracing::{debug, info, warn};

use super::Service;
use crate::cloud::errors::translate;
use crate::crd::ControlPlaneLoadBalancerSpec;
use crate::domain::tags::{cloud_provider_tag_key, ResourceLifecycle};
use crate::domain::LOAD_BALANCER_RESOURCE_TYPE;
use crate::error::{Error, Result, ResultExt};
use crate::naming;
use crate::retry::retry_until;

/// Maximum number of names accepted by one classic describe-tags call
const DESCRIBE_TAGS_CHUNK: usize = 20;

/// Classic load balancer name from a load balancer ARN
///
/// Returns `None` for malformed ARNs and for network or application load
/// balancers, which are left to the cloud provider's own cleanup.
fn classic_name_from_arn(arn: &str) -> Option<String> {
    let resource = arn.splitn(6, ':').nth(5)?;
    if resource.contains("loadbalancer/net/") || resource.contains("loadbalancer/app/") {
        return None;
    }
    let name = resource.replace("loadbalancer/", "");
    (!name.is_empty()).then_some(name)
}

impl Service {
    /// Delete every load balancer the cluster owns
    pub async fn delete_load_balancers(&self) -> Result<()> {
        debug!("Deleting load balancers for cluster {}", self.scope.infra_cluster_name());

        self.delete_api_server_elb()
            .await
            .context("failed to delete control plane load balancer")?;

        self.delete_cloud_provider_elbs()
            .await
            .context("failed to delete cloud provider load balancer(s)")?;

        self.delete_existing_v2()
            .await
            .context("failed to delete cloud provider load balancer(s)")?;

        Ok(())
    }

    fn deletion_timeout(&self, what: &str) -> Error {
        Error::Timeout(format!(
            "failed to wait for {:?} load balancer deletion in cluster {}",
            what,
            self.scope.infra_cluster_name()
        ))
    }

    async fn delete_api_server_elb(&self) -> Result<()> {
        let name = naming::elb_name(self.scope.as_ref())
            .context("failed to get control plane load balancer name")?;
        let _guard = self.locks.lock(&name).await;
        let lb_spec = self.scope.control_plane_load_balancer().cloned().unwrap_or_default();

        let lb = match self.describe_classic(&name, &lb_spec).await {
            Ok(lb) => lb,
            Err(e) if e.is_not_found() => {
                debug!("Control plane load balancer {} not found, skipping deletion", name);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if lb.is_unmanaged(self.scope.name()) {
            debug!("Found unmanaged classic load balancer {}, skipping deletion", name);
            return Ok(());
        }

        self.delete_classic(&name).await?;

        let name_ref = name.as_str();
        let lb_spec = &lb_spec;
        retry_until(&self.retry, || async move {
            Ok(matches!(
                self.describe_classic(name_ref, lb_spec).await,
                Err(e) if e.is_not_found()
            ))
        })
        .await
        .map_err(|_| self.deletion_timeout(&name))?;

        info!("Deleted control plane load balancer: {}", name);
        Ok(())
    }

    async fn delete_classic(&self, name: &str) -> Result<()> {
        self.elb
            .delete_load_balancer(name)
            .await
            .map_err(translate)
            .with_context(|| format!("failed to delete classic load balancer {:?}", name))?;
        self.mutated("elb:delete_load_balancer");
        Ok(())
    }

    async fn delete_cloud_provider_elbs(&self) -> Result<()> {
        let owned = self.list_cloud_provider_owned_elbs().await?;
        for name in &owned {
            debug!("Deleting cloud provider load balancer {}", name);
            self.delete_classic(name).await?;
        }
        if !owned.is_empty() {
            info!("Deleted {} cloud provider load balancers", owned.len());
        }

        retry_until(&self.retry, || async move {
            Ok(self.list_cloud_provider_owned_elbs().await?.is_empty())
        })
        .await
        .map_err(|e| match e {
            Error::Timeout(_) => self.deletion_timeout(self.scope.name()),
            other => other,
        })
    }

    /// Names of classic load balancers owned by the in-cluster cloud provider
    pub(super) async fn list_cloud_provider_owned_elbs(&self) -> Result<Vec<String>> {
        let tag_key = cloud_provider_tag_key(self.scope.name());
        match self.list_by_tag(&tag_key).await {
            Ok(names) => Ok(names),
            Err(e) => {
                // The tagging API is unavailable in air-gapped regions
                warn!("Listing load balancers by tag failed, scanning all of them: {}", e);
                self.filter_by_owned_tag(&tag_key).await
            }
        }
    }

    async fn list_by_tag(&self, tag_key: &str) -> Result<Vec<String>> {
        let arns = self
            .tagging
            .get_resources(
                LOAD_BALANCER_RESOURCE_TYPE,
                tag_key,
                &[ResourceLifecycle::Owned.as_str().to_string()],
            )
            .await
            .map_err(translate)
            .with_context(|| format!("failed to list {} load balancers by tag", self.scope.name()))?;

        Ok(arns
            .iter()
            .filter_map(|arn| {
                let name = classic_name_from_arn(arn);
                if name.is_none() {
                    debug!("Ignoring load balancer {} found by tag {}", arn, tag_key);
                }
                name
            })
            .collect())
    }

    async fn filter_by_owned_tag(&self, tag_key: &str) -> Result<Vec<String>> {
        let names: Vec<String> = self
            .elb
            .describe_load_balancers(&[])
            .await
            .map_err(translate)?
            .into_iter()
            .map(|d| d.name)
            .collect();

        let mut owned = Vec::new();
        for chunk in names.chunks(DESCRIBE_TAGS_CHUNK) {
            let descriptions = self.elb.describe_tags(chunk).await.map_err(translate)?;
            owned.extend(
                descriptions
                    .into_iter()
                    .filter(|d| {
                        d.tags.get(tag_key).map(String::as_str)
                            == Some(ResourceLifecycle::Owned.as_str())
                    })
                    .map(|d| d.resource),
            );
        }
        Ok(owned)
    }

    async fn delete_existing_v2(&self) -> Result<()> {
        let mut errors = Vec::new();
        for lb_spec in self.scope.control_plane_load_balancers() {
            if lb_spec.load_balancer_type.is_classic() {
                continue;
            }
            if let Err(e) = self.delete_v2(&lb_spec).await {
                errors.push(e);
            }
        }
        Error::aggregate(errors)
    }

    async fn delete_v2(&self, lb_spec: &ControlPlaneLoadBalancerSpec) -> Result<()> {
        let name = naming::lb_name(self.scope.as_ref(), lb_spec)
            .context("failed to get control plane load balancer name")?;
        let _guard = self.locks.lock(&name).await;

        let lb = match self.describe_v2(&name, lb_spec).await {
            Ok(lb) => lb,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        if lb.is_unmanaged(self.scope.name()) {
            debug!("Found unmanaged load balancer {}, skipping deletion", name);
            return Ok(());
        }
        let arn = lb
            .arn()
            .ok_or_else(|| Error::Internal(format!("load balancer {:?} has no ARN", name)))?;

        // Groups are no longer associated with the load balancer once its
        // listeners are gone, so gather both first
        let groups = self
            .elbv2
            .describe_target_groups(arn)
            .await
            .map_err(translate)
            .context("failed to gather target groups")?;
        let listeners = self
            .elbv2
            .describe_listeners(arn)
            .await
            .map_err(translate)
            .context("failed to gather listeners")?;

        for listener in &listeners {
            debug!("Deleting listener {}", listener.arn);
            self.elbv2
                .delete_listener(&listener.arn)
                .await
                .map_err(translate)
                .with_context(|| format!("failed to delete listener {:?}", listener.arn))?;
            self.mutated("elbv2:delete_listener");
        }
        for group in &groups {
            debug!("Deleting target group {}", group.name);
            self.elbv2
                .delete_target_group(&group.arn)
                .await
                .map_err(translate)
                .with_context(|| format!("failed to delete target group {:?}", group.name))?;
            self.mutated("elbv2:delete_target_group");
        }

        self.elbv2
            .delete_load_balancer(arn)
            .await
            .map_err(translate)
            .with_context(|| format!("failed to delete load balancer {:?}", name))?;
        self.mutated("elbv2:delete_load_balancer");

        let name_ref = name.as_str();
        retry_until(&self.retry, || async move {
            Ok(matches!(
                self.describe_v2(name_ref, lb_spec).await,
                Err(e) if e.is_not_found()
            ))
        })
        .await
        .map_err(|_| self.deletion_timeout(&name))?;

        info!("Deleted control plane load balancer: {}", name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::errors as codes;
    use crate::crd::{AdditionalListenerSpec, LoadBalancerType, Protocol, Scheme};
    use crate::domain::{ClassicLoadBalancerDescription, Tags};
    use crate::elb::testing::Fixture;

    fn cloud_provider_elb(name: &str) -> ClassicLoadBalancerDescription {
        ClassicLoadBalancerDescription {
            name: name.to_string(),
            dns_name: format!("{}.elb.amazonaws.com", name),
            scheme: Scheme::InternetFacing,
            vpc_id: Some("vpc-test".to_string()),
            subnets: vec!["subnet-pub-a".to_string()],
            availability_zones: vec!["us-east-1a".to_string()],
            security_groups: vec![],
            listeners: vec![],
            health_check: None,
            instances: vec![],
        }
    }

    fn owned_by_service(cluster: &str) -> Tags {
        Tags::from([(cloud_provider_tag_key(cluster), "owned".to_string())])
    }

    #[test]
    fn test_classic_name_from_arn() {
        assert_eq!(
            classic_name_from_arn("arn:aws:elasticloadbalancing:us-east-1:000000000000:loadbalancer/a1b2c3"),
            Some("a1b2c3".to_string())
        );
        assert_eq!(
            classic_name_from_arn(
                "arn:aws:elasticloadbalancing:us-east-1:000000000000:loadbalancer/net/svc/0123"
            ),
            None
        );
        assert_eq!(
            classic_name_from_arn(
                "arn:aws:elasticloadbalancing:us-east-1:000000000000:loadbalancer/app/svc/0123"
            ),
            None
        );
        assert_eq!(classic_name_from_arn("not-an-arn"), None);
    }

    #[tokio::test]
    async fn test_delete_everything() {
        let fixture = Fixture::with_config(|config| {
            config.secondary_control_plane_load_balancer = Some(ControlPlaneLoadBalancerSpec {
                name: Some("test-internal".to_string()),
                load_balancer_type: LoadBalancerType::Nlb,
                scheme: Some(Scheme::Internal),
                ..Default::default()
            });
        });
        let service = fixture.service();
        service.reconcile_load_balancers().await.unwrap();
        fixture
            .cloud
            .insert_classic_load_balancer(cloud_provider_elb("a1b2c3"), owned_by_service("test"));
        fixture
            .cloud
            .insert_classic_load_balancer(cloud_provider_elb("other"), owned_by_service("other"));

        fixture.cloud.clear_calls();
        service.delete_load_balancers().await.unwrap();

        assert_eq!(fixture.cloud.classic_names(), vec!["other"]);
        assert!(fixture.cloud.load_balancer("test-internal").is_none());
        assert!(fixture.cloud.target_groups().is_empty());
        assert!(fixture.cloud.listeners().is_empty());
        assert_eq!(
            fixture.cloud.mutating_calls(),
            vec![
                "elb:delete_load_balancer",
                "elb:delete_load_balancer",
                "elbv2:delete_listener",
                "elbv2:delete_target_group",
                "elbv2:delete_load_balancer",
            ]
        );

        // Nothing left to do
        fixture.cloud.clear_calls();
        service.delete_load_balancers().await.unwrap();
        assert!(fixture.cloud.mutating_calls().is_empty());
    }

    #[tokio::test]
    async fn test_listeners_go_before_target_groups() {
        let fixture = Fixture::with_config(|config| {
            config.control_plane_load_balancer = Some(ControlPlaneLoadBalancerSpec {
                load_balancer_type: LoadBalancerType::Nlb,
                scheme: Some(Scheme::Internal),
                additional_listeners: vec![
                    AdditionalListenerSpec {
                        port: 2379,
                        protocol: Protocol::Tcp,
                        ..Default::default()
                    },
                    AdditionalListenerSpec {
                        port: 8132,
                        protocol: Protocol::Tcp,
                        ..Default::default()
                    },
                ],
                ..Default::default()
            });
        });
        let service = fixture.service();
        service.reconcile_load_balancers().await.unwrap();
        assert_eq!(fixture.cloud.listeners().len(), 3);
        assert_eq!(fixture.cloud.target_groups().len(), 3);

        fixture.cloud.clear_calls();
        service.delete_load_balancers().await.unwrap();

        assert_eq!(
            fixture.cloud.mutating_calls(),
            vec![
                "elbv2:delete_listener",
                "elbv2:delete_listener",
                "elbv2:delete_listener",
                "elbv2:delete_target_group",
                "elbv2:delete_target_group",
                "elbv2:delete_target_group",
                "elbv2:delete_load_balancer",
            ]
        );
        assert!(fixture.cloud.listeners().is_empty());
        assert!(fixture.cloud.target_groups().is_empty());
    }

    #[tokio::test]
    async fn test_orphan_scan_falls_back_to_describe() {
        let fixture = Fixture::new();
        fixture
            .cloud
            .insert_classic_load_balancer(cloud_provider_elb("a1b2c3"), owned_by_service("test"));
        fixture
            .cloud
            .inject_error("tagging:get_resources", codes::ACCESS_DENIED);

        let names = fixture.service().list_cloud_provider_owned_elbs().await.unwrap();
        assert_eq!(names, vec!["a1b2c3"]);
        assert!(fixture.cloud.calls().contains(&"elb:describe_tags".to_string()));
    }

    #[tokio::test]
    async fn test_orphan_scan_chunks_describe_tags() {
        let fixture = Fixture::new();
        for i in 0..45 {
            let name = format!("svc-{:02}", i);
            let tags = if i % 2 == 0 {
                owned_by_service("test")
            } else {
                Tags::new()
            };
            fixture
                .cloud
                .insert_classic_load_balancer(cloud_provider_elb(&name), tags);
        }
        fixture
            .cloud
            .inject_error("tagging:get_resources", codes::ACCESS_DENIED);

        let names = fixture.service().list_cloud_provider_owned_elbs().await.unwrap();
        assert_eq!(names.len(), 23);
        assert_eq!(
            fixture
                .cloud
                .calls()
                .iter()
                .filter(|c| *c == "elb:describe_tags")
                .count(),
            3
        );
    }

    #[tokio::test]
    async fn test_unmanaged_primary_is_kept() {
        let fixture = Fixture::new();
        fixture.cloud.insert_classic_load_balancer(
            cloud_provider_elb("test-apiserver"),
            Tags::from([("team".to_string(), "platform".to_string())]),
        );

        fixture.service().delete_load_balancers().await.unwrap();
        assert_eq!(fixture.cloud.classic_names(), vec!["test-apiserver"]);
    }

    #[tokio::test]
    async fn test_listener_failure_stops_v2_teardown() {
        let fixture = Fixture::with_config(|config| {
            config.control_plane_load_balancer = Some(ControlPlaneLoadBalancerSpec {
                load_balancer_type: LoadBalancerType::Nlb,
                scheme: Some(Scheme::Internal),
                ..Default::default()
            });
        });
        let service = fixture.service();
        service.reconcile_load_balancers().await.unwrap();
        fixture
            .cloud
            .inject_error("elbv2:delete_listener", "InternalFailure");

        let err = service.delete_load_balancers().await.unwrap_err();
        assert!(err
            .to_string()
            .starts_with("failed to delete cloud provider load balancer(s)"));
        assert_eq!(fixture.cloud.target_groups().len(), 1);
        assert!(fixture.cloud.load_balancer("default-test-apiserver").is_some());
    }
}
