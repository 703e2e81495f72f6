//! Registration of control plane instances behind the load balancers

use tracing::debug;

use super::Service;
use crate::cloud::errors::{self as codes, translate};
use crate::crd::ControlPlaneLoadBalancerSpec;
use crate::domain::{Instance, Subnets, SubnetSpec};
use crate::error::{Error, Result, ResultExt};
use crate::naming;

impl Service {
    /// Subnets used to resolve the zones of the primary load balancer
    ///
    /// Explicitly configured load balancer subnets may live outside the
    /// cluster network, so they are described instead.
    async fn primary_load_balancer_subnets(&self) -> Result<Subnets> {
        let explicit = self
            .scope
            .control_plane_load_balancer()
            .map(|spec| spec.subnets.clone())
            .unwrap_or_default();
        if explicit.is_empty() {
            return Ok(self.scope.subnets().clone());
        }

        let described = self
            .ec2
            .describe_subnets(&explicit)
            .await
            .map_err(translate)
            .context("failed to describe control plane load balancer subnets")?;
        Ok(described
            .into_iter()
            .map(|s| SubnetSpec {
                id: s.subnet_id.clone(),
                resource_id: Some(s.subnet_id),
                availability_zone: s.availability_zone,
                ..Default::default()
            })
            .collect::<Vec<_>>()
            .into())
    }

    /// Check whether `instance` is registered with the primary classic load balancer
    pub async fn is_instance_registered_classic(&self, instance: &Instance) -> Result<bool> {
        let name = naming::elb_name(self.scope.as_ref())
            .context("failed to get control plane load balancer name")?;
        let described = self
            .elb
            .describe_load_balancers(&[name.clone()])
            .await
            .map_err(translate)
            .with_context(|| format!("error describing ELB {:?}", name))?;
        let [description] = described.as_slice() else {
            return Err(Error::Internal(format!(
                "expected 1 ELB description for {:?}, got {}",
                name,
                described.len()
            )));
        };
        Ok(description.instances.iter().any(|id| id == &instance.id))
    }

    /// Target groups of the load balancer declared by `lb_spec` that have
    /// `instance` registered; empty when it is registered nowhere
    pub async fn is_instance_registered_v2(
        &self,
        instance: &Instance,
        lb_spec: &ControlPlaneLoadBalancerSpec,
    ) -> Result<Vec<String>> {
        let name = naming::lb_name(self.scope.as_ref(), lb_spec)
            .context("failed to get control plane load balancer name")?;
        let described = self
            .elbv2
            .describe_load_balancers(&[name.clone()])
            .await
            .map_err(translate)
            .with_context(|| format!("error describing load balancer {:?}", name))?;
        let [description] = described.as_slice() else {
            return Err(Error::Internal(format!(
                "expected 1 load balancer description for {:?}, got {}",
                name,
                described.len()
            )));
        };

        let groups = self
            .elbv2
            .describe_target_groups(&description.arn)
            .await
            .map_err(translate)
            .with_context(|| format!("error describing target groups of {:?}", name))?;

        let mut registered = Vec::new();
        for group in groups {
            let targets = self
                .elbv2
                .describe_target_health(&group.arn)
                .await
                .map_err(translate)
                .with_context(|| format!("error describing target health of {:?}", group.name))?;
            if targets.iter().any(|id| id == &instance.id) {
                registered.push(group.arn);
            }
        }
        Ok(registered)
    }

    /// Register `instance` with the primary classic load balancer
    ///
    /// The load balancer must have a subnet in the instance's availability zone.
    pub async fn register_instance_classic(&self, instance: &Instance) -> Result<()> {
        let name = naming::elb_name(self.scope.as_ref())
            .context("failed to get control plane load balancer name")?;
        let lb_spec = self.scope.control_plane_load_balancer().cloned().unwrap_or_default();
        let lb = self.describe_classic(&name, &lb_spec).await?;

        let instance_zone = self
            .scope
            .subnets()
            .find(&instance.subnet_id)
            .map(|s| s.availability_zone.clone())
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "failed to attach load balancer subnets, could not find subnet {:?} description in the cluster",
                    instance.subnet_id
                ))
            })?;

        let subnets = self.primary_load_balancer_subnets().await?;
        let zone_served = lb.subnet_ids.iter().any(|id| {
            subnets
                .find(id)
                .is_some_and(|s| s.availability_zone == instance_zone)
        });
        if !zone_served {
            return Err(Error::Configuration(format!(
                "failed to register instance with APIServer ELB {:?}: instance is in availability zone {:?}, no public subnets attached to the ELB in the same zone",
                name, instance_zone
            )));
        }

        self.elb
            .register_instances(&name, &[instance.id.clone()])
            .await
            .map_err(translate)
            .with_context(|| format!("failed to register instance {} with {:?}", instance.id, name))?;
        self.mutated("elb:register_instances");
        debug!("Registered instance {} with {}", instance.id, name);
        Ok(())
    }

    /// Register `instance` with every target group of the load balancer
    /// declared by `lb_spec`
    pub async fn register_instance_v2(
        &self,
        instance: &Instance,
        lb_spec: &ControlPlaneLoadBalancerSpec,
    ) -> Result<()> {
        let name = naming::lb_name(self.scope.as_ref(), lb_spec)
            .context("failed to get control plane load balancer name")?;
        let lb = self.describe_v2(&name, lb_spec).await?;
        let arn = lb
            .arn()
            .ok_or_else(|| Error::Internal(format!("load balancer {:?} has no ARN", name)))?;

        let groups = self
            .elbv2
            .describe_target_groups(arn)
            .await
            .map_err(translate)
            .with_context(|| format!("error describing target groups of {:?}", name))?;
        if groups.is_empty() {
            return Err(Error::Internal(format!(
                "no target groups found for load balancer with arn {:?}",
                arn
            )));
        }

        for group in &groups {
            self.elbv2
                .register_targets(&group.arn, &[instance.id.clone()])
                .await
                .map_err(translate)
                .with_context(|| {
                    format!("failed to register instance with target group {:?}", group.name)
                })?;
            self.mutated("elbv2:register_targets");
        }
        debug!("Registered instance {} with {} target groups of {}", instance.id, groups.len(), name);
        Ok(())
    }

    /// Remove `instance` from the primary classic load balancer
    ///
    /// A missing load balancer or an instance that is not registered is not
    /// an error.
    pub async fn deregister_instance_classic(&self, instance: &Instance) -> Result<()> {
        let name = naming::elb_name(self.scope.as_ref())
            .context("failed to get control plane load balancer name")?;
        match self
            .elb
            .deregister_instances(&name, &[instance.id.clone()])
            .await
        {
            Ok(()) => {
                self.mutated("elb:deregister_instances");
                Ok(())
            }
            Err(e) if codes::is_deregister_noop(&e) => {
                debug!("Instance {} is not registered with {}", instance.id, name);
                Ok(())
            }
            Err(e) => Err(translate(e)),
        }
    }

    /// Remove `instance` from one target group
    pub async fn deregister_instance_v2(&self, target_group_arn: &str, instance: &Instance) -> Result<()> {
        match self
            .elbv2
            .deregister_targets(target_group_arn, &[instance.id.clone()])
            .await
        {
            Ok(()) => {
                self.mutated("elbv2:deregister_targets");
                Ok(())
            }
            Err(e) if codes::is_deregister_noop(&e) => {
                debug!("Instance {} is not registered with {}", instance.id, target_group_arn);
                Ok(())
            }
            Err(e) => Err(translate(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{LoadBalancerType, Scheme};
    use crate::elb::testing::Fixture;
    use assert_matches::assert_matches;

    fn nlb() -> ControlPlaneLoadBalancerSpec {
        ControlPlaneLoadBalancerSpec {
            load_balancer_type: LoadBalancerType::Nlb,
            scheme: Some(Scheme::Internal),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_classic_registration_roundtrip() {
        let fixture = Fixture::new();
        let service = fixture.service();
        service.reconcile_load_balancers().await.unwrap();
        let instance = Instance::new("i-0001", "subnet-priv-a");

        assert!(!service.is_instance_registered_classic(&instance).await.unwrap());
        service.register_instance_classic(&instance).await.unwrap();
        assert!(service.is_instance_registered_classic(&instance).await.unwrap());

        service.deregister_instance_classic(&instance).await.unwrap();
        assert!(!service.is_instance_registered_classic(&instance).await.unwrap());

        // Second deregistration is a no-op
        service.deregister_instance_classic(&instance).await.unwrap();
    }

    #[tokio::test]
    async fn test_classic_registration_requires_zone() {
        let fixture = Fixture::new();
        let service = fixture.service();
        service.reconcile_load_balancers().await.unwrap();
        let instance = Instance::new("i-0001", "subnet-cni-c");

        let err = service.register_instance_classic(&instance).await.unwrap_err();
        assert_matches!(err, Error::Configuration(_));
        assert!(err.to_string().contains("us-east-1c"));
    }

    #[tokio::test]
    async fn test_classic_registration_unknown_subnet() {
        let fixture = Fixture::new();
        let service = fixture.service();
        service.reconcile_load_balancers().await.unwrap();

        let err = service
            .register_instance_classic(&Instance::new("i-0001", "subnet-nope"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("subnet-nope"));
    }

    #[tokio::test]
    async fn test_deregister_without_load_balancer() {
        let fixture = Fixture::new();
        fixture
            .service()
            .deregister_instance_classic(&Instance::new("i-0001", "subnet-priv-a"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_v2_registration_roundtrip() {
        let fixture = Fixture::with_config(|config| config.control_plane_load_balancer = Some(nlb()));
        let service = fixture.service();
        service.reconcile_load_balancers().await.unwrap();
        let instance = Instance::new("i-0001", "subnet-priv-a");

        assert!(service.is_instance_registered_v2(&instance, &nlb()).await.unwrap().is_empty());
        service.register_instance_v2(&instance, &nlb()).await.unwrap();

        let groups = service.is_instance_registered_v2(&instance, &nlb()).await.unwrap();
        assert_eq!(groups.len(), 1);

        service.deregister_instance_v2(&groups[0], &instance).await.unwrap();
        service.deregister_instance_v2(&groups[0], &instance).await.unwrap();
        assert!(service.is_instance_registered_v2(&instance, &nlb()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_v2_registration_missing_load_balancer() {
        let fixture = Fixture::new();
        let err = fixture
            .service()
            .register_instance_v2(&Instance::new("i-0001", "subnet-priv-a"), &nlb())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
