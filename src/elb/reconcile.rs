//! Convergence of existing load balancers towards their desired state
//!
//! Only load balancers carrying the cluster ownership tag are modified.
//! Subnets are compared by count and security groups as sets; any other
//! drift in those fields is left alone.

use std::collections::BTreeSet;
use tracing::{debug, info, trace};

use super::Service;
use crate::cloud::errors::{self as codes, translate};
use crate::crd::ControlPlaneLoadBalancerSpec;
use crate::domain::{Attributes, LoadBalancer, LoadBalancerState};
use crate::error::{Error, Result, ResultExt};
use crate::retry::retry_until;

/// Desired attributes that are missing or differ on the actual side
fn attribute_drift(actual: &Attributes, desired: &Attributes) -> bool {
    desired
        .iter()
        .any(|(key, value)| actual.get(key) != Some(value))
}

fn same_security_groups(actual: &[String], desired: &[String]) -> bool {
    actual.iter().collect::<BTreeSet<_>>() == desired.iter().collect::<BTreeSet<_>>()
}

/// Report the desired zones when the subnet count changed
fn track_availability_zones(actual: &mut LoadBalancer, desired: &LoadBalancer) {
    if actual.availability_zones.len() != desired.availability_zones.len() {
        actual.availability_zones = desired.availability_zones.clone();
    }
}

impl Service {
    /// Bring an existing classic load balancer in line with `desired`
    pub(super) async fn reconcile_classic(
        &self,
        mut actual: LoadBalancer,
        desired: &LoadBalancer,
    ) -> Result<LoadBalancer> {
        let cluster = self.scope.name();
        if !actual.is_managed(cluster) {
            trace!("Unmanaged control plane load balancer {}, skipping reconciliation", actual.name);
            track_availability_zones(&mut actual, desired);
            return Ok(actual);
        }

        let name = desired.name.as_str();
        if attribute_drift(&actual.attributes, &desired.attributes) {
            let elb = &self.elb;
            let attributes = &desired.attributes;
            let policy = self.retry.retrying(codes::is_load_balancer_not_found);
            retry_until(&policy, || async move {
                elb.modify_load_balancer_attributes(name, attributes).await?;
                Ok(true)
            })
            .await
            .map_err(translate)
            .with_context(|| format!("failed to apply load balancer attributes to {:?}", name))?;
            self.mutated("elb:modify_load_balancer_attributes");
            debug!("Updated attributes of classic load balancer {}", name);
            actual.attributes.extend(desired.attributes.clone());
        }

        if let Some(health_check) = desired.classic_health_check() {
            if actual.classic_health_check() != Some(health_check) {
                self.configure_health_check(name, health_check).await?;
            }
        }

        self.reconcile_tags(&actual, &desired.tags)
            .await
            .with_context(|| format!("failed to reconcile tags for load balancer {:?}", name))?;
        actual.tags = desired.tags.clone();

        if actual.subnet_ids.len() != desired.subnet_ids.len() {
            self.elb
                .attach_to_subnets(name, &desired.subnet_ids)
                .await
                .map_err(translate)
                .with_context(|| format!("failed to attach load balancer {:?} to subnets", name))?;
            self.mutated("elb:attach_to_subnets");
            info!("Attached classic load balancer {} to {} subnets", name, desired.subnet_ids.len());
            actual.subnet_ids = desired.subnet_ids.clone();
        }

        if !same_security_groups(&actual.security_group_ids, &desired.security_group_ids) {
            self.elb
                .apply_security_groups(name, &desired.security_group_ids)
                .await
                .map_err(translate)
                .with_context(|| format!("failed to apply security groups to load balancer {:?}", name))?;
            self.mutated("elb:apply_security_groups");
            info!("Applied security groups to classic load balancer {}", name);
            actual.security_group_ids = desired.security_group_ids.clone();
        }

        track_availability_zones(&mut actual, desired);
        Ok(actual)
    }

    /// Wait until a modern load balancer reports the active state
    pub(super) async fn wait_until_available(&self, lb: &LoadBalancer) -> Result<()> {
        let arn = lb.arn().ok_or_else(|| {
            Error::Internal(format!("load balancer {:?} has no ARN to wait on", lb.name))
        })?;
        let name = lb.name.as_str();
        let arns = vec![arn.to_string()];
        let arns = &arns;
        let elbv2 = &self.elbv2;

        let policy = self
            .retry
            .within(self.scope.max_wait())
            .retrying(codes::is_load_balancer_not_found);
        retry_until(&policy, || async move {
            let described = elbv2.describe_load_balancers_by_arn(arns).await?;
            match described.first().map(|d| d.state) {
                Some(LoadBalancerState::Active) => Ok(true),
                Some(LoadBalancerState::Failed) => Err(Error::Internal(format!(
                    "load balancer {:?} failed to provision",
                    name
                ))),
                Some(LoadBalancerState::Provisioning) => Ok(false),
                None => Err(Error::NotFound(format!("load balancer {:?} is not visible yet", name))),
            }
        })
        .await
        .map_err(translate)
        .with_context(|| format!("failed to wait for load balancer {:?} to become available", name))?;

        trace!("Load balancer {} is active", name);
        Ok(())
    }

    /// Bring an existing network, application or gateway load balancer in
    /// line with `desired`
    pub(super) async fn reconcile_v2(
        &self,
        mut actual: LoadBalancer,
        desired: &LoadBalancer,
        lb_spec: &ControlPlaneLoadBalancerSpec,
    ) -> Result<LoadBalancer> {
        self.wait_until_available(&actual).await?;

        let cluster = self.scope.name();
        if !actual.is_managed(cluster) {
            trace!("Unmanaged control plane load balancer {}, skipping reconciliation", actual.name);
            track_availability_zones(&mut actual, desired);
            return Ok(actual);
        }

        let name = desired.name.clone();
        let arn = actual
            .arn()
            .map(str::to_string)
            .ok_or_else(|| Error::Internal(format!("load balancer {:?} has no ARN", name)))?;

        self.reconcile_target_groups_and_listeners(&arn, desired, lb_spec)
            .await
            .with_context(|| {
                format!("failed to create target groups/listeners for load balancer {:?}", name)
            })?;

        if attribute_drift(&actual.attributes, &desired.attributes) {
            let elbv2 = &self.elbv2;
            let (target, attributes) = (arn.as_str(), &desired.attributes);
            let policy = self.retry.retrying(codes::is_load_balancer_not_found);
            retry_until(&policy, || async move {
                elbv2.modify_load_balancer_attributes(target, attributes).await?;
                Ok(true)
            })
            .await
            .map_err(translate)
            .with_context(|| format!("failed to apply load balancer attributes to {:?}", name))?;
            self.mutated("elbv2:modify_load_balancer_attributes");
            debug!("Updated attributes of load balancer {}", name);
            actual.attributes.extend(desired.attributes.clone());
        }

        self.reconcile_tags(&actual, &desired.tags)
            .await
            .with_context(|| format!("failed to reconcile tags for load balancer {:?}", name))?;
        actual.tags = desired.tags.clone();

        if actual.subnet_ids.len() != desired.subnet_ids.len() {
            self.elbv2
                .set_subnets(&arn, &desired.subnet_ids)
                .await
                .map_err(translate)
                .with_context(|| format!("failed to set subnets of load balancer {:?}", name))?;
            self.mutated("elbv2:set_subnets");
            info!("Moved load balancer {} to {} subnets", name, desired.subnet_ids.len());
            actual.subnet_ids = desired.subnet_ids.clone();
        }

        if actual.kind.supports_security_groups()
            && !same_security_groups(&actual.security_group_ids, &desired.security_group_ids)
        {
            self.elbv2
                .set_security_groups(&arn, &desired.security_group_ids)
                .await
                .map_err(translate)
                .with_context(|| format!("failed to apply security groups to load balancer {:?}", name))?;
            self.mutated("elbv2:set_security_groups");
            info!("Applied security groups to load balancer {}", name);
            actual.security_group_ids = desired.security_group_ids.clone();
        }

        track_availability_zones(&mut actual, desired);
        Ok(actual)
    }
}
