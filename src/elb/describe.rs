//! Lookup of existing load balancers
//!
//! A name is global within a region, so a load balancer found under the
//! expected name is only accepted when it sits in the cluster VPC and has
//! the declared scheme.

use tracing::trace;

use super::Service;
use crate::cloud::errors::{self as codes, translate};
use crate::crd::{ControlPlaneLoadBalancerSpec, Scheme};
use crate::domain::{ClassicConfig, LoadBalancer, LoadBalancerKind, V2Config};
use crate::error::{Error, Result, ResultExt};

fn classify_describe_error(err: Error, name: &str, family: &str) -> Error {
    if codes::is_load_balancer_not_found(&err) {
        return Error::NotFound(format!("no {} found with name: {:?}", family, name));
    }
    if err.is_throttled() {
        return err.context("too many requests made to the ELB service");
    }
    translate(err).context("unexpected aws error")
}

impl Service {
    /// Reject a load balancer that belongs to another VPC or has another scheme
    fn check_placement(
        &self,
        name: &str,
        vpc_id: Option<&str>,
        scheme: Scheme,
        lb_spec: &ControlPlaneLoadBalancerSpec,
    ) -> Result<()> {
        let expected_vpc = self.scope.vpc().id.as_str();
        let vpc_id = vpc_id.unwrap_or_default();
        if !expected_vpc.is_empty() && vpc_id != expected_vpc {
            return Err(Error::VpcMismatch {
                name: name.to_string(),
                vpc_id: vpc_id.to_string(),
            });
        }

        if let Some(expected) = lb_spec.scheme {
            if expected != scheme {
                return Err(Error::SchemeMismatch {
                    name: name.to_string(),
                    scheme: scheme.as_str().to_string(),
                });
            }
        }
        Ok(())
    }

    /// Observed state of the classic load balancer `name`
    pub(super) async fn describe_classic(
        &self,
        name: &str,
        lb_spec: &ControlPlaneLoadBalancerSpec,
    ) -> Result<LoadBalancer> {
        let names = vec![name.to_string()];
        let description = self
            .elb
            .describe_load_balancers(&names)
            .await
            .map_err(|e| classify_describe_error(e, name, "classic load balancer"))?
            .into_iter()
            .next()
            .ok_or_else(|| {
                Error::NotFound(format!("no classic load balancer found with name: {:?}", name))
            })?;

        self.check_placement(
            name,
            description.vpc_id.as_deref(),
            description.scheme,
            lb_spec,
        )?;

        let attributes = self
            .elb
            .describe_load_balancer_attributes(name)
            .await
            .map_err(translate)
            .with_context(|| format!("failed to describe classic load balancer {:?} attributes", name))?;

        let tags = self
            .elb
            .describe_tags(&names)
            .await
            .map_err(translate)
            .with_context(|| format!("failed to describe classic load balancer {:?} tags", name))?
            .into_iter()
            .next()
            .map(|d| d.tags)
            .ok_or_else(|| {
                Error::Internal(format!("no tag information returned for load balancer {:?}", name))
            })?;

        trace!("Found classic load balancer {} ({})", name, description.dns_name);
        Ok(LoadBalancer {
            name: description.name,
            scheme: description.scheme,
            kind: LoadBalancerKind::Classic(ClassicConfig {
                listeners: description.listeners,
                health_check: description.health_check,
            }),
            subnet_ids: description.subnets,
            availability_zones: description.availability_zones,
            security_group_ids: description.security_groups,
            attributes,
            tags,
            dns_name: description.dns_name,
        })
    }

    /// Observed state of the network, application or gateway load balancer `name`
    pub(super) async fn describe_v2(
        &self,
        name: &str,
        lb_spec: &ControlPlaneLoadBalancerSpec,
    ) -> Result<LoadBalancer> {
        let description = self
            .elbv2
            .describe_load_balancers(&[name.to_string()])
            .await
            .map_err(|e| classify_describe_error(e, name, "load balancer"))?
            .into_iter()
            .next()
            .ok_or_else(|| Error::NotFound(format!("no load balancer found with name: {:?}", name)))?;

        self.check_placement(
            name,
            description.vpc_id.as_deref(),
            description.scheme,
            lb_spec,
        )?;

        let arn = description.arn;
        let attributes = self
            .elbv2
            .describe_load_balancer_attributes(&arn)
            .await
            .map_err(translate)
            .with_context(|| format!("failed to describe load balancer {:?} attributes", name))?;

        let tags = self
            .elbv2
            .describe_tags(&[arn.clone()])
            .await
            .map_err(translate)
            .with_context(|| format!("failed to describe load balancer {:?} tags", name))?
            .into_iter()
            .next()
            .map(|d| d.tags)
            .ok_or_else(|| {
                Error::Internal(format!("no tag information returned for load balancer {:?}", name))
            })?;

        let kind = LoadBalancerKind::v2(
            description.load_balancer_type,
            V2Config {
                arn: Some(arn),
                listeners: Vec::new(),
            },
        )
        .ok_or_else(|| {
            Error::Internal(format!(
                "load balancer {:?} was reported with the classic type",
                name
            ))
        })?;

        let (subnet_ids, availability_zones) = description
            .availability_zones
            .into_iter()
            .map(|az| (az.subnet_id, az.zone_name))
            .unzip();

        Ok(LoadBalancer {
            name: description.name,
            scheme: description.scheme,
            kind,
            subnet_ids,
            availability_zones,
            security_group_ids: description.security_groups,
            attributes,
            tags,
            dns_name: description.dns_name,
        })
    }
}
