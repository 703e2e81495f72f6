//! Tag reconciliation for both load balancer families

use tracing::trace;

use super::Service;
use crate::cloud::errors::translate;
use crate::domain::{LoadBalancer, LoadBalancerKind, Tags};
use crate::error::{Error, Result};

/// Changes needed to turn one tag set into another
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagDelta {
    /// Tags that are missing or carry a different value
    pub add: Tags,
    /// Keys present on the resource but not desired
    pub remove: Vec<String>,
}

impl TagDelta {
    pub fn compute(current: &Tags, desired: &Tags) -> Self {
        let add = desired
            .iter()
            .filter(|(key, value)| current.get(*key) != Some(*value))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        let remove = current
            .keys()
            .filter(|key| !desired.contains_key(*key))
            .cloned()
            .collect();
        Self { add, remove }
    }

    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }
}

impl Service {
    /// Make the tags of `lb` equal to `desired` with at most one add and one
    /// remove call
    pub(super) async fn reconcile_tags(&self, lb: &LoadBalancer, desired: &Tags) -> Result<()> {
        let delta = TagDelta::compute(&lb.tags, desired);
        if delta.is_empty() {
            return Ok(());
        }
        for (key, value) in &delta.add {
            trace!("Adding tag {}={} to load balancer {}", key, value, lb.name);
        }
        for key in &delta.remove {
            trace!("Removing tag {} from load balancer {}", key, lb.name);
        }

        match &lb.kind {
            LoadBalancerKind::Classic(_) => {
                if !delta.add.is_empty() {
                    self.elb.add_tags(&lb.name, &delta.add).await.map_err(translate)?;
                    self.mutated("elb:add_tags");
                }
                if !delta.remove.is_empty() {
                    self.elb.remove_tags(&lb.name, &delta.remove).await.map_err(translate)?;
                    self.mutated("elb:remove_tags");
                }
            }
            _ => {
                let arn = lb.arn().ok_or_else(|| {
                    Error::Internal(format!("load balancer {:?} has no ARN to tag", lb.name))
                })?;
                if !delta.add.is_empty() {
                    self.elbv2.add_tags(arn, &delta.add).await.map_err(translate)?;
                    self.mutated("elbv2:add_tags");
                }
                if !delta.remove.is_empty() {
                    self.elbv2.remove_tags(arn, &delta.remove).await.map_err(translate)?;
                    self.mutated("elbv2:remove_tags");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::ControlPlaneLoadBalancerSpec;
    use crate::elb::testing::Fixture;

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_delta() {
        let current = tags(&[("a", "1"), ("b", "2"), ("c", "3")]);
        let desired = tags(&[("a", "1"), ("b", "changed"), ("d", "4")]);

        let delta = TagDelta::compute(&current, &desired);
        assert_eq!(delta.add, tags(&[("b", "changed"), ("d", "4")]));
        assert_eq!(delta.remove, vec!["c".to_string()]);
        assert!(!delta.is_empty());

        assert!(TagDelta::compute(&desired, &desired).is_empty());
    }

    #[tokio::test]
    async fn test_classic_tags_in_two_calls() {
        let fixture = Fixture::new();
        let service = fixture.service();
        let desired = service
            .build_classic_spec("test-apiserver", &ControlPlaneLoadBalancerSpec::default())
            .await
            .unwrap();
        let mut lb = service.create_classic(&desired).await.unwrap();
        lb.tags.insert("old-1".to_string(), "x".to_string());
        lb.tags.insert("old-2".to_string(), "y".to_string());

        let mut wanted = desired.tags.clone();
        wanted.insert("team".to_string(), "platform".to_string());
        wanted.insert("env".to_string(), "prod".to_string());

        fixture.cloud.clear_calls();
        service.reconcile_tags(&lb, &wanted).await.unwrap();
        assert_eq!(fixture.cloud.mutating_calls(), vec!["elb:add_tags", "elb:remove_tags"]);
        assert_eq!(fixture.cloud.classic_tags("test-apiserver").unwrap(), wanted);
    }
}
