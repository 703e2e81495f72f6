//! Shared test fixture: a small cluster on top of the in-memory cloud

use std::sync::Arc;
use std::time::Duration;

use super::Service;
use crate::cloud::{CloudClients, InMemoryCloud};
use crate::config::ClusterConfig;
use crate::domain::{SubnetSpec, Subnets, VpcSpec};
use crate::retry::{self, RetryPolicy};

const REGION: &str = "us-east-1";
const VPC_ID: &str = "vpc-test";

/// (id, zone, public, cni only)
const SUBNETS: &[(&str, &str, bool, bool)] = &[
    ("subnet-priv-a", "us-east-1a", false, false),
    ("subnet-priv-b", "us-east-1b", false, false),
    ("subnet-pub-a", "us-east-1a", true, false),
    ("subnet-pub-b", "us-east-1b", true, false),
    ("subnet-cni-c", "us-east-1c", false, true),
];

pub(crate) fn fast_retry_policy() -> RetryPolicy {
    RetryPolicy {
        initial_interval: Duration::from_millis(1),
        multiplier: 1.0,
        max_interval: Duration::from_millis(1),
        max_elapsed: None,
        max_attempts: 8,
        retryable: retry::never,
    }
}

pub(crate) struct Fixture {
    pub cloud: Arc<InMemoryCloud>,
    pub config: Arc<ClusterConfig>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    /// Fixture whose cluster configuration is adjusted by `configure`
    pub fn with_config(configure: impl FnOnce(&mut ClusterConfig)) -> Self {
        let cloud = Arc::new(InMemoryCloud::new(REGION));
        for (id, zone, _, _) in SUBNETS {
            cloud.add_subnet(id, zone, VPC_ID);
        }

        let mut config = ClusterConfig::new("test", REGION);
        config.vpc = VpcSpec {
            id: VPC_ID.to_string(),
            ..Default::default()
        };
        config.subnets = Subnets(
            SUBNETS
                .iter()
                .map(|(id, zone, public, cni_only)| SubnetSpec {
                    id: id.to_string(),
                    availability_zone: zone.to_string(),
                    is_public: *public,
                    cni_only: *cni_only,
                    ..Default::default()
                })
                .collect(),
        );
        config.api_server_lb_security_group = Some("sg-apiserver-lb".to_string());
        config.reconciler.max_wait_secs = 5;
        configure(&mut config);

        Self {
            cloud,
            config: Arc::new(config),
        }
    }

    pub fn service(&self) -> Service {
        Service::new(self.config.clone(), CloudClients::shared(self.cloud.clone()))
            .with_retry_policy(fast_retry_policy())
    }
}
