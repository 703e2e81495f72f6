//! API server load balancer service
//!
//! Keeps the cloud load balancers that front a cluster's control plane in
//! line with the cluster configuration:
//! - Spec building and lookup of both load balancer families
//! - Creation, diff-based update and tag reconciliation
//! - Ordered teardown with convergence polling
//! - Instance and target registration
//!
//! Reconciliation runs in two phases. Every declared load balancer is first
//! looked up or created; the returned reconcilers then run one after the
//! other, so waiting for one new load balancer to become active does not
//! delay the creation of the next.

mod create;
mod describe;
mod reconcile;
mod registration;
pub mod spec;
pub mod tags;
mod teardown;

#[cfg(test)]
pub(crate) mod testing;

pub use tags::TagDelta;

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info};

use crate::cloud::CloudClients;
use crate::crd::ControlPlaneLoadBalancerSpec;
use crate::domain::ports::{
    AddressAllocatorRef, ClassicElbApiRef, ElbScopeRef, ElbV2ApiRef, ResourceTaggingApiRef,
    SubnetApiRef,
};
use crate::domain::LoadBalancer;
use crate::error::{Error, Result, ResultExt};
use crate::metrics::ReconcileMetrics;
use crate::naming;
use crate::retry::RetryPolicy;

// =============================================================================
// Per-Name Locks
// =============================================================================

/// Async mutex per load balancer name
///
/// Clones share the same table, so services built for the same cluster
/// serialize their work on a given load balancer.
#[derive(Clone, Default)]
pub struct NameLocks(Arc<DashMap<String, Arc<Mutex<()>>>>);

impl NameLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `name`
    pub async fn lock(&self, name: &str) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(self.0.entry(name.to_string()).or_default().value());
        lock.lock_owned().await
    }
}

// =============================================================================
// Deferred Reconcilers
// =============================================================================

/// Second phase of a reconcile, captured by the get-or-create phase
#[derive(Debug)]
enum PendingReconcile {
    Classic {
        actual: LoadBalancer,
        desired: LoadBalancer,
    },
    V2 {
        actual: LoadBalancer,
        desired: LoadBalancer,
        lb_spec: ControlPlaneLoadBalancerSpec,
    },
}

impl PendingReconcile {
    fn name(&self) -> &str {
        match self {
            PendingReconcile::Classic { actual, .. } | PendingReconcile::V2 { actual, .. } => {
                &actual.name
            }
        }
    }
}

fn family(lb_spec: &ControlPlaneLoadBalancerSpec) -> &'static str {
    if lb_spec.load_balancer_type.is_classic() {
        "classic"
    } else {
        "v2"
    }
}

// =============================================================================
// Service
// =============================================================================

/// Load balancer service for one cluster
pub struct Service {
    scope: ElbScopeRef,
    elb: ClassicElbApiRef,
    elbv2: ElbV2ApiRef,
    ec2: SubnetApiRef,
    addresses: AddressAllocatorRef,
    tagging: ResourceTaggingApiRef,
    retry: RetryPolicy,
    metrics: Option<Arc<ReconcileMetrics>>,
    locks: NameLocks,
}

impl Service {
    /// Create a service for `scope` talking to `clients`
    pub fn new(scope: ElbScopeRef, clients: CloudClients) -> Self {
        Self {
            scope,
            elb: clients.elb,
            elbv2: clients.elbv2,
            ec2: clients.ec2,
            addresses: clients.addresses,
            tagging: clients.tagging,
            retry: RetryPolicy::default(),
            metrics: None,
            locks: NameLocks::new(),
        }
    }

    /// Use `policy` for eventually consistent operations and polling
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<ReconcileMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Share a lock table with other services
    pub fn with_locks(mut self, locks: NameLocks) -> Self {
        self.locks = locks;
        self
    }

    pub fn scope(&self) -> &ElbScopeRef {
        &self.scope
    }

    fn mutated(&self, operation: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_mutation(operation);
        }
    }

    fn record(&self, family: &str, success: bool, elapsed: Duration) {
        if let Some(metrics) = &self.metrics {
            metrics.record_reconcile(family, success, elapsed);
        }
    }

    /// Reconcile every load balancer declared for the cluster
    ///
    /// Returns the reconciled load balancers. Failures are collected per
    /// load balancer and returned together once all of them were attempted.
    pub async fn reconcile_load_balancers(&self) -> Result<Vec<LoadBalancer>> {
        debug!(
            "Reconciling load balancers for cluster {}",
            self.scope.infra_cluster_name()
        );

        let mut errors = Vec::new();
        let mut pending = Vec::new();

        for lb_spec in self.scope.control_plane_load_balancers() {
            let started = Instant::now();
            let result = if lb_spec.load_balancer_type.is_classic() {
                self.get_or_create_classic(&lb_spec).await
            } else {
                self.get_or_create_v2(lb_spec.clone()).await
            };
            match result {
                Ok(reconciler) => pending.push((reconciler, started)),
                Err(e) => {
                    error!("Failed to get or create {} load balancer: {}", family(&lb_spec), e);
                    self.record(family(&lb_spec), false, started.elapsed());
                    errors.push(e);
                }
            }
        }

        let mut reconciled = Vec::with_capacity(pending.len());
        for (reconciler, started) in pending {
            let name = reconciler.name().to_string();
            let _guard = self.locks.lock(&name).await;
            let (family, result) = match reconciler {
                PendingReconcile::Classic { actual, desired } => {
                    ("classic", self.reconcile_classic(actual, &desired).await)
                }
                PendingReconcile::V2 {
                    actual,
                    desired,
                    lb_spec,
                } => ("v2", self.reconcile_v2(actual, &desired, &lb_spec).await),
            };
            self.record(family, result.is_ok(), started.elapsed());
            match result {
                Ok(lb) => {
                    info!("Reconciled load balancer: {}", lb.name);
                    reconciled.push(lb);
                }
                Err(e) => {
                    error!("Failed to reconcile load balancer {}: {}", name, e);
                    errors.push(e);
                }
            }
        }

        Error::aggregate(errors)?;
        Ok(reconciled)
    }

    fn unrecoverable(&self, cause: Error) -> Error {
        Error::Unrecoverable(format!(
            "no load balancer exists for cluster {}, the cluster has become unrecoverable and should be deleted manually: {}",
            self.scope.infra_cluster_name(),
            cause
        ))
    }

    async fn get_or_create_classic(
        &self,
        lb_spec: &ControlPlaneLoadBalancerSpec,
    ) -> Result<PendingReconcile> {
        let name = naming::elb_name(self.scope.as_ref())
            .context("failed to get control plane load balancer name")?;
        let _guard = self.locks.lock(&name).await;

        let desired = self.build_classic_spec(&name, lb_spec).await?;
        let actual = match self.describe_classic(&name, lb_spec).await {
            Ok(actual) => actual,
            Err(e) if e.is_not_found() && self.scope.control_plane_endpoint_valid() => {
                return Err(self.unrecoverable(e));
            }
            Err(e) if e.is_not_found() => {
                let created = self.create_classic(&desired).await?;
                debug!("Created new classic load balancer for apiserver: {}", created.name);
                created
            }
            Err(e) => return Err(e),
        };

        Ok(PendingReconcile::Classic { actual, desired })
    }

    async fn get_or_create_v2(
        &self,
        lb_spec: ControlPlaneLoadBalancerSpec,
    ) -> Result<PendingReconcile> {
        let name = naming::lb_name(self.scope.as_ref(), &lb_spec)
            .context("failed to get control plane load balancer name")?;
        let _guard = self.locks.lock(&name).await;

        let desired = self.build_v2_spec(&name, &lb_spec).await?;
        let actual = match self.describe_v2(&name, &lb_spec).await {
            Ok(actual) => actual,
            Err(e) if e.is_not_found() && self.scope.control_plane_endpoint_valid() => {
                return Err(self.unrecoverable(e));
            }
            Err(e) if e.is_not_found() => {
                let created = self.create_v2(&desired, &lb_spec).await?;
                debug!(
                    "Created new {} load balancer for apiserver: {}",
                    lb_spec.load_balancer_type, created.name
                );
                created
            }
            Err(e) => return Err(e),
        };

        Ok(PendingReconcile::V2 {
            actual,
            desired,
            lb_spec,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::testing::Fixture;
    use super::*;
    use crate::cloud::errors as codes;
    use crate::crd::{LoadBalancerType, Scheme};
    use crate::domain::tags::cluster_tag_key;
    use crate::domain::{ClassicLoadBalancerDescription, Tags};
    use crate::error::ErrorAction;
    use assert_matches::assert_matches;

    fn nlb_spec() -> ControlPlaneLoadBalancerSpec {
        ControlPlaneLoadBalancerSpec {
            load_balancer_type: LoadBalancerType::Nlb,
            scheme: Some(Scheme::Internal),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_name_locks_are_shared() {
        let locks = NameLocks::new();
        let clone = locks.clone();

        let guard = locks.lock("lb").await;
        assert_eq!(clone.0.len(), 1);
        assert!(clone.0.get("lb").unwrap().try_lock().is_err());
        drop(guard);
        assert!(clone.0.get("lb").unwrap().try_lock().is_ok());
    }

    #[tokio::test]
    async fn test_classic_create_then_idempotent() {
        let fixture = Fixture::new();
        let service = fixture.service();

        let reconciled = service.reconcile_load_balancers().await.unwrap();
        assert_eq!(reconciled.len(), 1);
        assert_eq!(reconciled[0].name, "test-apiserver");
        assert!(!reconciled[0].dns_name.is_empty());

        let created = fixture.cloud.classic_load_balancer("test-apiserver").unwrap();
        assert_eq!(created.health_check.unwrap().target, "TCP:6443");
        let attributes = fixture.cloud.classic_attributes("test-apiserver").unwrap();
        assert_eq!(attributes.len(), 2);

        fixture.cloud.clear_calls();
        service.reconcile_load_balancers().await.unwrap();
        assert!(
            fixture.cloud.mutating_calls().is_empty(),
            "unexpected calls: {:?}",
            fixture.cloud.mutating_calls()
        );
    }

    #[tokio::test]
    async fn test_v2_create_then_idempotent() {
        let fixture = Fixture::with_config(|config| {
            config.control_plane_load_balancer = Some(nlb_spec());
        });
        let service = fixture.service();

        let reconciled = service.reconcile_load_balancers().await.unwrap();
        assert_eq!(reconciled[0].name, "default-test-apiserver");
        assert!(reconciled[0].arn().is_some());

        assert_eq!(fixture.cloud.target_groups().len(), 1);
        assert_eq!(fixture.cloud.listeners().len(), 1);

        fixture.cloud.clear_calls();
        service.reconcile_load_balancers().await.unwrap();
        assert!(
            fixture.cloud.mutating_calls().is_empty(),
            "unexpected calls: {:?}",
            fixture.cloud.mutating_calls()
        );
        assert_eq!(fixture.cloud.target_groups().len(), 1);
    }

    #[tokio::test]
    async fn test_primary_and_secondary() {
        let fixture = Fixture::with_config(|config| {
            config.secondary_control_plane_load_balancer = Some(ControlPlaneLoadBalancerSpec {
                name: Some("test-internal".to_string()),
                ..nlb_spec()
            });
        });
        let metrics = Arc::new(ReconcileMetrics::new().unwrap());
        let service = fixture.service().with_metrics(metrics.clone());

        let reconciled = service.reconcile_load_balancers().await.unwrap();
        let names: Vec<_> = reconciled.iter().map(|lb| lb.name.as_str()).collect();
        assert_eq!(names, vec!["test-apiserver", "test-internal"]);
        assert_eq!(metrics.reconciles("classic", true), 1);
        assert_eq!(metrics.reconciles("v2", true), 1);
        assert_eq!(metrics.mutations("elb:create_load_balancer"), 1);
        assert_eq!(metrics.mutations("elbv2:create_load_balancer"), 1);
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_other_load_balancers() {
        let fixture = Fixture::with_config(|config| {
            config.secondary_control_plane_load_balancer = Some(ControlPlaneLoadBalancerSpec {
                name: Some("test-internal".to_string()),
                ..nlb_spec()
            });
        });
        fixture
            .cloud
            .inject_error("elb:create_load_balancer", "InternalFailure");

        let err = fixture.service().reconcile_load_balancers().await.unwrap_err();
        assert!(err.to_string().contains("InternalFailure"));
        assert!(fixture.cloud.load_balancer("test-internal").is_some());
        assert!(fixture.cloud.classic_load_balancer("test-apiserver").is_none());
    }

    #[tokio::test]
    async fn test_unrecoverable_when_endpoint_published() {
        let fixture = Fixture::with_config(|config| {
            config.control_plane_endpoint.host = "test.example.com".to_string();
            config.control_plane_endpoint.port = 6443;
        });

        let err = fixture.service().reconcile_load_balancers().await.unwrap_err();
        assert_matches!(err, Error::Unrecoverable(_));
        assert!(err.to_string().contains("default/test"));
        assert_eq!(err.action(), ErrorAction::NoRequeue);
        assert!(fixture.cloud.mutating_calls().is_empty());
    }

    #[tokio::test]
    async fn test_unmanaged_load_balancer_is_not_touched() {
        let fixture = Fixture::new();
        fixture.cloud.insert_classic_load_balancer(
            ClassicLoadBalancerDescription {
                name: "test-apiserver".to_string(),
                dns_name: "byo.elb.amazonaws.com".to_string(),
                scheme: Scheme::InternetFacing,
                vpc_id: Some("vpc-test".to_string()),
                subnets: vec!["subnet-pub-a".to_string()],
                availability_zones: vec!["us-east-1a".to_string()],
                security_groups: vec!["sg-user".to_string()],
                listeners: vec![],
                health_check: None,
                instances: vec![],
            },
            Tags::from([("team".to_string(), "platform".to_string())]),
        );

        let reconciled = fixture.service().reconcile_load_balancers().await.unwrap();
        assert!(fixture.cloud.mutating_calls().is_empty());
        assert_eq!(reconciled[0].dns_name, "byo.elb.amazonaws.com");
        assert!(!reconciled[0].tags.contains_key(&cluster_tag_key("test")));
        // Zones are still reported from the desired placement
        assert_eq!(reconciled[0].availability_zones.len(), 2);
    }

    #[tokio::test]
    async fn test_throttled_describe_is_not_retried() {
        let fixture = Fixture::new();
        fixture
            .cloud
            .inject_error("elb:describe_load_balancers", codes::DEPENDENCY_THROTTLE);

        let err = fixture.service().reconcile_load_balancers().await.unwrap_err();
        assert!(err.is_throttled());
        assert!(err.to_string().contains("too many requests"));
        assert_eq!(
            fixture
                .cloud
                .calls()
                .iter()
                .filter(|c| *c == "elb:describe_load_balancers")
                .count(),
            1
        );
    }
}
