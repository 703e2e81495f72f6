//! Prometheus metrics for the reconciler

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::time::Duration;

use crate::error::Result;

/// Reconcile counters and timings, registered on a private registry
#[derive(Clone)]
pub struct ReconcileMetrics {
    registry: Registry,
    reconciles: IntCounterVec,
    mutations: IntCounterVec,
    duration: HistogramVec,
}

impl ReconcileMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let reconciles = IntCounterVec::new(
            Opts::new(
                "apiserver_lb_reconciles_total",
                "Load balancer reconciles by family and outcome",
            ),
            &["family", "outcome"],
        )?;
        let mutations = IntCounterVec::new(
            Opts::new(
                "apiserver_lb_cloud_mutations_total",
                "Mutating cloud API calls by operation",
            ),
            &["operation"],
        )?;
        let duration = HistogramVec::new(
            HistogramOpts::new(
                "apiserver_lb_reconcile_duration_seconds",
                "Duration of load balancer reconciles",
            )
            .buckets(vec![0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0]),
            &["family"],
        )?;

        registry.register(Box::new(reconciles.clone()))?;
        registry.register(Box::new(mutations.clone()))?;
        registry.register(Box::new(duration.clone()))?;

        Ok(Self {
            registry,
            reconciles,
            mutations,
            duration,
        })
    }

    pub fn record_reconcile(&self, family: &str, success: bool, elapsed: Duration) {
        let outcome = if success { "success" } else { "error" };
        self.reconciles.with_label_values(&[family, outcome]).inc();
        self.duration
            .with_label_values(&[family])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_mutation(&self, operation: &str) {
        self.mutations.with_label_values(&[operation]).inc();
    }

    pub fn reconciles(&self, family: &str, success: bool) -> u64 {
        let outcome = if success { "success" } else { "error" };
        self.reconciles.with_label_values(&[family, outcome]).get()
    }

    pub fn mutations(&self, operation: &str) -> u64 {
        self.mutations.with_label_values(&[operation]).get()
    }

    /// Render every metric in the Prometheus text format
    pub fn gather_text(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer)
            .map_err(|e| crate::error::Error::Internal(format!("metrics are not UTF-8: {}", e)))
    }
}
