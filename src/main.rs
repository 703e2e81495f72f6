//! API Server Load Balancer Operator
//!
//! Standalone reconciler for the load balancers in front of a cluster's
//! API servers. The cluster is described by a YAML configuration file and
//! cloud state is kept by the in-memory adapter, optionally persisted to a
//! JSON state file between runs.
//!
//! # Commands
//!
//! - `reconcile`: create or converge the load balancers, once or in a loop
//! - `delete`: tear down the load balancers and orphaned service ELBs
//! - `name`: print the load balancer names derived for the cluster
//! - `crd`: print the ControlPlaneLoadBalancer CRD

use clap::{Args as ClapArgs, Parser, Subcommand};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use apiserver_lb_operator::{
    naming, CloudClients, ClusterConfig, ControlPlaneLoadBalancer,
    ControlPlaneLoadBalancerStatus, Error, ErrorAction, InMemoryCloud, ReconcileMetrics,
    Result, Service,
};

/// Delay before retrying a pass that failed on a transient error
const RETRY_DELAY: Duration = Duration::from_secs(10);

// =============================================================================
// CLI Arguments
// =============================================================================

/// API Server Load Balancer Operator - reconciles control plane load balancers
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create or converge the cluster's load balancers
    Reconcile(ReconcileArgs),
    /// Delete the cluster's load balancers
    Delete(ClusterArgs),
    /// Print the load balancer names for the cluster
    Name(ClusterArgs),
    /// Print the ControlPlaneLoadBalancer CRD as YAML
    Crd,
}

#[derive(ClapArgs, Debug)]
struct ClusterArgs {
    /// Cluster configuration file (YAML)
    #[arg(long, env = "CLUSTER_CONFIG")]
    config: PathBuf,

    /// Cloud state file (JSON), created when missing
    #[arg(long, env = "CLOUD_STATE")]
    state: Option<PathBuf>,
}

#[derive(ClapArgs, Debug)]
struct ReconcileArgs {
    #[command(flatten)]
    cluster: ClusterArgs,

    /// Reconcile once and exit
    #[arg(long, env = "RECONCILE_ONCE")]
    once: bool,

    /// Seconds between reconciles
    #[arg(long, env = "RECONCILE_INTERVAL", default_value = "60")]
    interval_secs: u64,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    match args.command {
        Command::Reconcile(reconcile) => run_reconcile(reconcile).await,
        Command::Delete(cluster) => run_delete(cluster).await,
        Command::Name(cluster) => print_names(&cluster),
        Command::Crd => print_crd(),
    }
}

async fn run_reconcile(args: ReconcileArgs) -> Result<()> {
    let config = Arc::new(ClusterConfig::load(&args.cluster.config)?);
    let cloud = Arc::new(open_cloud(&config, args.cluster.state.as_deref())?);
    let metrics = Arc::new(ReconcileMetrics::new()?);

    info!("Starting API Server Load Balancer Operator");
    info!("  Version: {}", apiserver_lb_operator::VERSION);
    info!("  Cluster: {}", config.name);
    info!("  Region: {}", config.region);
    info!("  Interval: {}s", args.interval_secs);

    let service = Service::new(config.clone(), CloudClients::shared(cloud.clone()))
        .with_retry_policy(config.reconciler.retry_policy())
        .with_metrics(metrics.clone());

    if args.once {
        let result = service.reconcile_load_balancers().await;
        persist(&cloud, args.cluster.state.as_deref())?;
        for lb in result? {
            let status = ControlPlaneLoadBalancerStatus::from_load_balancer(&lb);
            print!("{}", serde_yaml::to_string(&status)?);
        }
        return Ok(());
    }

    let ready = Arc::new(AtomicBool::new(false));

    // Start health server
    let health_addr = args.health_addr.clone();
    let health_ready = ready.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_ready).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    let served_metrics = metrics.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, served_metrics).await {
            error!("Metrics server error: {}", e);
        }
    });

    let interval = Duration::from_secs(args.interval_secs);
    loop {
        let delay = match service.reconcile_load_balancers().await {
            Ok(reconciled) => {
                ready.store(true, Ordering::Relaxed);
                for lb in &reconciled {
                    info!("Load balancer {} reconciled: {}", lb.name, lb.dns_name);
                }
                interval
            }
            Err(e) => {
                error!("Reconcile failed: {}", e);
                if !e.is_retryable() {
                    warn!("Reconcile cannot succeed until the cluster configuration changes");
                }
                match e.action() {
                    ErrorAction::RequeueAfter(after) => after,
                    _ if e.is_transient() => interval.min(RETRY_DELAY),
                    _ => interval,
                }
            }
        };
        if let Err(e) = persist(&cloud, args.cluster.state.as_deref()) {
            warn!("Failed to save cloud state: {}", e);
        }

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
        }
    }

    info!("Operator shutdown complete");
    Ok(())
}

async fn run_delete(args: ClusterArgs) -> Result<()> {
    let config = Arc::new(ClusterConfig::load(&args.config)?);
    let cloud = Arc::new(open_cloud(&config, args.state.as_deref())?);

    let service = Service::new(config.clone(), CloudClients::shared(cloud.clone()))
        .with_retry_policy(config.reconciler.retry_policy());
    let result = service.delete_load_balancers().await;
    persist(&cloud, args.state.as_deref())?;
    result?;

    info!("Deleted load balancers of cluster {}", config.name);
    Ok(())
}

fn print_names(args: &ClusterArgs) -> Result<()> {
    let config = ClusterConfig::load(&args.config)?;
    for name in naming::control_plane_load_balancer_names(&config)? {
        println!("{}", name);
    }
    Ok(())
}

fn print_crd() -> Result<()> {
    use kube::CustomResourceExt;

    print!("{}", serde_yaml::to_string(&ControlPlaneLoadBalancer::crd())?);
    Ok(())
}

// =============================================================================
// Cloud State
// =============================================================================

fn open_cloud(config: &ClusterConfig, state: Option<&Path>) -> Result<InMemoryCloud> {
    let cloud = match state {
        Some(path) if path.exists() => InMemoryCloud::load(path)?,
        _ => InMemoryCloud::new(config.region.clone()),
    };
    if cloud.region() != config.region {
        return Err(Error::Configuration(format!(
            "cloud state is for region {:?}, cluster is in {:?}",
            cloud.region(),
            config.region
        )));
    }
    for subnet in config.subnets.iter() {
        cloud.add_subnet(&subnet.id, &subnet.availability_zone, &config.vpc.id);
    }
    Ok(cloud)
}

fn persist(cloud: &InMemoryCloud, state: Option<&Path>) -> Result<()> {
    match state {
        Some(path) => cloud.save(path),
        None => Ok(()),
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "kube=info"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}

// =============================================================================
// Health Server
// =============================================================================

fn respond(status: hyper::StatusCode, body: impl Into<hyper::Body>) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(body.into());
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: &str, ready: Arc<AtomicBool>) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let ready = ready.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let ready = ready.load(Ordering::Relaxed);
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => respond(StatusCode::OK, "ok"),
                        "/readyz" if ready => respond(StatusCode::OK, "ok"),
                        "/readyz" => respond(StatusCode::SERVICE_UNAVAILABLE, "not ready"),
                        _ => respond(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid health server address: {}", e))
    })?;

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str, metrics: Arc<ReconcileMetrics>) -> Result<()> {
    use hyper::header::CONTENT_TYPE;
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let metrics = metrics.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let metrics = metrics.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => match metrics.gather_text() {
                            Ok(text) => {
                                let mut response = respond(StatusCode::OK, text);
                                response.headers_mut().insert(
                                    CONTENT_TYPE,
                                    hyper::header::HeaderValue::from_static(
                                        "text/plain; version=0.0.4",
                                    ),
                                );
                                response
                            }
                            Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
                        },
                        _ => respond(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid metrics server address: {}", e))
    })?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
