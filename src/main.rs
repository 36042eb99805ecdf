//! Upstream Balancer binary entry point.
//!
//! Registers the configured backends, reports their liveness and keeps
//! them under health monitoring until interrupted. Serving traffic is left
//! to the embedding HTTP front end, which drives a [`Dispatcher`].
//!
//! [`Dispatcher`]: upstream_balancer::Dispatcher

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use upstream_balancer::{
    BackendConfig, ConfigLoader, LoadBalancer, LoadBalancerConfig, LoadBalancerResult, Policy,
};

/// Command-line arguments.
#[derive(Debug, Parser)]
#[command(name = "upstream-balancer", version, about)]
struct Cli {
    /// Load balancing policy: RR, WRR, LC, WLC or IPH.
    #[arg(short = 'a', long = "algorithm")]
    algorithm: Option<String>,

    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Health check interval in milliseconds.
    #[arg(long)]
    interval_ms: Option<u64>,

    /// Backends, as `URL` or `URL=WEIGHT`.
    backends: Vec<String>,
}

#[tokio::main]
async fn main() -> LoadBalancerResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    info!("Upstream Balancer v{}", env!("CARGO_PKG_VERSION"));

    let loader = ConfigLoader::new();
    let mut config = match &cli.config {
        Some(path) => loader.load(path)?,
        None => LoadBalancerConfig::default(),
    };

    if let Some(algorithm) = &cli.algorithm {
        config.method = Policy::from_identifier(algorithm);
    }
    if let Some(ms) = cli.interval_ms {
        config.health_check.interval = Duration::from_millis(ms);
    }
    for spec in &cli.backends {
        config.backends.push(BackendConfig::parse_spec(spec)?);
    }
    loader.validate(&config)?;

    let balancer = LoadBalancer::from_config(&config).await;
    if balancer.count() == 0 {
        warn!("No backends registered, every request will be answered with 503");
    }
    for summary in balancer.describe() {
        info!(%summary, "Backend");
    }

    let monitor = balancer.start_health_monitor();
    info!(
        policy = %balancer.method(),
        algorithm = balancer.method().name(),
        backends = balancer.count(),
        "Load balancer ready"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    if let Some(monitor) = monitor {
        monitor.stop().await;
    }

    Ok(())
}
