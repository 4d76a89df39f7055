use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use fleet_gateway::cluster::{BalancerRole, WorkerRole};
use fleet_gateway::config::{NodeEndpoint, ServerConfig};
use fleet_gateway::ledger::{self, Ledger};
use fleet_gateway::metrics::Metrics;
use fleet_gateway::net::{Listener, Node, NodeRole};

/// Which nodes this process runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Master,
    Worker,
    Fleet,
}

impl Mode {
    fn from_args() -> anyhow::Result<Self> {
        match std::env::args().nth(1).as_deref() {
            None | Some("fleet") => Ok(Mode::Fleet),
            Some("master") => Ok(Mode::Master),
            Some("worker") => Ok(Mode::Worker),
            Some(other) => anyhow::bail!("Unknown mode '{}', expected master, worker or fleet", other),
        }
    }
}

async fn start_node(
    config: &Arc<ServerConfig>,
    ledger: &Arc<dyn Ledger>,
    metrics: &Metrics,
    endpoint: NodeEndpoint,
    role: Arc<dyn NodeRole>,
) -> anyhow::Result<Arc<Node>> {
    let listener = Listener::bind(endpoint.socket_addr()).await?;
    let node = Node::new(config.clone(), endpoint, ledger.clone(), listener.socket(), role);
    metrics.register(node.stats());

    info!("{} listening on {}", node.role_name(), listener.local_addr());

    let running = node.clone();
    tokio::spawn(async move {
        if let Err(e) = listener.run(running).await {
            error!("Listener error: {:#}", e);
        }
    });
    Ok(node)
}

/// Serve stats when `METRICS_PORT` is set
#[cfg(feature = "metrics_server")]
fn spawn_metrics_server(metrics: Arc<Metrics>) {
    let Some(port) = std::env::var("METRICS_PORT").ok().and_then(|s| s.parse::<u16>().ok()) else {
        return;
    };
    tokio::spawn(async move {
        if let Err(e) = fleet_gateway::metrics::start_metrics_server(metrics, port).await {
            error!("Metrics server error: {}", e);
        }
    });
}

#[cfg(not(feature = "metrics_server"))]
fn spawn_metrics_server(_metrics: Arc<Metrics>) {}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    info!("Fleet Gateway v{}", env!("CARGO_PKG_VERSION"));

    let mode = Mode::from_args()?;
    let config = ServerConfig::load_or_default();
    config.validate()?;
    if mode != Mode::Fleet {
        config.require_shared_ledger()?;
    }
    let config = Arc::new(config);
    info!(
        "Configuration loaded: mode={:?}, master={}, workers={}, ledger={}",
        mode,
        config.master.endpoint(),
        config.master.nodes.len(),
        config.ledger.backend.as_str()
    );

    let ledger = ledger::open(&config.ledger).await?;
    let metrics = Arc::new(Metrics::new());

    let mut nodes = Vec::new();
    if matches!(mode, Mode::Master | Mode::Fleet) {
        BalancerRole::prepare_ledger(ledger.as_ref(), &config).await?;
        let role = Arc::new(BalancerRole::new());
        nodes.push(start_node(&config, &ledger, &metrics, config.master.endpoint(), role).await?);
    }
    match mode {
        Mode::Worker => {
            let role = Arc::new(WorkerRole::new());
            nodes.push(start_node(&config, &ledger, &metrics, config.node, role).await?);
        }
        Mode::Fleet => {
            for endpoint in &config.master.nodes {
                let role = Arc::new(WorkerRole::new());
                nodes.push(start_node(&config, &ledger, &metrics, *endpoint, role).await?);
            }
        }
        Mode::Master => {}
    }

    spawn_metrics_server(metrics.clone());

    info!("{} node(s) ready", nodes.len());

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Could not listen for shutdown signal: {}", e);
    }
    info!("Shutdown signal received");

    for node in &nodes {
        node.shutdown().await;
    }
    info!("Server stopped");

    Ok(())
}
