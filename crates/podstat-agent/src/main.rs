//! Podstat agent - watch-driven namespace statistics
//!
//! Connects to every configured cluster, keeps one pod watch per cluster
//! alive and serves health and metrics endpoints.

use anyhow::Result;
use podstat_agent::{api, config::AgentConfig};
use podstat_lib::{
    cluster::{ClusterHandle, ClusterRegistry, InMemoryClusterRegistry, KubeClusterClient},
    health::HealthRegistry,
    observability::StructuredLogger,
    AggregationServices, ClusterId, WatchSupervisorBuilder,
};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Cluster id used when no contexts are configured
const DEFAULT_CLUSTER: &str = "default";

async fn connect_clusters(config: &AgentConfig, registry: &InMemoryClusterRegistry) -> Result<()> {
    let contexts = config.context_list();

    if contexts.is_empty() {
        let client = kube::Client::try_default().await?;
        let cluster = ClusterId::new(DEFAULT_CLUSTER);
        registry.connect(ClusterHandle::new(
            cluster.clone(),
            Arc::new(KubeClusterClient::new(cluster, client)),
        ));
        return Ok(());
    }

    let kubeconfig = config.kubeconfig.as_deref().map(Path::new);
    for context in contexts {
        let cluster = ClusterId::new(context.as_str());
        match KubeClusterClient::from_context(cluster.clone(), kubeconfig, &context).await {
            Ok(client) => registry.connect(ClusterHandle::new(cluster, Arc::new(client))),
            Err(e) => warn!(context = %context, error = %e, "Failed to build cluster client, skipping"),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting podstat-agent");

    let config = AgentConfig::load()?;
    info!(
        instance = %config.instance_name,
        contexts = %config.contexts,
        watch_interval_secs = config.watch_interval_secs,
        "Agent configured"
    );

    let health_registry = HealthRegistry::for_engine();
    let logger = StructuredLogger::new(&config.instance_name);

    let registry = Arc::new(InMemoryClusterRegistry::new(config.initial_sync_delay()));
    connect_clusters(&config, &registry).await?;

    let services = AggregationServices::new(config.cache_ttl());
    let supervisor = WatchSupervisorBuilder::new()
        .registry(registry.clone())
        .services(services)
        .interval(config.watch_interval())
        .health(health_registry.clone())
        .logger(logger.clone())
        .build()?;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let supervisor_handle = tokio::spawn(supervisor.run(shutdown_rx));

    let app_state = Arc::new(api::AppState::new(health_registry));
    let api_handle = tokio::spawn(api::serve(
        config.api_port,
        app_state,
        shutdown_tx.subscribe(),
    ));

    logger.log_startup(AGENT_VERSION, registry.connected_clusters().len());

    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");

    let _ = shutdown_tx.send(());
    supervisor_handle.await?;
    registry.stop_all();
    if let Err(e) = api_handle.await? {
        warn!(error = %e, "API server exited with error");
    }

    info!("Shutdown complete");
    Ok(())
}
