//! Watch supervisor
//!
//! Periodic control loop that keeps exactly one event processor running per
//! connected cluster. Every tick it claims the start of each idle watch,
//! starts a processor, records the outcome in the registry, purges expired
//! cache entries and refreshes health and metrics.

use super::EventProcessor;
use crate::cluster::{ClusterRegistry, WatchState};
use crate::health::{ClusterWatchHealth, Component, HealthRegistry};
use crate::models::{ClusterId, ResourceKind};
use crate::observability::{PodStatMetrics, StructuredLogger};
use crate::services::AggregationServices;
use anyhow::Result;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Configuration for the watch supervisor
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Tick interval (default: 60 seconds)
    pub interval: Duration,
    /// Kind watched per cluster
    pub kind: ResourceKind,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            kind: ResourceKind::Pod,
        }
    }
}

/// Outcome of one supervisor tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub clusters: usize,
    pub started: usize,
    pub failed: usize,
    /// Clusters whose watch was already starting or running
    pub skipped: usize,
    pub running: usize,
    pub purged: usize,
}

pub struct WatchSupervisor {
    registry: Arc<dyn ClusterRegistry>,
    services: AggregationServices,
    processor: EventProcessor,
    config: SupervisorConfig,
    health: Option<HealthRegistry>,
    sessions: DashMap<ClusterId, AbortHandle>,
    metrics: PodStatMetrics,
    logger: StructuredLogger,
}

impl WatchSupervisor {
    pub fn new(
        registry: Arc<dyn ClusterRegistry>,
        services: AggregationServices,
        config: SupervisorConfig,
    ) -> Self {
        let processor = EventProcessor::new(registry.clone(), services.clone());
        Self {
            registry,
            services,
            processor,
            config,
            health: None,
            sessions: DashMap::new(),
            metrics: PodStatMetrics::new(),
            logger: StructuredLogger::new("podstat"),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Run ticks until a shutdown signal arrives, then stop every session
    ///
    /// The first tick runs immediately.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            kind = %self.config.kind,
            "Starting watch supervisor"
        );

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let summary = self.tick().await;
                    debug!(
                        clusters = summary.clusters,
                        started = summary.started,
                        failed = summary.failed,
                        running = summary.running,
                        purged = summary.purged,
                        "Supervisor tick complete"
                    );
                }
                _ = shutdown.recv() => {
                    info!("Shutting down watch supervisor");
                    break;
                }
            }
        }

        self.stop_all();
    }

    /// Ensure every connected cluster has a running watch
    pub async fn tick(&self) -> TickSummary {
        let start = Instant::now();
        let kind = self.config.kind;
        let clusters = self.registry.connected_clusters();
        let mut summary = TickSummary {
            clusters: clusters.len(),
            ..Default::default()
        };

        for handle in clusters {
            let cluster = handle.id().clone();
            if !self.registry.try_begin_start(&cluster, kind) {
                summary.skipped += 1;
                continue;
            }

            match self.processor.start(handle).await {
                Ok(session) => {
                    self.sessions.insert(cluster.clone(), session.abort_handle());
                    self.registry.set_watch_started(&cluster, kind, session);
                    summary.started += 1;
                }
                Err(e) => {
                    self.metrics.inc_watch_start_failures();
                    self.logger
                        .log_watch_start_failed(&cluster, kind, &e.to_string());
                    self.registry.set_watch_state(&cluster, kind, WatchState::Failed);
                    summary.failed += 1;
                }
            }
        }

        summary.purged = self.services.cache.purge_expired();
        let reports = self.watch_reports();
        summary.running = reports
            .iter()
            .filter(|report| report.watch == WatchState::Running)
            .count();

        self.metrics.set_watch_sessions(summary.running as i64);
        self.metrics
            .observe_tick_latency(start.elapsed().as_secs_f64());

        if let Some(health) = &self.health {
            health.set_healthy(Component::Supervisor).await;
            health.set_healthy(Component::Cache).await;
            health.report_tick(reports).await;
        }

        summary
    }

    fn watch_reports(&self) -> Vec<ClusterWatchHealth> {
        let kind = self.config.kind;
        self.registry
            .connected_clusters()
            .iter()
            .map(|handle| ClusterWatchHealth {
                cluster: handle.id().clone(),
                watch: self.registry.watch_state(handle.id(), kind),
                aggregated: self.registry.pod_status_aggregated(handle.id()),
            })
            .collect()
    }

    /// Abort every session this supervisor started and mark it stopped
    pub fn stop_all(&self) {
        let kind = self.config.kind;
        let clusters: Vec<ClusterId> = self.sessions.iter().map(|e| e.key().clone()).collect();

        for cluster in clusters {
            if let Some((cluster, session)) = self.sessions.remove(&cluster) {
                session.abort();
                self.registry.set_watch_state(&cluster, kind, WatchState::Stopped);
                self.logger
                    .log_watch_stopped(&cluster, kind, false, "supervisor shutdown");
            }
        }
    }
}

/// Builder for the watch supervisor
pub struct WatchSupervisorBuilder {
    registry: Option<Arc<dyn ClusterRegistry>>,
    services: Option<AggregationServices>,
    config: SupervisorConfig,
    health: Option<HealthRegistry>,
    logger: Option<StructuredLogger>,
}

impl WatchSupervisorBuilder {
    pub fn new() -> Self {
        Self {
            registry: None,
            services: None,
            config: SupervisorConfig::default(),
            health: None,
            logger: None,
        }
    }

    pub fn registry(mut self, registry: Arc<dyn ClusterRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn services(mut self, services: AggregationServices) -> Self {
        self.services = Some(services);
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.config.interval = interval;
        self
    }

    pub fn kind(mut self, kind: ResourceKind) -> Self {
        self.config.kind = kind;
        self
    }

    /// Report component health and readiness into `health`
    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn build(self) -> Result<WatchSupervisor> {
        let registry = self
            .registry
            .ok_or_else(|| anyhow::anyhow!("Cluster registry is required"))?;
        let services = self
            .services
            .ok_or_else(|| anyhow::anyhow!("Aggregation services are required"))?;
        if self.config.interval.is_zero() {
            anyhow::bail!("Supervisor interval must be greater than zero");
        }

        let mut supervisor = WatchSupervisor::new(registry, services, self.config);
        supervisor.health = self.health;
        if let Some(logger) = self.logger {
            supervisor.processor = supervisor.processor.with_logger(logger.clone());
            supervisor.logger = logger;
        }
        Ok(supervisor)
    }
}

impl Default for WatchSupervisorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
