//! Engine health as served on the agent's health endpoints
//!
//! Two inputs feed the registry: component status, and the per-cluster watch
//! report the supervisor publishes after every tick. The engine is ready once
//! a tick has completed and no component is unhealthy.

use crate::cluster::WatchState;
use crate::models::ClusterId;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Operational with some clusters not watched
    Degraded,
    Unhealthy,
}

impl ComponentStatus {
    pub fn is_operational(&self) -> bool {
        *self != ComponentStatus::Unhealthy
    }
}

/// Parts of the engine that report health
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Component {
    Supervisor,
    Watchers,
    Cache,
}

impl Component {
    pub const ALL: [Component; 3] = [Component::Supervisor, Component::Watchers, Component::Cache];

    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Supervisor => "supervisor",
            Component::Watchers => "watchers",
            Component::Cache => "cache",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_check_timestamp: i64,
}

impl ComponentHealth {
    fn new(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            last_check_timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

/// Watch status of one connected cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterWatchHealth {
    pub cluster: ClusterId,
    pub watch: WatchState,
    /// Initial list-and-watch window has elapsed
    pub aggregated: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: BTreeMap<&'static str, ComponentHealth>,
    pub clusters: Vec<ClusterWatchHealth>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Running watches still inside their initial sync window
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub clusters_syncing: Vec<ClusterId>,
}

#[derive(Debug, Default)]
struct HealthState {
    components: BTreeMap<Component, ComponentHealth>,
    clusters: Vec<ClusterWatchHealth>,
    ticked: bool,
}

impl HealthState {
    /// Worst component status; healthy when nothing is registered
    fn status(&self) -> ComponentStatus {
        self.components
            .values()
            .map(|health| health.status)
            .max()
            .unwrap_or(ComponentStatus::Healthy)
    }
}

#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    state: Arc<RwLock<HealthState>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every engine component registered as healthy
    pub fn for_engine() -> Self {
        let components = Component::ALL
            .into_iter()
            .map(|c| (c, ComponentHealth::new(ComponentStatus::Healthy, None)))
            .collect();
        Self {
            state: Arc::new(RwLock::new(HealthState {
                components,
                ..Default::default()
            })),
        }
    }

    pub async fn set(&self, component: Component, status: ComponentStatus, message: Option<String>) {
        let mut state = self.state.write().await;
        state
            .components
            .insert(component, ComponentHealth::new(status, message));
    }

    pub async fn set_healthy(&self, component: Component) {
        self.set(component, ComponentStatus::Healthy, None).await;
    }

    pub async fn set_degraded(&self, component: Component, message: impl Into<String>) {
        self.set(component, ComponentStatus::Degraded, Some(message.into()))
            .await;
    }

    pub async fn set_unhealthy(&self, component: Component, message: impl Into<String>) {
        self.set(component, ComponentStatus::Unhealthy, Some(message.into()))
            .await;
    }

    /// Record the outcome of a supervisor tick
    ///
    /// Watchers are degraded while any connected cluster has no running
    /// watch. The first report makes the engine ready.
    pub async fn report_tick(&self, clusters: Vec<ClusterWatchHealth>) {
        let running = clusters
            .iter()
            .filter(|c| c.watch == WatchState::Running)
            .count();
        let watchers = if running < clusters.len() {
            ComponentHealth::new(
                ComponentStatus::Degraded,
                Some(format!("{} of {} clusters watched", running, clusters.len())),
            )
        } else {
            ComponentHealth::new(ComponentStatus::Healthy, None)
        };

        let mut state = self.state.write().await;
        state.components.insert(Component::Watchers, watchers);
        state.clusters = clusters;
        state.ticked = true;
    }

    pub async fn health(&self) -> HealthResponse {
        let state = self.state.read().await;
        HealthResponse {
            status: state.status(),
            components: state
                .components
                .iter()
                .map(|(c, health)| (c.as_str(), health.clone()))
                .collect(),
            clusters: state.clusters.clone(),
        }
    }

    pub async fn readiness(&self) -> ReadinessResponse {
        let state = self.state.read().await;
        let unhealthy = state
            .components
            .iter()
            .find(|(_, health)| health.status == ComponentStatus::Unhealthy);

        let reason = if !state.ticked {
            Some("watch supervisor has not completed a tick".to_string())
        } else if let Some((component, health)) = unhealthy {
            Some(format!(
                "{} unhealthy: {}",
                component.as_str(),
                health.message.as_deref().unwrap_or("no details")
            ))
        } else {
            None
        };

        ReadinessResponse {
            ready: reason.is_none(),
            reason,
            clusters_syncing: state
                .clusters
                .iter()
                .filter(|c| c.watch == WatchState::Running && !c.aggregated)
                .map(|c| c.cluster.clone())
                .collect(),
        }
    }
}
