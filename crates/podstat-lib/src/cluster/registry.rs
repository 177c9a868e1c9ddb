//! In-memory cluster registry
//!
//! Holds the connected clusters and the per (cluster, kind) watch state
//! machine. Clusters are connected by the hosting process (from kubeconfig
//! contexts in the agent binary, from fakes in tests).

use super::{ClusterHandle, ClusterRegistry, WatchSession, WatchState};
use crate::models::{ClusterId, ResourceKind};
use dashmap::DashMap;
use std::time::Duration;
use tracing::{debug, info};

/// Work deferred until the initial synchronization window has elapsed
pub type DeferredTask = Box<dyn FnOnce() + Send + 'static>;

/// Default wait before deferred tasks run
pub const DEFAULT_INITIAL_SYNC_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Default)]
struct WatchSlot {
    state: WatchState,
    session: Option<WatchSession>,
}

pub struct InMemoryClusterRegistry {
    clusters: DashMap<ClusterId, ClusterHandle>,
    watches: DashMap<(ClusterId, ResourceKind), WatchSlot>,
    aggregated: DashMap<ClusterId, bool>,
    initial_sync_delay: Duration,
}

impl InMemoryClusterRegistry {
    pub fn new(initial_sync_delay: Duration) -> Self {
        Self {
            clusters: DashMap::new(),
            watches: DashMap::new(),
            aggregated: DashMap::new(),
            initial_sync_delay,
        }
    }

    /// Add or replace a connected cluster
    pub fn connect(&self, handle: ClusterHandle) {
        info!(cluster = %handle.id(), "Cluster connected");
        self.clusters.insert(handle.id().clone(), handle);
    }

    /// Remove a cluster and stop its watches
    pub fn disconnect(&self, cluster: &ClusterId) {
        if self.clusters.remove(cluster).is_none() {
            return;
        }
        info!(cluster = %cluster, "Cluster disconnected");

        let keys: Vec<_> = self
            .watches
            .iter()
            .filter(|entry| &entry.key().0 == cluster)
            .map(|entry| entry.key().clone())
            .collect();
        for key in keys {
            if let Some((_, slot)) = self.watches.remove(&key) {
                if let Some(session) = slot.session {
                    session.stop();
                }
            }
        }
        self.aggregated.remove(cluster);
    }

    /// Abort every running watch session and reset all states to `Stopped`
    pub fn stop_all(&self) {
        for mut slot in self.watches.iter_mut() {
            if let Some(session) = slot.session.take() {
                debug!(cluster = %session.cluster(), kind = %session.kind(), "Stopping watch session");
                session.stop();
            }
            slot.state = WatchState::Stopped;
        }
    }

    /// Number of (cluster, kind) pairs with a running watch
    pub fn running_watches(&self) -> usize {
        self.watches
            .iter()
            .filter(|slot| slot.state == WatchState::Running)
            .count()
    }
}

impl Default for InMemoryClusterRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_INITIAL_SYNC_DELAY)
    }
}

impl ClusterRegistry for InMemoryClusterRegistry {
    fn connected_clusters(&self) -> Vec<ClusterHandle> {
        let mut clusters: Vec<ClusterHandle> =
            self.clusters.iter().map(|entry| entry.value().clone()).collect();
        clusters.sort_by(|a, b| a.id().cmp(b.id()));
        clusters
    }

    fn watch_state(&self, cluster: &ClusterId, kind: ResourceKind) -> WatchState {
        self.watches
            .get(&(cluster.clone(), kind))
            .map(|slot| slot.state)
            .unwrap_or_default()
    }

    fn try_begin_start(&self, cluster: &ClusterId, kind: ResourceKind) -> bool {
        let mut slot = self.watches.entry((cluster.clone(), kind)).or_default();
        if slot.state.can_start() {
            slot.state = WatchState::Starting;
            true
        } else {
            false
        }
    }

    fn set_watch_started(&self, cluster: &ClusterId, kind: ResourceKind, session: WatchSession) {
        let mut slot = self.watches.entry((cluster.clone(), kind)).or_default();
        if slot.state == WatchState::Starting {
            slot.state = WatchState::Running;
            slot.session = Some(session);
        } else {
            debug!(
                cluster = %cluster,
                kind = %kind,
                state = ?slot.state,
                "Watch ended before it was recorded as started"
            );
            session.stop();
        }
    }

    fn set_watch_state(&self, cluster: &ClusterId, kind: ResourceKind, state: WatchState) {
        let mut slot = self.watches.entry((cluster.clone(), kind)).or_default();
        slot.state = state;
        // Detach rather than abort: the caller is usually the session's own task
        slot.session = None;
    }

    fn delay_start(&self, task: DeferredTask) {
        let delay = self.initial_sync_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task();
        });
    }

    fn set_pod_status_aggregated(&self, cluster: &ClusterId, aggregated: bool) {
        debug!(cluster = %cluster, aggregated, "Pod status aggregation flag updated");
        self.aggregated.insert(cluster.clone(), aggregated);
    }

    fn pod_status_aggregated(&self, cluster: &ClusterId) -> bool {
        self.aggregated.get(cluster).map(|v| *v).unwrap_or(false)
    }
}
