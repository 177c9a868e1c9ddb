//! Cluster collaborators
//!
//! The engine never talks to the Kubernetes API directly. It goes through two
//! seams:
//! - [`ClusterClient`]: per-cluster watch establishment, object conversion
//!   and resource usage computation
//! - [`ClusterRegistry`]: the set of connected clusters and the per
//!   (cluster, kind) watch state machine

mod kube_client;
mod registry;
mod session;

pub use kube_client::KubeClusterClient;
pub use registry::{DeferredTask, InMemoryClusterRegistry};
pub use session::{WatchSession, WatchState};

use crate::error::Result;
use crate::models::{ClusterId, ResourceKind, ResourceUsage, ResourceUsageRow};
use k8s_openapi::api::core::v1::Pod;
use kube::api::DynamicObject;
use std::pin::Pin;
use std::sync::Arc;
use tokio_stream::Stream;

pub use async_trait::async_trait;

/// Type of a watch notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
}

impl WatchEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatchEventType::Added => "added",
            WatchEventType::Modified => "modified",
            WatchEventType::Deleted => "deleted",
        }
    }
}

/// One watch notification carrying the untyped object payload
#[derive(Debug, Clone)]
pub struct RawWatchEvent {
    pub event_type: WatchEventType,
    pub object: DynamicObject,
}

/// Item yielded by a watch stream
#[derive(Debug, Clone)]
pub enum WatchUpdate {
    /// A single pod change
    Event(RawWatchEvent),
    /// Full listing of the watched objects
    ///
    /// Sent when the watch starts and whenever it had to relist. Anything
    /// tracked for the cluster but missing here was deleted while unobserved.
    Restarted(Vec<DynamicObject>),
}

impl From<RawWatchEvent> for WatchUpdate {
    fn from(event: RawWatchEvent) -> Self {
        WatchUpdate::Event(event)
    }
}

/// Stream of watch updates; ends when the server closes the watch
pub type WatchStream = Pin<Box<dyn Stream<Item = Result<WatchUpdate>> + Send>>;

/// Per-cluster API access used by the event processor
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Open a watch over all namespaces with administrative credentials
    async fn watch(&self, kind: ResourceKind) -> Result<WatchStream>;

    /// Convert an untyped watch payload into a pod
    fn convert_pod(&self, object: DynamicObject) -> Result<Pod> {
        let value = serde_json::to_value(object)?;
        Ok(serde_json::from_value(value)?)
    }

    /// Request/limit summary of a pod (expensive, cached by the caller)
    async fn resource_usage(&self, pod: &Pod) -> Result<ResourceUsage>;

    /// Per-resource allocation table of a pod (expensive, cached by the caller)
    async fn resource_usage_table(&self, pod: &Pod) -> Result<Vec<ResourceUsageRow>>;
}

/// A connected cluster as handed out by the registry
#[derive(Clone)]
pub struct ClusterHandle {
    id: ClusterId,
    client: Arc<dyn ClusterClient>,
}

impl ClusterHandle {
    pub fn new(id: impl Into<ClusterId>, client: Arc<dyn ClusterClient>) -> Self {
        Self {
            id: id.into(),
            client,
        }
    }

    pub fn id(&self) -> &ClusterId {
        &self.id
    }

    pub fn client(&self) -> &Arc<dyn ClusterClient> {
        &self.client
    }
}

impl std::fmt::Debug for ClusterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterHandle").field("id", &self.id).finish()
    }
}

/// Source of connected clusters and owner of the watch state per
/// (cluster, kind)
pub trait ClusterRegistry: Send + Sync {
    /// Clusters that are currently connected
    fn connected_clusters(&self) -> Vec<ClusterHandle>;

    /// Current watch state; `Stopped` when never started
    fn watch_state(&self, cluster: &ClusterId, kind: ResourceKind) -> WatchState;

    /// Whether a watch is starting or running
    fn watch_status(&self, cluster: &ClusterId, kind: ResourceKind) -> bool {
        self.watch_state(cluster, kind).is_active()
    }

    /// Atomically move `Stopped | Failed` to `Starting`
    ///
    /// Returns false when another start is in flight or a watch is running.
    fn try_begin_start(&self, cluster: &ClusterId, kind: ResourceKind) -> bool;

    /// Record a started session, moving `Starting` to `Running`
    ///
    /// If the watch already ended (state moved on from `Starting`) the session
    /// is stopped and discarded.
    fn set_watch_started(&self, cluster: &ClusterId, kind: ResourceKind, session: WatchSession);

    /// Move to a terminal state (`Stopped` or `Failed`), releasing any session
    fn set_watch_state(&self, cluster: &ClusterId, kind: ResourceKind, state: WatchState);

    /// Run `task` once the initial list-and-watch synchronization window
    /// has elapsed
    fn delay_start(&self, task: DeferredTask);

    /// Mark whether pod statistics of a cluster are fully aggregated
    fn set_pod_status_aggregated(&self, cluster: &ClusterId, aggregated: bool);

    fn pod_status_aggregated(&self, cluster: &ClusterId) -> bool;
}
