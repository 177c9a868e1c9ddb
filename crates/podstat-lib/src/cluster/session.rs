//! Watch session lifecycle
//!
//! Each (cluster, kind) pair moves through
//! `Stopped -> Starting -> Running -> Stopped | Failed`, with `Starting ->
//! Failed` when the watch cannot be established. The supervisor only starts
//! pairs in `Stopped` or `Failed`.

use crate::models::{ClusterId, ResourceKind};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::{AbortHandle, JoinHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchState {
    #[default]
    Stopped,
    Starting,
    Running,
    Failed,
}

impl WatchState {
    /// A watch is in flight or running; the supervisor must not start another
    pub fn is_active(&self) -> bool {
        matches!(self, WatchState::Starting | WatchState::Running)
    }

    /// The supervisor may (re)start the watch
    pub fn can_start(&self) -> bool {
        !self.is_active()
    }
}

/// Handle to a running event processor
///
/// Dropping the handle leaves the consumer running; [`WatchSession::stop`]
/// aborts it, which drops the stream and releases the watch connection.
#[derive(Debug)]
pub struct WatchSession {
    cluster: ClusterId,
    kind: ResourceKind,
    started_at: DateTime<Utc>,
    task: JoinHandle<()>,
}

impl WatchSession {
    pub fn new(cluster: ClusterId, kind: ResourceKind, task: JoinHandle<()>) -> Self {
        Self {
            cluster,
            kind,
            started_at: Utc::now(),
            task,
        }
    }

    pub fn cluster(&self) -> &ClusterId {
        &self.cluster
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Whether the consumer task has exited
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Handle that aborts the consumer without owning the session
    pub fn abort_handle(&self) -> AbortHandle {
        self.task.abort_handle()
    }

    /// Abort the consumer task
    pub fn stop(self) {
        self.task.abort();
    }
}
