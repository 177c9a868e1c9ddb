//! Watch-driven namespace statistics for multi-cluster Kubernetes
//!
//! This crate provides the core functionality for:
//! - Supervising one pod watch per connected cluster
//! - Applying watch events to per-namespace request/limit totals
//! - Memoizing per-pod resource usage by resource version
//! - Indexing pod labels per cluster
//! - Health checks and observability

pub mod annotations;
pub mod cache;
pub mod cluster;
pub mod error;
pub mod health;
pub mod labels;
pub mod ledger;
pub mod models;
pub mod observability;
pub mod quantity;
pub mod services;
pub mod usage;
pub mod watch;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::{CacheKey, CacheKind, ClusterCaches, UsageCache, UsageEntry};
pub use cluster::{
    ClusterClient, ClusterHandle, ClusterRegistry, InMemoryClusterRegistry, KubeClusterClient,
    WatchSession, WatchState,
};
pub use error::{PodStatError, Result};
pub use health::{
    ClusterWatchHealth, Component, ComponentHealth, ComponentStatus, HealthRegistry,
    HealthResponse, ReadinessResponse,
};
pub use labels::{LabelIndex, PodLabelEntry};
pub use ledger::{NamespaceStat, StatsLedger};
pub use models::*;
pub use observability::{PodStatMetrics, StructuredLogger};
pub use services::AggregationServices;
pub use watch::{EventProcessor, SupervisorConfig, WatchSupervisor, WatchSupervisorBuilder};
