//! Error types for the aggregation engine

use crate::models::ClusterId;
use thiserror::Error;

/// Errors raised by the engine and its cluster collaborators
///
/// Every variant is cluster scoped. None of them is fatal to the hosting
/// process; the supervisor retries on its next tick.
#[derive(Debug, Error)]
pub enum PodStatError {
    #[error("failed to establish watch on cluster {cluster}: {message}")]
    WatchEstablish { cluster: ClusterId, message: String },

    #[error("watch stream failed: {0}")]
    Stream(String),

    #[error("failed to convert watch object into a pod: {0}")]
    Conversion(#[from] serde_json::Error),

    #[error("failed to compute resource usage for {pod}: {message}")]
    Usage { pod: String, message: String },

    #[error("invalid quantity {0:?}")]
    InvalidQuantity(String),

    #[error("kubernetes client error: {0}")]
    Kube(#[from] kube::Error),

    #[error("kubeconfig error: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),
}

pub type Result<T> = std::result::Result<T, PodStatError>;
