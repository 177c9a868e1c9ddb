//! `kube`-backed cluster client
//!
//! Watches run with the credentials of the configured kubeconfig context,
//! which act as the administrative identity for the whole cluster. They are
//! driven by `kube::runtime::watcher`, which resumes after server-side
//! timeouts and relists when its resource version expires.

use super::{async_trait, ClusterClient, RawWatchEvent, WatchEventType, WatchStream, WatchUpdate};
use crate::error::{PodStatError, Result};
use crate::models::{ClusterId, ResourceKind, ResourceUsage, ResourceUsageRow};
use crate::usage::{pod_resource_usage, pod_resource_usage_table};
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{Api, ApiResource, DynamicObject, ListParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::watcher;
use kube::{Client, Config};
use std::collections::BTreeMap;
use std::path::Path;
use tokio_stream::StreamExt;
use tracing::{debug, info};

pub struct KubeClusterClient {
    cluster: ClusterId,
    client: Client,
}

impl KubeClusterClient {
    pub fn new(cluster: ClusterId, client: Client) -> Self {
        Self { cluster, client }
    }

    /// Build a client for one kubeconfig context
    ///
    /// Uses the default kubeconfig resolution (`KUBECONFIG`, `~/.kube/config`)
    /// unless an explicit path is given.
    pub async fn from_context(
        cluster: ClusterId,
        kubeconfig: Option<&Path>,
        context: &str,
    ) -> Result<Self> {
        let options = KubeConfigOptions {
            context: Some(context.to_string()),
            ..Default::default()
        };

        let config = match kubeconfig {
            Some(path) => {
                let raw = Kubeconfig::read_from(path)?;
                Config::from_custom_kubeconfig(raw, &options).await?
            }
            None => Config::from_kubeconfig(&options).await?,
        };

        info!(cluster = %cluster, context = %context, server = %config.cluster_url, "Built cluster client");
        Ok(Self::new(cluster, Client::try_from(config)?))
    }

    fn api_resource(kind: ResourceKind) -> ApiResource {
        match kind {
            ResourceKind::Pod => ApiResource::erase::<Pod>(&()),
        }
    }

    async fn node_allocatable(
        &self,
        node_name: &str,
    ) -> Result<Option<BTreeMap<String, Quantity>>> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let node = nodes.get_opt(node_name).await?;
        Ok(node.and_then(|n| n.status).and_then(|s| s.allocatable))
    }
}

/// `Applied` does not tell creation from update; both upsert downstream
fn translate(item: watcher::Result<watcher::Event<DynamicObject>>) -> Result<WatchUpdate> {
    let (event_type, object) = match item {
        Ok(watcher::Event::Applied(object)) => (WatchEventType::Modified, object),
        Ok(watcher::Event::Deleted(object)) => (WatchEventType::Deleted, object),
        Ok(watcher::Event::Restarted(objects)) => return Ok(WatchUpdate::Restarted(objects)),
        Err(e) => return Err(PodStatError::Stream(e.to_string())),
    };
    Ok(WatchUpdate::Event(RawWatchEvent { event_type, object }))
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn watch(&self, kind: ResourceKind) -> Result<WatchStream> {
        let resource = Self::api_resource(kind);
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &resource);

        // The watcher is lazy; a one-item list surfaces auth and connectivity
        // errors to the caller instead of the consumer
        api.list(&ListParams::default().limit(1))
            .await
            .map_err(|e| PodStatError::WatchEstablish {
                cluster: self.cluster.clone(),
                message: e.to_string(),
            })?;

        debug!(cluster = %self.cluster, kind = %kind, "Watch established");
        let stream = watcher(api, watcher::Config::default()).map(translate);
        Ok(Box::pin(stream))
    }

    async fn resource_usage(&self, pod: &Pod) -> Result<ResourceUsage> {
        pod_resource_usage(pod)
    }

    async fn resource_usage_table(&self, pod: &Pod) -> Result<Vec<ResourceUsageRow>> {
        let node_name = pod.spec.as_ref().and_then(|s| s.node_name.as_deref());
        let allocatable = match node_name {
            Some(name) => self.node_allocatable(name).await?,
            None => None,
        };
        pod_resource_usage_table(pod, allocatable.as_ref())
    }
}
