//! Per-cluster watch consumer
//!
//! Establishes an all-namespaces pod watch for one cluster and applies every
//! event, in receipt order, to the usage cache, the statistics ledger and the
//! label index. A full listing (sent on start and on every relist) reconciles
//! the cluster's state so pods deleted while unobserved do not linger. The
//! consumer task owns the stream; it is dropped when the task returns or is
//! aborted.

use crate::cluster::{
    ClusterHandle, ClusterRegistry, RawWatchEvent, WatchEventType, WatchSession, WatchState,
    WatchStream, WatchUpdate,
};
use crate::error::Result;
use crate::models::{ClusterId, PodKey, ResourceKind};
use crate::observability::{PodStatMetrics, StructuredLogger};
use crate::services::AggregationServices;
use dashmap::DashMap;
use k8s_openapi::api::core::v1::Pod;
use kube::api::DynamicObject;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_stream::StreamExt;
use tracing::{debug, trace};

#[derive(Clone)]
pub struct EventProcessor {
    registry: Arc<dyn ClusterRegistry>,
    services: AggregationServices,
    kind: ResourceKind,
    /// Last resource version applied per pod
    versions: Arc<DashMap<(ClusterId, PodKey), String>>,
    metrics: PodStatMetrics,
    logger: StructuredLogger,
}

impl EventProcessor {
    pub fn new(registry: Arc<dyn ClusterRegistry>, services: AggregationServices) -> Self {
        Self {
            registry,
            services,
            kind: ResourceKind::Pod,
            versions: Arc::new(DashMap::new()),
            metrics: PodStatMetrics::new(),
            logger: StructuredLogger::new("podstat"),
        }
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// Open the watch and spawn its consumer
    ///
    /// Establishment errors are returned to the caller; the registry state is
    /// left untouched. Once the consumer exits it marks the watch `Stopped`
    /// (server closed the stream) or `Failed` (stream or conversion error).
    pub async fn start(&self, handle: ClusterHandle) -> Result<WatchSession> {
        let cluster = handle.id().clone();
        let stream = handle.client().watch(self.kind).await?;
        self.logger.log_watch_started(&cluster, self.kind);

        let processor = self.clone();
        let task = tokio::spawn(async move { processor.consume(handle, stream).await });

        let registry = self.registry.clone();
        let aggregated = cluster.clone();
        self.registry.delay_start(Box::new(move || {
            registry.set_pod_status_aggregated(&aggregated, true);
        }));

        Ok(WatchSession::new(cluster, self.kind, task))
    }

    async fn consume(self, handle: ClusterHandle, mut stream: WatchStream) {
        let cluster = handle.id().clone();

        let (state, reason) = loop {
            let outcome = match stream.next().await {
                Some(Ok(WatchUpdate::Event(event))) => self.handle_event(&handle, event).await,
                Some(Ok(WatchUpdate::Restarted(objects))) => self.resync(&handle, objects).await,
                Some(Err(e)) => break (WatchState::Failed, e.to_string()),
                None => break (WatchState::Stopped, "stream closed".to_string()),
            };

            if let Err(e) = outcome {
                break (WatchState::Failed, e.to_string());
            }
        };
        drop(stream);

        self.logger
            .log_watch_stopped(&cluster, self.kind, state == WatchState::Failed, &reason);
        self.registry.set_watch_state(&cluster, self.kind, state);
    }

    fn convert(&self, handle: &ClusterHandle, object: DynamicObject) -> Result<Pod> {
        handle.client().convert_pod(object).map_err(|e| {
            self.metrics.inc_conversion_failures();
            debug!(cluster = %handle.id(), error = %e, "Unable to convert watch object into a pod");
            e
        })
    }

    /// Apply one watch event
    ///
    /// Only a payload that cannot be converted into a pod is an error; usage
    /// computation failures are logged and the event's ledger update skipped.
    pub async fn handle_event(&self, handle: &ClusterHandle, event: RawWatchEvent) -> Result<()> {
        let pod = self.convert(handle, event.object)?;
        self.apply(handle, event.event_type, &pod).await;
        Ok(())
    }

    /// Reconcile the cluster's state with a full pod listing
    ///
    /// Tracked pods missing from the listing are dropped from the ledger, the
    /// label index and the cache. Listed pods are then applied as `Added`,
    /// which replaces rather than double counts pods already tracked.
    pub async fn resync(&self, handle: &ClusterHandle, objects: Vec<DynamicObject>) -> Result<()> {
        let pods = objects
            .into_iter()
            .map(|object| self.convert(handle, object))
            .collect::<Result<Vec<_>>>()?;

        let listed: HashSet<PodKey> = pods.iter().filter_map(pod_key).collect();
        let dropped = self.forget_unlisted(handle.id(), &listed).await;

        for pod in &pods {
            self.apply(handle, WatchEventType::Added, pod).await;
        }

        debug!(
            cluster = %handle.id(),
            listed = listed.len(),
            dropped,
            "Resynchronized with full pod listing"
        );
        Ok(())
    }

    async fn forget_unlisted(&self, cluster: &ClusterId, listed: &HashSet<PodKey>) -> usize {
        let services = &self.services;
        let dropped = services.ledger.retain_pods(cluster, listed).await;
        services.labels.retain(cluster, listed).await;

        let cache = services.cache.for_cluster(cluster);
        self.versions.retain(|(owner, key), rv| {
            if owner != cluster || listed.contains(key) {
                return true;
            }
            cache.invalidate_pod(key, rv);
            false
        });

        dropped.len()
    }

    async fn apply(&self, handle: &ClusterHandle, event_type: WatchEventType, pod: &Pod) {
        let cluster = handle.id();
        let client = handle.client().as_ref();

        let Some(key) = pod_key(pod) else {
            debug!(cluster = %cluster, "Skipping watch object without namespace or name");
            return;
        };
        let labels = pod.metadata.labels.clone().unwrap_or_default();
        let services = &self.services;

        match event_type {
            WatchEventType::Added => {
                self.invalidate_previous(cluster, &key, pod);
                self.cache_allocation(handle, pod).await;
                services.ledger.increase_pod_count(cluster, client, pod).await;
                services
                    .labels
                    .update(cluster, &key.namespace, &key.name, labels)
                    .await;
                self.remember_version(cluster, &key, pod);
            }
            WatchEventType::Modified => {
                self.invalidate_previous(cluster, &key, pod);
                self.cache_allocation(handle, pod).await;
                services.ledger.update_pod(cluster, client, pod).await;
                services
                    .labels
                    .update(cluster, &key.namespace, &key.name, labels)
                    .await;
                self.remember_version(cluster, &key, pod);
            }
            WatchEventType::Deleted => {
                self.invalidate_previous(cluster, &key, pod);
                self.versions.remove(&(cluster.clone(), key.clone()));
                services.ledger.reduce_pod_count(cluster, client, pod).await;
                // The reduce may read this version's entry
                if let Some(rv) = pod.metadata.resource_version.as_deref() {
                    services.cache.for_cluster(cluster).invalidate_pod(&key, rv);
                }
                services
                    .labels
                    .delete(cluster, &key.namespace, &key.name)
                    .await;
            }
        }

        self.metrics.inc_watch_event(event_type.as_str());
        trace!(
            cluster = %cluster,
            namespace = %key.namespace,
            pod = %key.name,
            event_type = event_type.as_str(),
            "Applied watch event"
        );
    }

    async fn cache_allocation(&self, handle: &ClusterHandle, pod: &Pod) {
        let cache = self.services.cache.for_cluster(handle.id());
        if let Err(e) = cache.pod_usage_table(handle.client().as_ref(), pod).await {
            debug!(
                cluster = %handle.id(),
                pod = pod.metadata.name.as_deref().unwrap_or_default(),
                error = %e,
                "Failed to cache pod allocation status"
            );
        }
    }

    /// Drop cache entries of the last applied version when the pod has moved on
    fn invalidate_previous(&self, cluster: &ClusterId, key: &PodKey, pod: &Pod) {
        let current = pod.metadata.resource_version.as_deref();
        let previous = self
            .versions
            .get(&(cluster.clone(), key.clone()))
            .map(|rv| rv.value().clone());
        if let Some(previous) = previous {
            if Some(previous.as_str()) != current {
                self.services
                    .cache
                    .for_cluster(cluster)
                    .invalidate_pod(key, &previous);
            }
        }
    }

    fn remember_version(&self, cluster: &ClusterId, key: &PodKey, pod: &Pod) {
        if let Some(rv) = pod.metadata.resource_version.clone() {
            self.versions.insert((cluster.clone(), key.clone()), rv);
        }
    }
}

fn pod_key(pod: &Pod) -> Option<PodKey> {
    let namespace = pod.metadata.namespace.as_deref()?;
    let name = pod.metadata.name.as_deref()?;
    Some(PodKey::new(namespace, name))
}
