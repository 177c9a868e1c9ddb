//! Per-cluster pod label index
//!
//! Serves current pod labels for display and filtering without extra API
//! calls. Each cluster has its own reader/writer lock; clusters never contend
//! with each other.

use crate::models::{ClusterId, Labels, PodKey};
use dashmap::DashMap;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Labels of one pod as tracked by the index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodLabelEntry {
    pub cluster: ClusterId,
    pub namespace: String,
    pub pod_name: String,
    pub labels: Labels,
}

type ClusterLabels = Arc<RwLock<HashMap<PodKey, PodLabelEntry>>>;

#[derive(Default)]
pub struct LabelIndex {
    clusters: DashMap<ClusterId, ClusterLabels>,
}

impl LabelIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn cluster(&self, cluster: &ClusterId) -> Option<ClusterLabels> {
        self.clusters.get(cluster).map(|entry| entry.value().clone())
    }

    fn cluster_or_create(&self, cluster: &ClusterId) -> ClusterLabels {
        self.clusters.entry(cluster.clone()).or_default().value().clone()
    }

    /// Insert or replace the labels of a pod
    pub async fn update(&self, cluster: &ClusterId, namespace: &str, pod_name: &str, labels: Labels) {
        let index = self.cluster_or_create(cluster);
        let mut pods = index.write().await;
        let key = PodKey::new(namespace, pod_name);

        match pods.get_mut(&key) {
            Some(entry) => entry.labels = labels,
            None => {
                pods.insert(
                    key,
                    PodLabelEntry {
                        cluster: cluster.clone(),
                        namespace: namespace.to_string(),
                        pod_name: pod_name.to_string(),
                        labels,
                    },
                );
            }
        }
    }

    /// Remove a pod; no-op when unknown
    pub async fn delete(&self, cluster: &ClusterId, namespace: &str, pod_name: &str) {
        if let Some(index) = self.cluster(cluster) {
            index.write().await.remove(&PodKey::new(namespace, pod_name));
        }
    }

    /// Keep only the pods in `keep`, returning how many were removed
    pub async fn retain(&self, cluster: &ClusterId, keep: &HashSet<PodKey>) -> usize {
        let Some(index) = self.cluster(cluster) else {
            return 0;
        };
        let mut pods = index.write().await;
        let before = pods.len();
        pods.retain(|key, _| keep.contains(key));
        before - pods.len()
    }

    pub async fn get(&self, cluster: &ClusterId, namespace: &str, pod_name: &str) -> Option<Labels> {
        let index = self.cluster(cluster)?;
        let pods = index.read().await;
        pods.get(&PodKey::new(namespace, pod_name))
            .map(|entry| entry.labels.clone())
    }

    /// Copies of every pod's labels keyed by `namespace/pod`
    pub async fn get_all(&self, cluster: &ClusterId) -> HashMap<String, Labels> {
        let Some(index) = self.cluster(cluster) else {
            return HashMap::new();
        };
        let pods = index.read().await;
        pods.iter()
            .map(|(key, entry)| (key.to_string(), entry.labels.clone()))
            .collect()
    }

    /// Distinct `key=value` pairs across all pods of a cluster
    pub async fn get_unique(&self, cluster: &ClusterId) -> BTreeSet<String> {
        let Some(index) = self.cluster(cluster) else {
            return BTreeSet::new();
        };
        let pods = index.read().await;
        pods.values()
            .flat_map(|entry| entry.labels.iter())
            .map(|(k, v)| format!("{}={}", k, v))
            .collect()
    }

    /// Number of pods tracked for a cluster
    pub async fn pod_count(&self, cluster: &ClusterId) -> usize {
        match self.cluster(cluster) {
            Some(index) => index.read().await.len(),
            None => 0,
        }
    }
}
