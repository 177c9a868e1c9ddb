//! Per-cluster, per-namespace running totals
//!
//! Pods are added and removed incrementally as watch events arrive. All
//! mutation happens under one exclusive lock, so a reader never sees a
//! namespace whose request totals were updated but whose limits were not.
//!
//! The ledger remembers the contribution of every pod it counted. Replayed
//! `Added` events (a restarted watch lists every pod again) replace the
//! earlier contribution, and `Deleted` subtracts exactly what was added even
//! when the pod's spec changed in between. Pods a restarted watch no longer
//! lists are dropped through [`StatsLedger::retain_pods`].

use crate::annotations::{
    add_or_update_annotations, CPU_LIMIT, CPU_REALTIME, CPU_REQUEST, MEMORY_LIMIT,
    MEMORY_REALTIME, MEMORY_REQUEST, NOT_AVAILABLE, POD_COUNT_TOTAL,
};
use crate::cache::ClusterCaches;
use crate::cluster::ClusterClient;
use crate::models::{ClusterId, PodKey, ResourceTotals, ResourceUsage};
use crate::quantity::{cores_2dp, gib_2dp};
use k8s_openapi::api::core::v1::{Namespace, Pod};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Aggregated statistics of one namespace
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NamespaceStat {
    pub cluster: ClusterId,
    pub namespace: String,
    pub pod_count: u64,
    pub requests: ResourceTotals,
    pub limits: ResourceTotals,
    pub cpu_realtime: Option<f64>,
    pub memory_realtime: Option<f64>,
}

impl NamespaceStat {
    fn empty(cluster: &ClusterId, namespace: &str) -> Self {
        Self {
            cluster: cluster.clone(),
            namespace: namespace.to_string(),
            pod_count: 0,
            requests: ResourceTotals::default(),
            limits: ResourceTotals::default(),
            cpu_realtime: None,
            memory_realtime: None,
        }
    }

    /// CPU requests in cores
    pub fn cpu_request(&self) -> f64 {
        self.requests.cpu_millis as f64 / 1000.0
    }

    /// CPU limits in cores
    pub fn cpu_limit(&self) -> f64 {
        self.limits.cpu_millis as f64 / 1000.0
    }

    /// Memory requests in bytes
    pub fn memory_request(&self) -> f64 {
        self.requests.memory_bytes as f64
    }

    /// Memory limits in bytes
    pub fn memory_limit(&self) -> f64 {
        self.limits.memory_bytes as f64
    }

    fn add(&mut self, usage: &ResourceUsage) {
        self.requests = self.requests.saturating_add(usage.requests);
        self.limits = self.limits.saturating_add(usage.limits);
    }

    fn subtract(&mut self, usage: &ResourceUsage) {
        self.requests = self.requests.saturating_sub(usage.requests);
        self.limits = self.limits.saturating_sub(usage.limits);
    }
}

#[derive(Debug)]
struct NamespaceRecord {
    stat: NamespaceStat,
    pods: HashMap<String, ResourceUsage>,
}

type RecordKey = (ClusterId, String);

fn pod_identity(pod: &Pod) -> (&str, &str) {
    (
        pod.metadata.namespace.as_deref().unwrap_or_default(),
        pod.metadata.name.as_deref().unwrap_or_default(),
    )
}

pub struct StatsLedger {
    records: RwLock<HashMap<RecordKey, NamespaceRecord>>,
    cache: Arc<ClusterCaches>,
}

impl StatsLedger {
    pub fn new(cache: Arc<ClusterCaches>) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            cache,
        }
    }

    async fn usage_of(
        &self,
        cluster: &ClusterId,
        client: &dyn ClusterClient,
        pod: &Pod,
    ) -> Option<ResourceUsage> {
        match self.cache.for_cluster(cluster).pod_usage(client, pod).await {
            Ok(usage) => Some(usage),
            Err(e) => {
                let (namespace, name) = pod_identity(pod);
                debug!(
                    cluster = %cluster,
                    namespace = %namespace,
                    pod = %name,
                    error = %e,
                    "Failed to get pod resource usage, skipping"
                );
                None
            }
        }
    }

    /// Count a pod and add its requests and limits to its namespace
    ///
    /// The usage is looked up before the lock is taken. When it cannot be
    /// computed the event is skipped entirely.
    pub async fn increase_pod_count(
        &self,
        cluster: &ClusterId,
        client: &dyn ClusterClient,
        pod: &Pod,
    ) {
        let Some(usage) = self.usage_of(cluster, client, pod).await else {
            return;
        };
        let (namespace, name) = pod_identity(pod);
        self.add_pod_usage(cluster, namespace, name, usage).await;
    }

    /// Uncount a pod and subtract its contribution, clamping at zero
    pub async fn reduce_pod_count(
        &self,
        cluster: &ClusterId,
        client: &dyn ClusterClient,
        pod: &Pod,
    ) {
        let (namespace, name) = pod_identity(pod);
        let key = (cluster.clone(), namespace.to_string());

        let tracked = {
            let records = self.records.read().await;
            match records.get(&key) {
                None => return,
                Some(record) => record.pods.contains_key(name),
            }
        };

        if tracked {
            self.remove_pod_usage(cluster, namespace, name, None).await;
            return;
        }

        // Never counted by this ledger: fall back to the cached usage
        let Some(usage) = self.usage_of(cluster, client, pod).await else {
            return;
        };
        self.remove_pod_usage(cluster, namespace, name, Some(usage)).await;
    }

    /// Replace a pod's contribution with its current usage
    pub async fn update_pod(
        &self,
        cluster: &ClusterId,
        client: &dyn ClusterClient,
        pod: &Pod,
    ) {
        self.increase_pod_count(cluster, client, pod).await
    }

    /// Record `usage` as the contribution of a pod
    ///
    /// A pod that is already tracked has its previous contribution replaced
    /// and is not counted twice.
    pub async fn add_pod_usage(
        &self,
        cluster: &ClusterId,
        namespace: &str,
        pod_name: &str,
        usage: ResourceUsage,
    ) {
        let mut records = self.records.write().await;
        let record = records
            .entry((cluster.clone(), namespace.to_string()))
            .or_insert_with(|| NamespaceRecord {
                stat: NamespaceStat::empty(cluster, namespace),
                pods: HashMap::new(),
            });

        match record.pods.insert(pod_name.to_string(), usage) {
            Some(previous) => record.stat.subtract(&previous),
            None => record.stat.pod_count += 1,
        }
        record.stat.add(&usage);
    }

    /// Remove a pod from its namespace
    ///
    /// The recorded contribution is subtracted when known, otherwise
    /// `fallback`. No-op when the namespace has no record.
    pub async fn remove_pod_usage(
        &self,
        cluster: &ClusterId,
        namespace: &str,
        pod_name: &str,
        fallback: Option<ResourceUsage>,
    ) {
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(&(cluster.clone(), namespace.to_string())) else {
            return;
        };

        let Some(usage) = record.pods.remove(pod_name).or(fallback) else {
            return;
        };
        record.stat.pod_count = record.stat.pod_count.saturating_sub(1);
        record.stat.subtract(&usage);
    }

    /// Drop every tracked pod of `cluster` that is not in `keep`
    ///
    /// Returns the dropped pods. Namespaces stay in place with their totals
    /// reduced.
    pub async fn retain_pods(&self, cluster: &ClusterId, keep: &HashSet<PodKey>) -> Vec<PodKey> {
        let mut records = self.records.write().await;
        let mut dropped = Vec::new();

        for ((_, namespace), record) in records.iter_mut().filter(|((c, _), _)| c == cluster) {
            let stale: Vec<String> = record
                .pods
                .keys()
                .filter(|name| !keep.contains(&PodKey::new(namespace.as_str(), name.as_str())))
                .cloned()
                .collect();

            for name in stale {
                if let Some(usage) = record.pods.remove(&name) {
                    record.stat.pod_count = record.stat.pod_count.saturating_sub(1);
                    record.stat.subtract(&usage);
                }
                dropped.push(PodKey::new(namespace.as_str(), name));
            }
        }
        dropped
    }

    /// Attach the namespace's aggregated statistics as annotations
    ///
    /// The object is returned unchanged when nothing is known about it.
    pub async fn annotate(&self, cluster: &ClusterId, mut namespace: Namespace) -> Namespace {
        let Some(name) = namespace.metadata.name.clone() else {
            return namespace;
        };
        let Some(stat) = self.get(cluster, &name).await else {
            return namespace;
        };

        add_or_update_annotations(
            &mut namespace.metadata,
            [
                (CPU_REQUEST, cores_2dp(stat.requests.cpu_millis)),
                (CPU_LIMIT, cores_2dp(stat.limits.cpu_millis)),
                (CPU_REALTIME, NOT_AVAILABLE.to_string()),
                (MEMORY_REQUEST, gib_2dp(stat.requests.memory_bytes)),
                (MEMORY_LIMIT, gib_2dp(stat.limits.memory_bytes)),
                (MEMORY_REALTIME, NOT_AVAILABLE.to_string()),
                (POD_COUNT_TOTAL, stat.pod_count.to_string()),
            ],
        );
        namespace
    }

    pub async fn get(&self, cluster: &ClusterId, namespace: &str) -> Option<NamespaceStat> {
        let records = self.records.read().await;
        records
            .get(&(cluster.clone(), namespace.to_string()))
            .map(|record| record.stat.clone())
    }

    /// Copies of every namespace record of a cluster, keyed by namespace
    pub async fn snapshot(&self, cluster: &ClusterId) -> BTreeMap<String, NamespaceStat> {
        let records = self.records.read().await;
        records
            .iter()
            .filter(|((c, _), _)| c == cluster)
            .map(|((_, namespace), record)| (namespace.clone(), record.stat.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{pod, FakeClusterClient};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn ledger() -> StatsLedger {
        StatsLedger::new(Arc::new(ClusterCaches::default()))
    }

    fn namespace(name: &str) -> Namespace {
        Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn usage(cpu_millis: u64, memory_bytes: u64) -> ResourceUsage {
        ResourceUsage {
            requests: ResourceTotals::new(cpu_millis, memory_bytes),
            limits: ResourceTotals::new(cpu_millis * 2, memory_bytes * 2),
        }
    }

    #[tokio::test]
    async fn test_increase_then_reduce() {
        let ledger = ledger();
        let client = FakeClusterClient::new();
        let c1 = ClusterId::new("c1");
        let a = pod(
            "default",
            "a",
            "1",
            &[("cpu", "500m"), ("memory", "128Mi")],
            &[("cpu", "1"), ("memory", "256Mi")],
        );
        let b = pod(
            "default",
            "b",
            "1",
            &[("cpu", "250m"), ("memory", "64Mi")],
            &[("cpu", "500m"), ("memory", "128Mi")],
        );

        ledger.increase_pod_count(&c1, &client, &a).await;
        ledger.increase_pod_count(&c1, &client, &b).await;

        let stat = ledger.get(&c1, "default").await.unwrap();
        assert_eq!(stat.pod_count, 2);
        assert_eq!(stat.cpu_request(), 0.75);
        assert_eq!(stat.cpu_limit(), 1.5);
        assert_eq!(stat.memory_request(), 201_326_592.0);
        assert_eq!(stat.memory_limit(), 402_653_184.0);
        assert_eq!(stat.cpu_realtime, None);

        ledger.reduce_pod_count(&c1, &client, &a).await;
        let stat = ledger.get(&c1, "default").await.unwrap();
        assert_eq!(stat.pod_count, 1);
        assert_eq!(stat.cpu_request(), 0.25);
        assert_eq!(stat.memory_request(), 67_108_864.0);
    }

    #[tokio::test]
    async fn test_add_then_delete_is_exact_inverse() {
        let ledger = ledger();
        let client = FakeClusterClient::new();
        let c1 = ClusterId::new("c1");
        let base = pod("default", "base", "1", &[("cpu", "333m")], &[("cpu", "1")]);
        let p = pod(
            "default",
            "p",
            "9",
            &[("cpu", "1m"), ("memory", "1Ki")],
            &[("cpu", "7m")],
        );

        ledger.increase_pod_count(&c1, &client, &base).await;
        let before = ledger.get(&c1, "default").await.unwrap();

        ledger.increase_pod_count(&c1, &client, &p).await;
        ledger.reduce_pod_count(&c1, &client, &p).await;

        assert_eq!(ledger.get(&c1, "default").await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_pod_count_never_negative() {
        let ledger = ledger();
        let c1 = ClusterId::new("c1");

        ledger.add_pod_usage(&c1, "default", "a", usage(100, 10)).await;
        ledger
            .remove_pod_usage(&c1, "default", "a", None)
            .await;
        // Unknown pod with a fallback still clamps at zero
        ledger
            .remove_pod_usage(&c1, "default", "ghost", Some(usage(500, 50)))
            .await;

        let stat = ledger.get(&c1, "default").await.unwrap();
        assert_eq!(stat.pod_count, 0);
        assert_eq!(stat.requests, ResourceTotals::default());
        assert_eq!(stat.limits, ResourceTotals::default());
    }

    #[tokio::test]
    async fn test_reduce_without_record_is_noop() {
        let ledger = ledger();
        let client = FakeClusterClient::new();
        let c1 = ClusterId::new("c1");

        ledger
            .reduce_pod_count(&c1, &client, &pod("default", "a", "1", &[], &[]))
            .await;

        assert_eq!(ledger.get(&c1, "default").await, None);
        // The namespace was never created, so usage was never needed
        assert_eq!(client.usage_calls(), 0);
    }

    #[tokio::test]
    async fn test_replayed_added_does_not_double_count() {
        let ledger = ledger();
        let client = FakeClusterClient::new();
        let c1 = ClusterId::new("c1");
        let a = pod("default", "a", "1", &[("cpu", "500m")], &[]);

        ledger.increase_pod_count(&c1, &client, &a).await;
        ledger.increase_pod_count(&c1, &client, &a).await;

        let stat = ledger.get(&c1, "default").await.unwrap();
        assert_eq!(stat.pod_count, 1);
        assert_eq!(stat.requests.cpu_millis, 500);
    }

    #[tokio::test]
    async fn test_update_pod_rediffs_totals() {
        let ledger = ledger();
        let client = FakeClusterClient::new();
        let c1 = ClusterId::new("c1");

        let v1 = pod("default", "a", "1", &[("cpu", "500m")], &[]);
        let v2 = pod("default", "a", "2", &[("cpu", "2")], &[]);

        ledger.increase_pod_count(&c1, &client, &v1).await;
        ledger.update_pod(&c1, &client, &v2).await;

        let stat = ledger.get(&c1, "default").await.unwrap();
        assert_eq!(stat.pod_count, 1);
        assert_eq!(stat.requests.cpu_millis, 2000);

        // Deleting with the stale object still subtracts the current contribution
        ledger.reduce_pod_count(&c1, &client, &v1).await;
        let stat = ledger.get(&c1, "default").await.unwrap();
        assert_eq!(stat.pod_count, 0);
        assert_eq!(stat.requests.cpu_millis, 0);
    }

    #[tokio::test]
    async fn test_usage_failure_skips_event() {
        let ledger = ledger();
        let client = FakeClusterClient::new();
        client.set_fail_usage(true);
        let c1 = ClusterId::new("c1");

        ledger
            .increase_pod_count(&c1, &client, &pod("default", "a", "1", &[("cpu", "1")], &[]))
            .await;

        assert_eq!(ledger.get(&c1, "default").await, None);
    }

    #[derive(Clone, Copy)]
    enum Op {
        Increase(usize),
        Reduce(usize),
    }

    fn churn_pod(i: usize) -> Pod {
        pod(
            "default",
            &format!("churn-{i}"),
            "1",
            &[("cpu", "100m"), ("memory", "1Mi")],
            &[("cpu", "200m"), ("memory", "2Mi")],
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increase_and_reduce_converge() {
        use rand::seq::SliceRandom;
        use std::sync::atomic::{AtomicBool, Ordering};

        const BASE: usize = 40;
        const CHURN: usize = 30;

        for _ in 0..20 {
            let ledger = Arc::new(ledger());
            let client = Arc::new(FakeClusterClient::new());
            let c1 = ClusterId::new("c1");

            for i in 0..BASE {
                let name = format!("base-{i}");
                let base = pod("default", &name, "1", &[("cpu", "100m"), ("memory", "1Mi")], &[]);
                ledger.increase_pod_count(&c1, client.as_ref(), &base).await;
            }

            // Every churn pod is added once; even ones are also removed, in any order
            let mut ops: Vec<Op> = (0..CHURN).map(Op::Increase).collect();
            ops.extend((0..CHURN).step_by(2).map(Op::Reduce));
            ops.shuffle(&mut rand::rng());

            let done = Arc::new(AtomicBool::new(false));
            let mut readers = Vec::new();
            for _ in 0..4 {
                let ledger = ledger.clone();
                let c1 = c1.clone();
                let done = done.clone();
                readers.push(tokio::spawn(async move {
                    while !done.load(Ordering::SeqCst) {
                        let stat = ledger.get(&c1, "default").await.unwrap();
                        assert!(stat.pod_count <= (BASE + CHURN) as u64);
                        assert_eq!(stat.requests.cpu_millis, stat.pod_count * 100);
                        tokio::task::yield_now().await;
                    }
                }));
            }

            let mut writers = Vec::new();
            for op in ops {
                let ledger = ledger.clone();
                let client = client.clone();
                let c1 = c1.clone();
                writers.push(tokio::spawn(async move {
                    match op {
                        Op::Increase(i) => {
                            ledger.increase_pod_count(&c1, client.as_ref(), &churn_pod(i)).await
                        }
                        Op::Reduce(i) => {
                            ledger.reduce_pod_count(&c1, client.as_ref(), &churn_pod(i)).await
                        }
                    }
                }));
            }
            for writer in writers {
                writer.await.unwrap();
            }
            done.store(true, Ordering::SeqCst);
            for reader in readers {
                reader.await.unwrap();
            }

            let expected = (BASE + CHURN - CHURN / 2) as u64;
            let stat = ledger.get(&c1, "default").await.unwrap();
            assert_eq!(stat.pod_count, expected);
            assert_eq!(stat.requests, ResourceTotals::new(expected * 100, expected * 1024 * 1024));
        }
    }

    #[tokio::test]
    async fn test_same_pod_identity_in_two_clusters() {
        let ledger = ledger();
        let c1 = ClusterId::new("c1");
        let c2 = ClusterId::new("c2");
        let client1 = FakeClusterClient::new();
        let client2 = FakeClusterClient::new();

        let small = pod("default", "web-0", "100", &[("cpu", "500m")], &[]);
        let large = pod("default", "web-0", "100", &[("cpu", "4")], &[]);

        ledger.increase_pod_count(&c1, &client1, &small).await;
        ledger.increase_pod_count(&c2, &client2, &large).await;

        assert_eq!(client2.usage_calls(), 1);
        assert_eq!(ledger.get(&c1, "default").await.unwrap().requests.cpu_millis, 500);
        assert_eq!(ledger.get(&c2, "default").await.unwrap().requests.cpu_millis, 4000);
    }

    #[tokio::test]
    async fn test_retain_pods_drops_unlisted() {
        let ledger = ledger();
        let c1 = ClusterId::new("c1");
        let c2 = ClusterId::new("c2");

        ledger.add_pod_usage(&c1, "default", "a", usage(100, 10)).await;
        ledger.add_pod_usage(&c1, "default", "b", usage(200, 20)).await;
        ledger.add_pod_usage(&c1, "kube-system", "dns", usage(50, 5)).await;
        ledger.add_pod_usage(&c2, "default", "a", usage(100, 10)).await;

        let keep = HashSet::from([PodKey::new("default", "b")]);
        let mut dropped = ledger.retain_pods(&c1, &keep).await;
        dropped.sort();
        assert_eq!(
            dropped,
            vec![PodKey::new("default", "a"), PodKey::new("kube-system", "dns")]
        );

        let stat = ledger.get(&c1, "default").await.unwrap();
        assert_eq!(stat.pod_count, 1);
        assert_eq!(stat.requests, ResourceTotals::new(200, 20));
        assert_eq!(ledger.get(&c1, "kube-system").await.unwrap().pod_count, 0);
        // Other clusters are untouched
        assert_eq!(ledger.get(&c2, "default").await.unwrap().pod_count, 1);
    }

    #[tokio::test]
    async fn test_snapshot_is_scoped_to_cluster() {
        let ledger = ledger();
        let c1 = ClusterId::new("c1");
        let c2 = ClusterId::new("c2");

        ledger.add_pod_usage(&c1, "default", "a", usage(1, 1)).await;
        ledger.add_pod_usage(&c1, "kube-system", "b", usage(1, 1)).await;
        ledger.add_pod_usage(&c2, "default", "c", usage(1, 1)).await;

        let snapshot = ledger.snapshot(&c1).await;
        assert_eq!(
            snapshot.keys().cloned().collect::<Vec<_>>(),
            vec!["default".to_string(), "kube-system".to_string()]
        );
        assert!(ledger.snapshot(&ClusterId::new("c3")).await.is_empty());
    }

    #[tokio::test]
    async fn test_annotate_namespace() {
        let ledger = ledger();
        let c1 = ClusterId::new("c1");
        ledger
            .add_pod_usage(
                &c1,
                "default",
                "a",
                ResourceUsage {
                    requests: ResourceTotals::new(750, 3 * 1024 * 1024 * 1024 / 2),
                    limits: ResourceTotals::new(1500, 3 * 1024 * 1024 * 1024),
                },
            )
            .await;

        let annotated = ledger.annotate(&c1, namespace("default")).await;
        let annotations = annotated.metadata.annotations.unwrap();
        assert_eq!(annotations[CPU_REQUEST], "0.75");
        assert_eq!(annotations[CPU_LIMIT], "1.50");
        assert_eq!(annotations[CPU_REALTIME], "-");
        assert_eq!(annotations[MEMORY_REQUEST], "1.50");
        assert_eq!(annotations[MEMORY_LIMIT], "3.00");
        assert_eq!(annotations[MEMORY_REALTIME], "-");
        assert_eq!(annotations[POD_COUNT_TOTAL], "1");

        let untouched = ledger.annotate(&c1, namespace("other")).await;
        assert_eq!(untouched.metadata.annotations, None);
    }
}
