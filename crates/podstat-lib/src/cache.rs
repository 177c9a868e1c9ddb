//! TTL cache for per-pod resource usage
//!
//! Keys embed the pod's resource version, so any change to the pod produces a
//! new key and naturally misses the cache. Entries are never mutated once
//! written: they are replaced under a new key, deleted, or expire.
//!
//! Keys carry no cluster, so every cluster gets its own [`UsageCache`]
//! through [`ClusterCaches`].

use crate::cluster::ClusterClient;
use crate::error::{PodStatError, Result};
use crate::models::{ClusterId, PodKey, ResourceUsage, ResourceUsageRow};
use crate::observability::PodStatMetrics;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use k8s_openapi::api::core::v1::Pod;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Default entry lifetime (24 hours)
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// What a cache entry holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    /// Request/limit summary used by the ledger
    PodResourceUsage,
    /// Row table used for pod allocation annotations
    PodAllocatedStatus,
}

impl CacheKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheKind::PodResourceUsage => "PodResourceUsage",
            CacheKind::PodAllocatedStatus => "PodAllocatedStatus",
        }
    }
}

/// `<kind>/<namespace>/<name>/<resourceVersion>`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(kind: CacheKind, namespace: &str, name: &str, resource_version: &str) -> Self {
        Self(format!(
            "{}/{}/{}/{}",
            kind.as_str(),
            namespace,
            name,
            resource_version
        ))
    }

    pub fn for_pod(kind: CacheKind, pod: &Pod) -> Self {
        let meta = &pod.metadata;
        Self::new(
            kind,
            meta.namespace.as_deref().unwrap_or_default(),
            meta.name.as_deref().unwrap_or_default(),
            meta.resource_version.as_deref().unwrap_or_default(),
        )
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Cached value
#[derive(Debug, Clone, PartialEq)]
pub enum UsageEntry {
    Summary(ResourceUsage),
    Table(Vec<ResourceUsageRow>),
}

#[derive(Debug)]
struct CacheEntry {
    value: UsageEntry,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Thread-safe get-or-compute cache
pub struct UsageCache {
    entries: DashMap<String, CacheEntry>,
    ttl: Duration,
    metrics: PodStatMetrics,
}

impl UsageCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            metrics: PodStatMetrics::new(),
        }
    }

    /// TTL applied by the typed helpers
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn live(&self, key: &CacheKey) -> Option<UsageEntry> {
        let entry = self.entries.get(key.as_str())?;
        entry.is_live(Instant::now()).then(|| entry.value.clone())
    }

    /// Return the live entry for `key`, or compute, store and return it
    ///
    /// `compute` errors are returned unchanged and nothing is stored. Two
    /// concurrent misses may both compute; the first stored value wins.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: &CacheKey,
        ttl: Duration,
        compute: F,
    ) -> Result<UsageEntry>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<UsageEntry>>,
    {
        if let Some(value) = self.live(key) {
            self.metrics.inc_cache_hit();
            return Ok(value);
        }

        self.metrics.inc_cache_miss();
        let value = compute().await?;
        let now = Instant::now();

        let stored = match self.entries.entry(key.as_str().to_string()) {
            Entry::Occupied(existing) if existing.get().is_live(now) => {
                existing.get().value.clone()
            }
            Entry::Occupied(mut expired) => {
                expired.insert(CacheEntry {
                    value: value.clone(),
                    expires_at: now + ttl,
                });
                value
            }
            Entry::Vacant(slot) => {
                slot.insert(CacheEntry {
                    value: value.clone(),
                    expires_at: now + ttl,
                });
                value
            }
        };

        Ok(stored)
    }

    /// Remove an entry; no-op when absent
    pub fn delete(&self, key: &CacheKey) {
        if self.entries.remove(key.as_str()).is_some() {
            debug!(key = %key, "Removed cache entry");
        }
    }

    /// Remove every cache entry recorded for one version of a pod
    pub fn invalidate_pod(&self, pod: &PodKey, resource_version: &str) {
        for kind in [CacheKind::PodResourceUsage, CacheKind::PodAllocatedStatus] {
            self.delete(&CacheKey::new(kind, &pod.namespace, &pod.name, resource_version));
        }
    }

    /// Drop expired entries, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live(now));
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Request/limit summary of a pod, computed by `client` on a miss
    pub async fn pod_usage(&self, client: &dyn ClusterClient, pod: &Pod) -> Result<ResourceUsage> {
        let key = CacheKey::for_pod(CacheKind::PodResourceUsage, pod);
        let entry = self
            .get_or_compute(&key, self.ttl, || async {
                client.resource_usage(pod).await.map(UsageEntry::Summary)
            })
            .await?;

        match entry {
            UsageEntry::Summary(usage) => Ok(usage),
            UsageEntry::Table(_) => Err(mismatch(&key)),
        }
    }

    /// Allocation table of a pod, computed by `client` on a miss
    pub async fn pod_usage_table(
        &self,
        client: &dyn ClusterClient,
        pod: &Pod,
    ) -> Result<Vec<ResourceUsageRow>> {
        let key = CacheKey::for_pod(CacheKind::PodAllocatedStatus, pod);
        let entry = self
            .get_or_compute(&key, self.ttl, || async {
                client.resource_usage_table(pod).await.map(UsageEntry::Table)
            })
            .await?;

        match entry {
            UsageEntry::Table(rows) => Ok(rows),
            UsageEntry::Summary(_) => Err(mismatch(&key)),
        }
    }
}

impl Default for UsageCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

/// Usage caches of every cluster, created on first use
pub struct ClusterCaches {
    caches: DashMap<ClusterId, Arc<UsageCache>>,
    ttl: Duration,
    metrics: PodStatMetrics,
}

impl ClusterCaches {
    pub fn new(ttl: Duration) -> Self {
        Self {
            caches: DashMap::new(),
            ttl,
            metrics: PodStatMetrics::new(),
        }
    }

    pub fn for_cluster(&self, cluster: &ClusterId) -> Arc<UsageCache> {
        self.caches
            .entry(cluster.clone())
            .or_insert_with(|| Arc::new(UsageCache::new(self.ttl)))
            .value()
            .clone()
    }

    /// Drop a cluster's cache entirely
    pub fn remove(&self, cluster: &ClusterId) {
        self.caches.remove(cluster);
    }

    /// Purge expired entries of every cluster and refresh the entry gauge
    pub fn purge_expired(&self) -> usize {
        let caches: Vec<Arc<UsageCache>> =
            self.caches.iter().map(|entry| entry.value().clone()).collect();
        let removed = caches.iter().map(|cache| cache.purge_expired()).sum();
        self.metrics.set_cache_entries(self.len() as i64);
        removed
    }

    /// Entries across all clusters
    pub fn len(&self) -> usize {
        self.caches.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ClusterCaches {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

fn mismatch(key: &CacheKey) -> PodStatError {
    PodStatError::Usage {
        pod: key.to_string(),
        message: "cache entry holds a different value kind".to_string(),
    }
}
