//! String annotations attached to externally owned objects
//!
//! The outer API layer serializes the annotated objects; this crate only
//! fills in metadata.

use crate::cache::UsageCache;
use crate::cluster::ClusterClient;
use crate::usage::{CPU, MEMORY};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::debug;

pub const CPU_REQUEST: &str = "cpu.request";
pub const CPU_LIMIT: &str = "cpu.limit";
pub const CPU_REALTIME: &str = "cpu.realtime";
pub const MEMORY_REQUEST: &str = "memory.request";
pub const MEMORY_LIMIT: &str = "memory.limit";
pub const MEMORY_REALTIME: &str = "memory.realtime";
pub const POD_COUNT_TOTAL: &str = "pod.count.total";

/// Placeholder for values that are not collected
pub const NOT_AVAILABLE: &str = "-";

/// Merge `values` into the object's annotations, overwriting existing keys
pub fn add_or_update_annotations<I, K, V>(meta: &mut ObjectMeta, values: I)
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    let annotations = meta.annotations.get_or_insert_with(Default::default);
    for (key, value) in values {
        annotations.insert(key.into(), value.into());
    }
}

/// Attach the pod's allocation table as `cpu.*` / `memory.*` annotations
///
/// The table is served from the cache when the pod's resource version has
/// been seen before. On failure the pod is returned unchanged.
pub async fn annotate_pod_allocation(
    cache: &UsageCache,
    client: &dyn ClusterClient,
    mut pod: Pod,
) -> Pod {
    let rows = match cache.pod_usage_table(client, &pod).await {
        Ok(rows) => rows,
        Err(e) => {
            debug!(
                pod = pod.metadata.name.as_deref().unwrap_or_default(),
                error = %e,
                "Failed to get pod allocation table"
            );
            return pod;
        }
    };

    for row in rows {
        let prefix = match row.resource_type.as_str() {
            CPU => CPU,
            MEMORY => MEMORY,
            _ => continue,
        };
        add_or_update_annotations(
            &mut pod.metadata,
            [
                (format!("{prefix}.request"), row.request),
                (format!("{prefix}.requestFraction"), row.request_fraction),
                (format!("{prefix}.limit"), row.limit),
                (format!("{prefix}.limitFraction"), row.limit_fraction),
                (format!("{prefix}.total"), row.total),
            ],
        );
    }
    pod
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{pod, FakeClusterClient};

    #[test]
    fn test_add_or_update_annotations() {
        let mut meta = ObjectMeta::default();
        add_or_update_annotations(&mut meta, [("a", "1"), ("b", "2")]);
        add_or_update_annotations(&mut meta, [("b", "3")]);

        let annotations = meta.annotations.unwrap();
        assert_eq!(annotations["a"], "1");
        assert_eq!(annotations["b"], "3");
    }

    #[tokio::test]
    async fn test_annotate_pod_allocation() {
        let cache = UsageCache::default();
        let client = FakeClusterClient::new();
        let web = pod("default", "web", "1", &[("cpu", "500m")], &[("memory", "1Gi")]);

        let annotated = annotate_pod_allocation(&cache, &client, web.clone()).await;
        let annotations = annotated.metadata.annotations.unwrap();
        assert_eq!(annotations["cpu.request"], "500m");
        assert_eq!(annotations["cpu.requestFraction"], "0");
        assert_eq!(annotations["memory.limit"], "1Gi");
        assert_eq!(annotations.len(), 10);

        // Second lookup for the same version is served from the cache
        annotate_pod_allocation(&cache, &client, web).await;
        assert_eq!(client.usage_calls(), 1);
    }

    #[tokio::test]
    async fn test_annotate_pod_allocation_failure_leaves_pod() {
        let cache = UsageCache::default();
        let client = FakeClusterClient::new();
        client.set_fail_usage(true);

        let annotated =
            annotate_pod_allocation(&cache, &client, pod("default", "web", "1", &[], &[])).await;
        assert_eq!(annotated.metadata.annotations, None);
    }
}
