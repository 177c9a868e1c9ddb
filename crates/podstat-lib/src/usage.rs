//! Pod resource usage calculation
//!
//! Computes the effective requests and limits of a pod the same way the
//! scheduler accounts for them: for each resource, the larger of the sum over
//! regular containers and the maximum over init containers, plus the pod
//! overhead.

use crate::error::Result;
use crate::models::{ResourceTotals, ResourceUsage, ResourceUsageRow};
use crate::quantity::{
    cpu_millis, format_cpu_millis, format_memory_bytes, memory_bytes, percent,
};
use k8s_openapi::api::core::v1::{Container, Pod, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::collections::BTreeMap;

pub const CPU: &str = "cpu";
pub const MEMORY: &str = "memory";

type ResourceList = BTreeMap<String, Quantity>;

fn totals_of(list: Option<&ResourceList>) -> Result<ResourceTotals> {
    let mut totals = ResourceTotals::default();
    if let Some(list) = list {
        if let Some(q) = list.get(CPU) {
            totals.cpu_millis = cpu_millis(q)?;
        }
        if let Some(q) = list.get(MEMORY) {
            totals.memory_bytes = memory_bytes(q)?;
        }
    }
    Ok(totals)
}

fn container_totals(
    container: &Container,
    pick: fn(&ResourceRequirements) -> Option<&ResourceList>,
) -> Result<ResourceTotals> {
    totals_of(container.resources.as_ref().and_then(pick))
}

fn effective(
    containers: &[Container],
    init_containers: &[Container],
    overhead: Option<&ResourceList>,
    pick: fn(&ResourceRequirements) -> Option<&ResourceList>,
) -> Result<ResourceTotals> {
    let mut sum = ResourceTotals::default();
    for container in containers {
        sum = sum.saturating_add(container_totals(container, pick)?);
    }

    for init in init_containers {
        let t = container_totals(init, pick)?;
        sum.cpu_millis = sum.cpu_millis.max(t.cpu_millis);
        sum.memory_bytes = sum.memory_bytes.max(t.memory_bytes);
    }

    Ok(sum.saturating_add(totals_of(overhead)?))
}

/// Effective requests and limits of a pod
pub fn pod_resource_usage(pod: &Pod) -> Result<ResourceUsage> {
    let Some(spec) = pod.spec.as_ref() else {
        return Ok(ResourceUsage::default());
    };
    let init = spec.init_containers.as_deref().unwrap_or_default();
    let overhead = spec.overhead.as_ref();

    Ok(ResourceUsage {
        requests: effective(&spec.containers, init, overhead, |r| r.requests.as_ref())?,
        limits: effective(&spec.containers, init, overhead, |r| r.limits.as_ref())?,
    })
}

/// Allocation table for a pod, fractions relative to node allocatable
///
/// `allocatable` is the hosting node's allocatable resources; when unknown
/// (unscheduled pod, node lookup failed) fractions are reported as `"0"`.
pub fn pod_resource_usage_table(
    pod: &Pod,
    allocatable: Option<&ResourceList>,
) -> Result<Vec<ResourceUsageRow>> {
    let usage = pod_resource_usage(pod)?;
    let node = totals_of(allocatable)?;

    Ok(vec![
        ResourceUsageRow {
            resource_type: CPU.to_string(),
            request: format_cpu_millis(usage.requests.cpu_millis),
            request_fraction: percent(usage.requests.cpu_millis, node.cpu_millis),
            limit: format_cpu_millis(usage.limits.cpu_millis),
            limit_fraction: percent(usage.limits.cpu_millis, node.cpu_millis),
            total: format_cpu_millis(node.cpu_millis),
        },
        ResourceUsageRow {
            resource_type: MEMORY.to_string(),
            request: format_memory_bytes(usage.requests.memory_bytes),
            request_fraction: percent(usage.requests.memory_bytes, node.memory_bytes),
            limit: format_memory_bytes(usage.limits.memory_bytes),
            limit_fraction: percent(usage.limits.memory_bytes, node.memory_bytes),
            total: format_memory_bytes(node.memory_bytes),
        },
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{container, pod, resources};

    #[test]
    fn test_single_container_usage() {
        let pod = pod(
            "default",
            "web",
            "1",
            &[("cpu", "500m"), ("memory", "128Mi")],
            &[("cpu", "1"), ("memory", "256Mi")],
        );

        let usage = pod_resource_usage(&pod).unwrap();
        assert_eq!(usage.requests, ResourceTotals::new(500, 134_217_728));
        assert_eq!(usage.limits, ResourceTotals::new(1000, 268_435_456));
    }

    #[test]
    fn test_init_containers_take_max() {
        let mut pod = pod("default", "web", "1", &[("cpu", "200m")], &[]);
        let spec = pod.spec.as_mut().unwrap();
        spec.containers
            .push(container("sidecar", &[("cpu", "100m")], &[]));
        spec.init_containers = Some(vec![container("migrate", &[("cpu", "1")], &[])]);

        let usage = pod_resource_usage(&pod).unwrap();
        assert_eq!(usage.requests.cpu_millis, 1000);

        pod.spec.as_mut().unwrap().init_containers =
            Some(vec![container("migrate", &[("cpu", "100m")], &[])]);
        let usage = pod_resource_usage(&pod).unwrap();
        assert_eq!(usage.requests.cpu_millis, 300);
    }

    #[test]
    fn test_overhead_is_added() {
        let mut pod = pod("default", "web", "1", &[("memory", "100Mi")], &[]);
        pod.spec.as_mut().unwrap().overhead = resources(&[("memory", "20Mi")]);

        let usage = pod_resource_usage(&pod).unwrap();
        assert_eq!(usage.requests.memory_bytes, 120 * 1024 * 1024);
    }

    #[test]
    fn test_pod_without_spec() {
        let usage = pod_resource_usage(&Pod::default()).unwrap();
        assert_eq!(usage, ResourceUsage::default());
    }

    #[test]
    fn test_usage_table_fractions() {
        let pod = pod(
            "default",
            "web",
            "1",
            &[("cpu", "500m"), ("memory", "1Gi")],
            &[("cpu", "1")],
        );
        let allocatable = resources(&[("cpu", "4"), ("memory", "4Gi")]);

        let rows = pod_resource_usage_table(&pod, allocatable.as_ref()).unwrap();
        assert_eq!(rows.len(), 2);

        let cpu = &rows[0];
        assert_eq!(cpu.resource_type, "cpu");
        assert_eq!(cpu.request, "500m");
        assert_eq!(cpu.request_fraction, "12.50");
        assert_eq!(cpu.limit, "1");
        assert_eq!(cpu.limit_fraction, "25.00");
        assert_eq!(cpu.total, "4");

        let memory = &rows[1];
        assert_eq!(memory.request, "1Gi");
        assert_eq!(memory.request_fraction, "25.00");
        assert_eq!(memory.limit_fraction, "0.00");
    }

    #[test]
    fn test_usage_table_without_node() {
        let pod = pod("default", "web", "1", &[("cpu", "500m")], &[]);
        let rows = pod_resource_usage_table(&pod, None).unwrap();
        assert_eq!(rows[0].request_fraction, "0");
        assert_eq!(rows[0].total, "0");
    }
}
