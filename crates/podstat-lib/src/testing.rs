//! Test fixtures: pod builders and a scriptable cluster client

use crate::cluster::{
    async_trait, ClusterClient, RawWatchEvent, WatchEventType, WatchStream, WatchUpdate,
};
use crate::error::{PodStatError, Result};
use crate::models::{ResourceKind, ResourceUsage, ResourceUsageRow};
use crate::usage::{pod_resource_usage, pod_resource_usage_table};
use k8s_openapi::api::core::v1::{Container, Pod, PodSpec, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::DynamicObject;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

pub fn resources(pairs: &[(&str, &str)]) -> Option<BTreeMap<String, Quantity>> {
    if pairs.is_empty() {
        return None;
    }
    Some(
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Quantity(v.to_string())))
            .collect(),
    )
}

pub fn container(name: &str, requests: &[(&str, &str)], limits: &[(&str, &str)]) -> Container {
    Container {
        name: name.to_string(),
        resources: Some(ResourceRequirements {
            requests: resources(requests),
            limits: resources(limits),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Pod with a single container
pub fn pod(
    namespace: &str,
    name: &str,
    resource_version: &str,
    requests: &[(&str, &str)],
    limits: &[(&str, &str)],
) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            resource_version: Some(resource_version.to_string()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![container("main", requests, limits)],
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn with_labels(mut pod: Pod, pairs: &[(&str, &str)]) -> Pod {
    pod.metadata.labels = Some(
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    );
    pod
}

pub fn dynamic(pod: &Pod) -> DynamicObject {
    let value = serde_json::to_value(pod).unwrap();
    serde_json::from_value(value).unwrap()
}

/// Watch event carrying `pod` as an untyped object
pub fn raw_event(event_type: WatchEventType, pod: &Pod) -> RawWatchEvent {
    RawWatchEvent {
        event_type,
        object: dynamic(pod),
    }
}

/// Full listing of `pods`, as sent when a watch starts or relists
pub fn restarted(pods: &[&Pod]) -> WatchUpdate {
    WatchUpdate::Restarted(pods.iter().map(|pod| dynamic(pod)).collect())
}

enum ScriptedWatch {
    Stream(WatchStream),
    Failure(String),
}

/// Cluster client whose watches are scripted by the test
///
/// Each call to `watch` pops the next queued outcome; an empty queue fails
/// the call.
#[derive(Default)]
pub struct FakeClusterClient {
    watches: Mutex<VecDeque<ScriptedWatch>>,
    watch_calls: AtomicUsize,
    usage_calls: AtomicUsize,
    fail_usage: AtomicBool,
}

impl FakeClusterClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a stream for the next watch; events are fed through the sender
    pub fn push_stream(&self) -> mpsc::Sender<Result<WatchUpdate>> {
        let (tx, rx) = mpsc::channel(64);
        self.watches
            .lock()
            .unwrap()
            .push_back(ScriptedWatch::Stream(Box::pin(ReceiverStream::new(rx))));
        tx
    }

    /// Queue an establishment failure for the next watch
    pub fn push_failure(&self, message: &str) {
        self.watches
            .lock()
            .unwrap()
            .push_back(ScriptedWatch::Failure(message.to_string()));
    }

    pub fn set_fail_usage(&self, fail: bool) {
        self.fail_usage.store(fail, Ordering::SeqCst);
    }

    pub fn watch_calls(&self) -> usize {
        self.watch_calls.load(Ordering::SeqCst)
    }

    pub fn usage_calls(&self) -> usize {
        self.usage_calls.load(Ordering::SeqCst)
    }

    fn check_usage(&self, pod: &Pod) -> Result<()> {
        self.usage_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_usage.load(Ordering::SeqCst) {
            return Err(PodStatError::Usage {
                pod: pod.metadata.name.clone().unwrap_or_default(),
                message: "scripted failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterClient for FakeClusterClient {
    async fn watch(&self, _kind: ResourceKind) -> Result<WatchStream> {
        self.watch_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.watches.lock().unwrap().pop_front();
        match next {
            Some(ScriptedWatch::Stream(stream)) => Ok(stream),
            Some(ScriptedWatch::Failure(message)) => Err(PodStatError::Stream(message)),
            None => Err(PodStatError::Stream("no watch scripted".to_string())),
        }
    }

    async fn resource_usage(&self, pod: &Pod) -> Result<ResourceUsage> {
        self.check_usage(pod)?;
        pod_resource_usage(pod)
    }

    async fn resource_usage_table(&self, pod: &Pod) -> Result<Vec<ResourceUsageRow>> {
        self.check_usage(pod)?;
        pod_resource_usage_table(pod, None)
    }
}
