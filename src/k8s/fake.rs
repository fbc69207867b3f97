//! In-memory cluster and node-ops fakes for unit tests.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, NodeSpec, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use super::cluster::ClusterClient;
use super::node_ops::NodeOps;
use super::workload::{Workload, WorkloadKind};
use crate::error::MigrationError;

type WorkloadKey = (WorkloadKind, String, String);

#[derive(Default)]
struct State {
    nodes: BTreeMap<String, Node>,
    pods: Vec<Pod>,
    namespaces: BTreeSet<String>,
    workloads: BTreeMap<WorkloadKey, Workload>,
    network_attachments: BTreeSet<(String, String)>,
    pending_conflicts: u32,
    /// Pods that survive deletion for this many more lookups.
    lingering: BTreeMap<String, u32>,
    /// Daemon-managed pods, replaced under a new UID when deleted.
    respawn: BTreeSet<String>,
    respawned: u32,
    mutations: Vec<String>,
}

/// Cluster state held in memory. Every write is recorded in `mutations`.
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<State>,
}

pub fn node(name: &str, labels: &[(&str, &str)]) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(
                labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        },
        spec: Some(NodeSpec::default()),
        status: None,
    }
}

pub fn pod(namespace: &str, name: &str, node: &str, labels: &[(&str, &str)]) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some(format!("uid-{}", name)),
            labels: Some(
                labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(node.to_string()),
            ..Default::default()
        }),
        status: None,
    }
}

fn selector_matches(pod: &Pod, selector: &str) -> bool {
    let labels = pod.metadata.labels.clone().unwrap_or_default();
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k).is_some_and(|actual| actual == v),
            None => labels.contains_key(term),
        })
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn add_node(&self, node: Node) {
        let name = node.metadata.name.clone().unwrap_or_default();
        self.lock().nodes.insert(name, node);
    }

    pub fn add_pod(&self, pod: Pod) {
        let mut state = self.lock();
        if let Some(ns) = &pod.metadata.namespace {
            state.namespaces.insert(ns.clone());
        }
        state.pods.push(pod);
    }

    /// Add a pod that its DaemonSet recreates after deletion.
    pub fn add_daemon_pod(&self, pod: Pod) {
        if let Some(name) = &pod.metadata.name {
            self.lock().respawn.insert(name.clone());
        }
        self.add_pod(pod);
    }

    pub fn add_workload(&self, workload: Workload) {
        let mut state = self.lock();
        state.namespaces.insert(workload.namespace.clone());
        state.workloads.insert(
            (
                workload.kind,
                workload.namespace.clone(),
                workload.name.clone(),
            ),
            workload,
        );
    }

    pub fn remove_workload(&self, kind: WorkloadKind, namespace: &str, name: &str) {
        self.lock()
            .workloads
            .remove(&(kind, namespace.to_string(), name.to_string()));
    }

    /// Replace every NetworkAttachmentDefinition with `count` in `default`.
    pub fn set_network_attachments(&self, count: usize) {
        self.lock().network_attachments = (0..count)
            .map(|i| ("default".to_string(), format!("net-{}", i)))
            .collect();
    }

    pub fn add_network_attachment(&self, namespace: &str, name: &str) {
        self.lock()
            .network_attachments
            .insert((namespace.to_string(), name.to_string()));
    }

    /// The next `count` node updates fail with a conflict.
    pub fn inject_conflicts(&self, count: u32) {
        self.lock().pending_conflicts = count;
    }

    /// Keep a deleted pod visible for `lookups` further UID lookups.
    pub fn linger_pod(&self, name: &str, lookups: u32) {
        self.lock().lingering.insert(name.to_string(), lookups);
    }

    pub fn set_unschedulable(&self, name: &str, unschedulable: bool) {
        if let Some(node) = self.lock().nodes.get_mut(name) {
            node.spec.get_or_insert_with(Default::default).unschedulable = Some(unschedulable);
        }
    }

    pub fn node_snapshot(&self, name: &str) -> Option<Node> {
        self.lock().nodes.get(name).cloned()
    }

    pub fn node_labels(&self, name: &str) -> BTreeMap<String, String> {
        self.node_snapshot(name)
            .and_then(|n| n.metadata.labels)
            .unwrap_or_default()
    }

    pub fn workload(&self, kind: WorkloadKind, namespace: &str, name: &str) -> Option<Workload> {
        self.lock()
            .workloads
            .get(&(kind, namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn pod_names(&self) -> Vec<String> {
        self.lock()
            .pods
            .iter()
            .filter_map(|p| p.metadata.name.clone())
            .collect()
    }

    pub fn network_attachments(&self) -> usize {
        self.lock().network_attachments.len()
    }

    pub fn mutations(&self) -> Vec<String> {
        self.lock().mutations.clone()
    }

    fn update_workload<F>(&self, kind: WorkloadKind, namespace: &str, name: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut Workload),
    {
        let mut state = self.lock();
        let key = (kind, namespace.to_string(), name.to_string());
        let Some(workload) = state.workloads.get_mut(&key) else {
            return Err(MigrationError::KubernetesApi(format!(
                "{} {}/{} not found",
                kind, namespace, name
            ))
            .into());
        };
        f(workload);
        // The controller converges instantly.
        workload.generation = Some(workload.generation.unwrap_or(0) + 1);
        workload.observed_generation = workload.generation;
        Ok(())
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn list_nodes(&self) -> Result<Vec<Node>> {
        Ok(self.lock().nodes.values().cloned().collect())
    }

    async fn get_node(&self, name: &str) -> Result<Node> {
        self.node_snapshot(name)
            .ok_or_else(|| MigrationError::NodeNotFound(name.to_string()).into())
    }

    async fn replace_node(&self, node: &Node) -> Result<()> {
        let mut state = self.lock();
        let name = node.metadata.name.clone().unwrap_or_default();
        if state.pending_conflicts > 0 {
            state.pending_conflicts -= 1;
            return Err(MigrationError::Conflict(format!("update node {}", name)).into());
        }
        state.mutations.push(format!("update node {}", name));
        state.nodes.insert(name, node.clone());
        Ok(())
    }

    async fn list_namespaces(&self) -> Result<Vec<String>> {
        Ok(self.lock().namespaces.iter().cloned().collect())
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>> {
        Ok(self
            .lock()
            .pods
            .iter()
            .filter(|p| p.metadata.namespace.as_deref() == Some(namespace))
            .filter(|p| selector_matches(p, label_selector))
            .cloned()
            .collect())
    }

    async fn list_pods_on_node(&self, node: &str) -> Result<Vec<Pod>> {
        Ok(self
            .lock()
            .pods
            .iter()
            .filter(|p| p.spec.as_ref().and_then(|s| s.node_name.as_deref()) == Some(node))
            .cloned()
            .collect())
    }

    async fn pod_uid(&self, namespace: &str, name: &str) -> Result<Option<String>> {
        let mut state = self.lock();
        if let Some(remaining) = state.lingering.get_mut(name) {
            if *remaining > 0 {
                *remaining -= 1;
                return Ok(Some(format!("uid-{}", name)));
            }
        }
        Ok(state
            .pods
            .iter()
            .find(|p| {
                p.metadata.namespace.as_deref() == Some(namespace)
                    && p.metadata.name.as_deref() == Some(name)
            })
            .and_then(|p| p.metadata.uid.clone()))
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.lock();
        let position = state.pods.iter().position(|p| {
            p.metadata.namespace.as_deref() == Some(namespace)
                && p.metadata.name.as_deref() == Some(name)
        });
        if let Some(position) = position {
            let mut pod = state.pods.remove(position);
            if state.respawn.contains(name) {
                state.respawned += 1;
                pod.metadata.uid = Some(format!("uid-{}-{}", name, state.respawned));
                state.pods.push(pod);
            }
        }
        state
            .mutations
            .push(format!("delete pod {}/{}", namespace, name));
        Ok(())
    }

    async fn get_workload(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Workload>> {
        Ok(self.workload(kind, namespace, name))
    }

    async fn list_workloads(&self, kind: WorkloadKind, namespace: &str) -> Result<Vec<Workload>> {
        Ok(self
            .lock()
            .workloads
            .values()
            .filter(|w| w.kind == kind && w.namespace == namespace)
            .cloned()
            .collect())
    }

    async fn set_template_annotation(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<()> {
        self.update_workload(kind, namespace, name, |w| {
            w.template_annotations
                .insert(key.to_string(), value.to_string());
        })?;
        self.lock().mutations.push(format!(
            "annotate {} {}/{} {}={}",
            kind, namespace, name, key, value
        ));
        Ok(())
    }

    async fn set_node_selector(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
        key: &str,
        value: Option<&str>,
    ) -> Result<()> {
        self.update_workload(kind, namespace, name, |w| match value {
            Some(v) => {
                w.node_selector.insert(key.to_string(), v.to_string());
            }
            None => {
                w.node_selector.remove(key);
            }
        })?;
        self.lock().mutations.push(format!(
            "node selector {} {}/{} {}={:?}",
            kind, namespace, name, key, value
        ));
        Ok(())
    }

    async fn delete_workload(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
    ) -> Result<bool> {
        let mut state = self.lock();
        let removed = state
            .workloads
            .remove(&(kind, namespace.to_string(), name.to_string()))
            .is_some();
        if removed {
            state
                .mutations
                .push(format!("delete {} {}/{}", kind, namespace, name));
        }
        Ok(removed)
    }

    async fn has_network_attachment(&self, namespace: &str, name: &str) -> Result<bool> {
        Ok(self
            .lock()
            .network_attachments
            .contains(&(namespace.to_string(), name.to_string())))
    }

    async fn delete_network_attachments(&self) -> Result<usize> {
        let mut state = self.lock();
        let count = std::mem::take(&mut state.network_attachments).len();
        if count > 0 {
            state
                .mutations
                .push(format!("delete {} network attachments", count));
        }
        Ok(count)
    }
}

/// Records node operations and mirrors their effect on a `FakeCluster`.
pub struct FakeNodeOps {
    cluster: Arc<FakeCluster>,
    calls: Mutex<Vec<String>>,
    execs: Mutex<u32>,
    manifests: Mutex<BTreeMap<PathBuf, Vec<Workload>>>,
    attachments: Mutex<BTreeMap<PathBuf, String>>,
    unhealthy: Mutex<BTreeSet<String>>,
}

impl FakeNodeOps {
    pub fn new(cluster: Arc<FakeCluster>) -> Arc<Self> {
        Arc::new(Self {
            cluster,
            calls: Mutex::new(Vec::new()),
            execs: Mutex::new(0),
            manifests: Mutex::new(BTreeMap::new()),
            attachments: Mutex::new(BTreeMap::new()),
            unhealthy: Mutex::new(BTreeSet::new()),
        })
    }

    /// Applying `path` creates these workloads; deleting it removes them.
    pub fn with_manifest(&self, path: &str, workloads: Vec<Workload>) {
        self.manifests
            .lock()
            .unwrap()
            .insert(PathBuf::from(path), workloads);
    }

    /// Applying `path` to a namespace creates the named
    /// NetworkAttachmentDefinition there.
    pub fn with_attachment_manifest(&self, path: &str, name: &str) {
        self.attachments
            .lock()
            .unwrap()
            .insert(PathBuf::from(path), name.to_string());
    }

    pub fn set_unhealthy(&self, pod: &str) {
        self.unhealthy.lock().unwrap().insert(pod.to_string());
    }

    /// Mutating calls in order, e.g. `drain worker-1`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn exec_count(&self) -> u32 {
        *self.execs.lock().unwrap()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl NodeOps for FakeNodeOps {
    async fn drain(&self, node: &str, delete_local_data: bool) -> Result<()> {
        self.cluster
            .node_snapshot(node)
            .ok_or_else(|| MigrationError::NodeNotFound(node.to_string()))?;
        self.cluster.set_unschedulable(node, true);
        if delete_local_data {
            self.record(format!("drain {} --delete-emptydir-data", node));
        } else {
            self.record(format!("drain {}", node));
        }
        Ok(())
    }

    async fn uncordon(&self, node: &str) -> Result<()> {
        self.cluster.set_unschedulable(node, false);
        self.record(format!("uncordon {}", node));
        Ok(())
    }

    async fn apply_manifest(&self, path: &Path) -> Result<()> {
        let workloads = self
            .manifests
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .unwrap_or_default();
        for workload in workloads {
            self.cluster.add_workload(workload);
        }
        self.record(format!("apply {}", path.display()));
        Ok(())
    }

    async fn apply_manifest_in(&self, path: &Path, namespace: &str) -> Result<()> {
        let name = self.attachments.lock().unwrap().get(path).cloned();
        if let Some(name) = name {
            self.cluster.add_network_attachment(namespace, &name);
        }
        self.record(format!("apply {} -n {}", path.display(), namespace));
        Ok(())
    }

    async fn delete_manifest(&self, path: &Path) -> Result<()> {
        let workloads = self
            .manifests
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .unwrap_or_default();
        for w in workloads {
            self.cluster.remove_workload(w.kind, &w.namespace, &w.name);
        }
        self.record(format!("delete {}", path.display()));
        Ok(())
    }

    async fn exec(&self, namespace: &str, pod: &str, command: &[String]) -> Result<()> {
        *self.execs.lock().unwrap() += 1;
        if self.unhealthy.lock().unwrap().contains(pod) {
            return Err(MigrationError::Command {
                command: format!("kubectl exec -n {} {} -- {}", namespace, pod, command.join(" ")),
                stderr: "connectivity check failed".to_string(),
            }
            .into());
        }
        Ok(())
    }
}
