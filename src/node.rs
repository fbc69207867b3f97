//! Single-node lifecycle: drain, forced pod deletion, uncordon, taints and
//! label updates.
//!
//! Every node write is a read-modify-write against the latest object. A
//! write that would change nothing is skipped, and a 409 from the API server
//! restarts the cycle from a fresh read.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use k8s_openapi::api::core::v1::{Node, Taint};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PollSettings;
use crate::error::MigrationError;
use crate::k8s::cluster::ClusterClient;
use crate::k8s::node_ops::NodeOps;
use crate::wait::sleep_or_cancel;

/// Attempts per node update before a conflict is returned to the caller.
const MAX_CONFLICT_RETRIES: u32 = 5;

const NO_EXECUTE: &str = "NoExecute";

pub fn labels_of(node: &Node) -> BTreeMap<String, String> {
    node.metadata.labels.clone().unwrap_or_default()
}

pub fn labels_mut(node: &mut Node) -> &mut BTreeMap<String, String> {
    node.metadata.labels.get_or_insert_with(BTreeMap::new)
}

pub fn is_cordoned(node: &Node) -> bool {
    node.spec
        .as_ref()
        .and_then(|s| s.unschedulable)
        .unwrap_or(false)
}

pub fn has_taint(node: &Node, key: &str) -> bool {
    node.spec
        .as_ref()
        .and_then(|s| s.taints.as_ref())
        .is_some_and(|taints| taints.iter().any(|t| t.key == key))
}

/// Add a NoExecute taint unless one with the same key exists.
pub fn add_taint(node: &mut Node, key: &str, value: &str) -> bool {
    if has_taint(node, key) {
        return false;
    }
    let spec = node.spec.get_or_insert_with(Default::default);
    spec.taints.get_or_insert_with(Vec::new).push(Taint {
        key: key.to_string(),
        value: Some(value.to_string()),
        effect: NO_EXECUTE.to_string(),
        time_added: None,
    });
    true
}

pub fn remove_taint(node: &mut Node, key: &str) -> bool {
    let Some(taints) = node.spec.as_mut().and_then(|s| s.taints.as_mut()) else {
        return false;
    };
    let before = taints.len();
    taints.retain(|t| t.key != key);
    taints.len() != before
}

/// Drives one node through cordon, drain, pod deletion and uncordon.
pub struct NodeController {
    cluster: Arc<dyn ClusterClient>,
    ops: Arc<dyn NodeOps>,
    pod_deletion: PollSettings,
    cancel: CancellationToken,
}

impl NodeController {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        ops: Arc<dyn NodeOps>,
        pod_deletion: PollSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            cluster,
            ops,
            pod_deletion,
            cancel,
        }
    }

    /// Read the node, apply `mutate`, and write it back if anything changed.
    /// Returns whether a write happened.
    pub async fn update_node<F>(&self, name: &str, mut mutate: F) -> Result<bool>
    where
        F: FnMut(&mut Node) -> bool + Send,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut node = self.cluster.get_node(name).await?;
            if !mutate(&mut node) {
                debug!(node = name, "Node already up to date");
                return Ok(false);
            }

            match self.cluster.replace_node(&node).await {
                Ok(()) => return Ok(true),
                Err(e) if MigrationError::is_conflict(&e) && attempt < MAX_CONFLICT_RETRIES => {
                    warn!(
                        node = name,
                        attempt = attempt,
                        max_retries = MAX_CONFLICT_RETRIES,
                        "Node changed while updating, retrying"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Update only the node's labels.
    pub async fn update_labels<F>(&self, name: &str, mut mutate: F) -> Result<bool>
    where
        F: FnMut(&mut BTreeMap<String, String>) -> bool + Send,
    {
        self.update_node(name, |node| mutate(labels_mut(node))).await
    }

    pub async fn remove_taint(&self, name: &str, key: &str) -> Result<bool> {
        self.update_node(name, |node| remove_taint(node, key)).await
    }

    /// Cordon and evict. Daemon-managed pods stay unless the node is being
    /// emptied of local-storage pods too.
    pub async fn drain(&self, name: &str, delete_local_data: bool) -> Result<()> {
        info!(node = name, delete_local_data, "Draining node");
        self.ops.drain(name, delete_local_data).await
    }

    pub async fn uncordon(&self, name: &str) -> Result<()> {
        info!(node = name, "Uncordoning node");
        self.ops.uncordon(name).await
    }

    /// Delete every non-host-network pod still scheduled to the node and
    /// block until each deleted pod object is gone. A pod recreated under the
    /// same name counts as gone once its UID differs.
    pub async fn delete_remaining_pods(&self, name: &str) -> Result<usize> {
        let pods = self.cluster.list_pods_on_node(name).await?;
        let mut pending = Vec::new();

        for pod in &pods {
            let host_network = pod
                .spec
                .as_ref()
                .and_then(|s| s.host_network)
                .unwrap_or(false);
            if host_network {
                continue;
            }
            let (Some(namespace), Some(pod_name)) =
                (pod.metadata.namespace.clone(), pod.metadata.name.clone())
            else {
                continue;
            };

            info!(node = name, pod = %format!("{}/{}", namespace, pod_name), "Deleting pod");
            self.cluster.delete_pod(&namespace, &pod_name).await?;
            pending.push((namespace, pod_name, pod.metadata.uid.clone()));
        }

        let deleted = pending.len();
        let deadline = Instant::now() + self.pod_deletion.timeout();

        loop {
            let mut still_present = Vec::new();
            for (namespace, pod_name, uid) in pending {
                let current = self.cluster.pod_uid(&namespace, &pod_name).await?;
                if current.is_some() && current == uid {
                    still_present.push((namespace, pod_name, uid));
                }
            }
            pending = still_present;

            if pending.is_empty() {
                debug!(node = name, deleted, "All deleted pods are gone");
                return Ok(deleted);
            }

            if Instant::now() + self.pod_deletion.interval() > deadline {
                let names: Vec<String> = pending
                    .iter()
                    .map(|(ns, pod, _)| format!("{}/{}", ns, pod))
                    .collect();
                return Err(MigrationError::Timeout {
                    operation: format!("pod deletion on node {}", name),
                    details: format!("still present: {}", names.join(", ")),
                }
                .into());
            }

            sleep_or_cancel(self.pod_deletion.interval(), &self.cancel).await?;
        }
    }
}
