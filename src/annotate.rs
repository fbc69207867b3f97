//! Network-attachment annotation of every pod-network workload.
//!
//! The annotation value names a NetworkAttachmentDefinition, which is
//! applied to each namespace before any workload there is annotated.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info};

use crate::config::NetworkAttachment;
use crate::k8s::cluster::ClusterClient;
use crate::k8s::node_ops::NodeOps;
use crate::k8s::workload::{Workload, WorkloadKind};
use crate::wait::ReadinessWaiter;

pub struct WorkloadAnnotator {
    cluster: Arc<dyn ClusterClient>,
    ops: Arc<dyn NodeOps>,
    waiter: ReadinessWaiter,
    attachment: NetworkAttachment,
    manifest: PathBuf,
}

impl WorkloadAnnotator {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        ops: Arc<dyn NodeOps>,
        waiter: ReadinessWaiter,
        attachment: NetworkAttachment,
        manifest: PathBuf,
    ) -> Self {
        Self {
            cluster,
            ops,
            waiter,
            attachment,
            manifest,
        }
    }

    /// Namespaces without the NetworkAttachmentDefinition.
    pub async fn missing_attachments(&self) -> Result<Vec<String>> {
        let mut missing = Vec::new();
        for namespace in self.cluster.list_namespaces().await? {
            if !self
                .cluster
                .has_network_attachment(&namespace, &self.attachment.value)
                .await?
            {
                missing.push(namespace);
            }
        }
        Ok(missing)
    }

    /// Apply the attachment manifest to every namespace that lacks it.
    pub async fn ensure_attachments(&self, dry_run: bool) -> Result<usize> {
        let missing = self.missing_attachments().await?;
        for namespace in &missing {
            if dry_run {
                info!(
                    namespace = namespace.as_str(),
                    "Would apply {}",
                    self.manifest.display()
                );
                continue;
            }
            info!(namespace = namespace.as_str(), "Applying {}", self.manifest.display());
            self.ops.apply_manifest_in(&self.manifest, namespace).await?;
        }
        Ok(missing.len())
    }

    /// Workloads in every namespace whose pod template lacks the expected
    /// annotation. Host-network workloads are never attached.
    pub async fn pending(&self) -> Result<Vec<Workload>> {
        let mut pending = Vec::new();
        for namespace in self.cluster.list_namespaces().await? {
            for kind in WorkloadKind::ALL {
                for workload in self.cluster.list_workloads(kind, &namespace).await? {
                    if workload.host_network {
                        debug!("Skipping host-network {} {}/{}", kind, namespace, workload.name);
                        continue;
                    }
                    if workload.annotation(&self.attachment.key) != Some(self.attachment.value.as_str()) {
                        pending.push(workload);
                    }
                }
            }
        }
        Ok(pending)
    }

    /// Patch the annotation onto every pending workload and wait for each
    /// rollout. Returns the number of workloads patched (or that would be).
    pub async fn annotate_all(&self, dry_run: bool) -> Result<usize> {
        let pending = self.pending().await?;
        if pending.is_empty() {
            debug!("All workloads carry {}={}", self.attachment.key, self.attachment.value);
            return Ok(0);
        }

        for w in &pending {
            if dry_run {
                info!(
                    "Would annotate {} {}/{} with {}={}",
                    w.kind, w.namespace, w.name, self.attachment.key, self.attachment.value
                );
                continue;
            }

            info!("Annotating {} {}/{}", w.kind, w.namespace, w.name);
            self.cluster
                .set_template_annotation(
                    w.kind,
                    &w.namespace,
                    &w.name,
                    &self.attachment.key,
                    &self.attachment.value,
                )
                .await?;
            self.waiter.wait_ready(w.kind, &w.namespace, &w.name).await?;
        }

        Ok(pending.len())
    }
}
