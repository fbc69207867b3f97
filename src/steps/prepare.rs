//! Step 1: label every node dual, pin the old plugin to dual nodes, and
//! install the new plugin alongside it.
//!
//! Once every node is migrated the dual setup is no longer needed and
//! clean-up may have removed it, so the step counts as complete.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info};

use super::{Step, StepContext, node_name};
use crate::error::MigrationError;
use crate::k8s::workload::WorkloadKind;
use crate::node::labels_of;
use crate::phase::MigrationPhase;

pub struct Prepare {
    ctx: Arc<StepContext>,
}

impl Prepare {
    pub fn new(ctx: Arc<StepContext>) -> Self {
        Self { ctx }
    }

    /// Every node carries the final migrated label.
    async fn all_migrated(&self) -> Result<bool> {
        let labels = &self.ctx.config.labels;
        let nodes = self.ctx.list_nodes().await?;
        Ok(!nodes.is_empty() && nodes.iter().all(|n| labels.is_migrated(&labels_of(n))))
    }

    /// The old plugin schedules only onto dual-labelled nodes.
    async fn old_plugin_pinned(&self) -> Result<bool> {
        let labels = &self.ctx.config.labels;
        let old = &self.ctx.config.workloads.old_plugin;
        let workload = self
            .ctx
            .cluster
            .get_workload(WorkloadKind::DaemonSet, &old.namespace, &old.name)
            .await?;
        Ok(workload.is_some_and(|w| w.node_selector.get(&labels.dual) == Some(&labels.value)))
    }

    async fn label_nodes(&self, dry_run: bool) -> Result<()> {
        let labels = &self.ctx.config.labels;
        for node in self.ctx.list_nodes().await? {
            let name = node_name(&node);
            if labels.is_prepared(&labels_of(&node)) {
                debug!(node = name, "Node already labelled");
                continue;
            }

            if dry_run {
                info!(node = name, "Would set label {}={}", labels.dual, labels.value);
                continue;
            }

            info!(node = name, "Setting label {}={}", labels.dual, labels.value);
            self.ctx
                .nodes
                .update_labels(name, |l| labels.apply_dual(l))
                .await?;
        }
        Ok(())
    }

    async fn pin_old_plugin(&self, dry_run: bool) -> Result<()> {
        if self.old_plugin_pinned().await? {
            debug!("Old plugin node selector already set");
            return Ok(());
        }

        let labels = &self.ctx.config.labels;
        let old = &self.ctx.config.workloads.old_plugin;
        if self
            .ctx
            .cluster
            .get_workload(WorkloadKind::DaemonSet, &old.namespace, &old.name)
            .await?
            .is_none()
        {
            return Err(MigrationError::KubernetesApi(format!(
                "old plugin DaemonSet {} not found",
                old
            ))
            .into());
        }

        if dry_run {
            info!("Would patch {} node selector {}={}", old, labels.dual, labels.value);
            return Ok(());
        }

        info!("Patching {} node selector {}={}", old, labels.dual, labels.value);
        self.ctx
            .cluster
            .set_node_selector(
                WorkloadKind::DaemonSet,
                &old.namespace,
                &old.name,
                &labels.dual,
                Some(&labels.value),
            )
            .await
    }

    async fn install_new_plugin(&self, dry_run: bool) -> Result<()> {
        let ctx = &self.ctx;
        if ctx.inventory.has_all(&ctx.config.prepare_resources).await? {
            debug!("Prepare resources already installed");
            return Ok(());
        }

        for manifest in [&ctx.config.paths.new_plugin, &ctx.config.paths.overlay] {
            if dry_run {
                info!("Would apply {}", manifest.display());
            } else {
                info!("Applying {}", manifest.display());
                ctx.ops.apply_manifest(manifest).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Step for Prepare {
    fn phase(&self) -> MigrationPhase {
        MigrationPhase::Prepare
    }

    async fn ready(&self) -> Result<bool> {
        if self.all_migrated().await? {
            return Ok(true);
        }

        let ctx = &self.ctx;
        let labels = &ctx.config.labels;

        for node in ctx.list_nodes().await? {
            if !labels.is_prepared(&labels_of(&node)) {
                debug!(node = node_name(&node), "Node not labelled");
                return Ok(false);
            }
        }

        if !self.old_plugin_pinned().await? {
            return Ok(false);
        }

        if !ctx.inventory.has_all(&ctx.config.prepare_resources).await? {
            return Ok(false);
        }

        if let Some(annotator) = &ctx.annotator {
            if !annotator.missing_attachments().await?.is_empty()
                || !annotator.pending().await?.is_empty()
            {
                return Ok(false);
            }
        }

        Ok(true)
    }

    async fn run(&self, dry_run: bool) -> Result<()> {
        if self.all_migrated().await? {
            info!("All nodes migrated, nothing to prepare");
            return Ok(());
        }

        self.label_nodes(dry_run).await?;
        self.pin_old_plugin(dry_run).await?;
        self.install_new_plugin(dry_run).await?;

        let ctx = &self.ctx;
        if dry_run {
            if let Some(annotator) = &ctx.annotator {
                annotator.ensure_attachments(true).await?;
                annotator.annotate_all(true).await?;
            }
            info!("Would wait for workloads and check connectivity");
            return Ok(());
        }

        ctx.waiter.wait_all(&ctx.config.prepare_resources).await?;
        ctx.wait_watched().await?;
        if let Some(annotator) = &ctx.annotator {
            annotator.ensure_attachments(false).await?;
            annotator.annotate_all(false).await?;
        }
        ctx.probe.check().await
    }
}
