//! Step 5: remove the old plugin, the overlay network and the temporary
//! node selector on the new plugin.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::time::Instant;
use tracing::info;

use super::{Step, StepContext};
use crate::error::MigrationError;
use crate::k8s::workload::WorkloadKind;
use crate::phase::MigrationPhase;
use crate::wait::sleep_or_cancel;

pub struct Cleanup {
    ctx: Arc<StepContext>,
}

impl Cleanup {
    pub fn new(ctx: Arc<StepContext>) -> Self {
        Self { ctx }
    }

    /// The new plugin still carries the migrated-only node selector.
    async fn selector_pinned(&self) -> Result<bool> {
        let ctx = &self.ctx;
        let new_plugin = &ctx.config.workloads.new_plugin;
        let workload = ctx
            .cluster
            .get_workload(WorkloadKind::DaemonSet, &new_plugin.namespace, &new_plugin.name)
            .await?;
        Ok(workload.is_some_and(|w| w.node_selector.contains_key(&ctx.config.labels.migrated)))
    }

    async fn wait_removed(&self) -> Result<()> {
        let ctx = &self.ctx;
        let poll = ctx.config.timeouts.readiness;
        let deadline = Instant::now() + poll.timeout();

        while ctx.inventory.has_any(&ctx.config.clean_up_resources).await? {
            if Instant::now() + poll.interval() > deadline {
                return Err(MigrationError::Timeout {
                    operation: "clean-up resources to be removed".to_string(),
                    details: format!("{} workloads configured", ctx.config.clean_up_resources.len()),
                }
                .into());
            }
            sleep_or_cancel(poll.interval(), &ctx.cancel).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Step for Cleanup {
    fn phase(&self) -> MigrationPhase {
        MigrationPhase::Cleanup
    }

    async fn ready(&self) -> Result<bool> {
        let ctx = &self.ctx;
        if ctx.inventory.has_any(&ctx.config.clean_up_resources).await? {
            return Ok(false);
        }
        Ok(!self.selector_pinned().await?)
    }

    async fn run(&self, dry_run: bool) -> Result<()> {
        if self.ready().await? {
            info!("Clean-up already complete");
            return Ok(());
        }

        let ctx = &self.ctx;
        let config = &ctx.config;
        let old = &config.workloads.old_plugin;
        let new_plugin = &config.workloads.new_plugin;

        if dry_run {
            info!("Would delete all NetworkAttachmentDefinitions");
            info!("Would delete {}", config.paths.overlay.display());
            info!("Would delete DaemonSet {}", old);
            for (kind, namespace, name) in config.clean_up_resources.iter() {
                info!("Would delete {} {}/{}", kind, namespace, name);
            }
            info!("Would remove node selector {} from {}", config.labels.migrated, new_plugin);
            return Ok(());
        }

        let deleted = ctx.cluster.delete_network_attachments().await?;
        info!("Deleted {} NetworkAttachmentDefinitions", deleted);

        info!("Deleting {}", config.paths.overlay.display());
        ctx.ops.delete_manifest(&config.paths.overlay).await?;

        if ctx
            .cluster
            .delete_workload(WorkloadKind::DaemonSet, &old.namespace, &old.name)
            .await?
        {
            info!("Deleted DaemonSet {}", old);
        }
        ctx.inventory.delete_all(&config.clean_up_resources).await?;
        self.wait_removed().await?;

        if self.selector_pinned().await? {
            info!("Removing node selector {} from {}", config.labels.migrated, new_plugin);
            ctx.cluster
                .set_node_selector(
                    WorkloadKind::DaemonSet,
                    &new_plugin.namespace,
                    &new_plugin.name,
                    &config.labels.migrated,
                    None,
                )
                .await?;
        }

        ctx.waiter
            .wait_ready(WorkloadKind::DaemonSet, &new_plugin.namespace, &new_plugin.name)
            .await
    }
}
