//! Step 3: hand CNI priority to the new plugin, node by node.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info};

use super::{Step, StepContext, node_name};
use crate::node::labels_of;
use crate::phase::MigrationPhase;

pub struct PriorityFlip {
    ctx: Arc<StepContext>,
}

impl PriorityFlip {
    pub fn new(ctx: Arc<StepContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Step for PriorityFlip {
    fn phase(&self) -> MigrationPhase {
        MigrationPhase::PriorityFlip
    }

    async fn ready(&self) -> Result<bool> {
        let labels = &self.ctx.config.labels;
        let nodes = self.ctx.list_nodes().await?;
        Ok(nodes.iter().all(|n| labels.is_priority_flipped(&labels_of(n))))
    }

    async fn run(&self, dry_run: bool) -> Result<()> {
        let ctx = &self.ctx;
        let labels = &ctx.config.labels;

        for node in ctx.list_nodes().await? {
            let name = node_name(&node);
            if labels.is_priority_flipped(&labels_of(&node)) {
                debug!(node = name, "Node already has new plugin priority");
                continue;
            }

            if dry_run {
                info!(
                    node = name,
                    "Would replace label {} with {} and roll the node",
                    labels.priority_old,
                    labels.priority_new
                );
                continue;
            }

            info!(node = name, "Changing CNI priority");
            ctx.probe.check().await?;
            ctx.nodes
                .update_labels(name, |l| labels.apply_priority_new(l))
                .await?;
            ctx.roll_node(name).await?;
        }

        Ok(())
    }
}
