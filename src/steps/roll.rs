//! Step 2: cycle every node once so it picks up the new plugin's agent.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info};

use super::{Step, StepContext, node_name};
use crate::node::labels_of;
use crate::phase::MigrationPhase;

pub struct Roll {
    ctx: Arc<StepContext>,
}

impl Roll {
    pub fn new(ctx: Arc<StepContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Step for Roll {
    fn phase(&self) -> MigrationPhase {
        MigrationPhase::Roll
    }

    async fn ready(&self) -> Result<bool> {
        let labels = &self.ctx.config.labels;
        let nodes = self.ctx.list_nodes().await?;
        Ok(nodes.iter().all(|n| labels.is_rolled(&labels_of(n))))
    }

    async fn run(&self, dry_run: bool) -> Result<()> {
        let ctx = &self.ctx;
        let labels = &ctx.config.labels;

        for node in ctx.list_nodes().await? {
            let name = node_name(&node);
            if labels.is_rolled(&labels_of(&node)) {
                debug!(node = name, "Node already rolled");
                continue;
            }

            if dry_run {
                info!(node = name, "Would drain, evict, uncordon and label {}", labels.rolled);
                continue;
            }

            info!(node = name, "Rolling node");
            ctx.probe.check().await?;
            ctx.roll_node(name).await?;
            ctx.nodes
                .update_labels(name, |l| labels.apply_rolled(l))
                .await?;
        }

        Ok(())
    }
}
