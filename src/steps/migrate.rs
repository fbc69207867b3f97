//! Step 4: move nodes to the new plugin only, one at a time.
//!
//! A failure leaves the node cordoned and tainted. Re-running resumes the
//! node from the start of its sequence; every action is idempotent.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info};

use super::{NodeTarget, Step, StepContext, node_name};
use crate::k8s::workload::WorkloadKind;
use crate::node::{add_taint, labels_mut, labels_of};
use crate::phase::MigrationPhase;

/// Pod-template annotation that triggers a rolling restart.
const RESTARTED_AT: &str = "kubectl.kubernetes.io/restartedAt";

pub struct Migrate {
    ctx: Arc<StepContext>,
    target: NodeTarget,
}

impl Migrate {
    pub fn new(ctx: Arc<StepContext>, target: NodeTarget) -> Self {
        Self { ctx, target }
    }

    /// Restart the probe agent so it re-evaluates networking, then wait for
    /// it and the new plugin to roll out.
    async fn restart_probe_agent(&self) -> Result<()> {
        let ctx = &self.ctx;
        let agent = &ctx.config.workloads.probe;
        let now = chrono::Utc::now().to_rfc3339();

        info!("Restarting {}", agent);
        ctx.cluster
            .set_template_annotation(
                WorkloadKind::DaemonSet,
                &agent.namespace,
                &agent.name,
                RESTARTED_AT,
                &now,
            )
            .await?;
        ctx.waiter
            .wait_ready(WorkloadKind::DaemonSet, &agent.namespace, &agent.name)
            .await?;

        let new_plugin = &ctx.config.workloads.new_plugin;
        ctx.waiter
            .wait_ready(WorkloadKind::DaemonSet, &new_plugin.namespace, &new_plugin.name)
            .await
    }

    async fn migrate_node(&self, name: &str) -> Result<()> {
        let ctx = &self.ctx;
        let labels = &ctx.config.labels;

        ctx.probe.check().await?;
        ctx.nodes.drain(name, true).await?;

        info!(
            node = name,
            "Tainting {}={}:NoExecute and switching to new plugin only",
            labels.new_plugin,
            labels.value
        );
        ctx.nodes
            .update_node(name, |node| {
                let tainted = add_taint(node, &labels.new_plugin, &labels.value);
                let relabelled = labels.apply_new_plugin(labels_mut(node));
                tainted || relabelled
            })
            .await?;

        self.restart_probe_agent().await?;
        ctx.nodes.delete_remaining_pods(name).await?;
        ctx.wait_watched().await?;
        ctx.probe.check().await?;

        info!(node = name, "Removing taint {}", labels.new_plugin);
        ctx.nodes.remove_taint(name, &labels.new_plugin).await?;
        ctx.nodes.uncordon(name).await?;
        ctx.wait_watched().await?;

        info!(node = name, "Setting label {}={}", labels.migrated, labels.value);
        ctx.nodes
            .update_labels(name, |l| labels.apply_migrated(l))
            .await?;

        ctx.probe.check().await?;
        info!(node = name, "Node migrated");
        Ok(())
    }
}

#[async_trait]
impl Step for Migrate {
    fn phase(&self) -> MigrationPhase {
        MigrationPhase::Migrate
    }

    async fn ready(&self) -> Result<bool> {
        let labels = &self.ctx.config.labels;
        let nodes = self.ctx.target_nodes(&self.target).await?;
        Ok(nodes.iter().all(|n| labels.is_migrated(&labels_of(n))))
    }

    async fn run(&self, dry_run: bool) -> Result<()> {
        let labels = &self.ctx.config.labels;

        for node in self.ctx.target_nodes(&self.target).await? {
            let name = node_name(&node);
            if labels.is_migrated(&labels_of(&node)) {
                debug!(node = name, "Node already migrated");
                continue;
            }

            if dry_run {
                info!(
                    node = name,
                    "Would drain, taint {}, evict, uncordon and label {}",
                    labels.new_plugin,
                    labels.migrated
                );
                continue;
            }

            info!(node = name, "Migrating node");
            self.migrate_node(name).await?;
        }

        Ok(())
    }
}
