//! Migration steps and the context they share.
//!
//! Each step exposes a side-effect-free `ready` predicate over live cluster
//! state and an idempotent `run` that performs only the missing deltas.

mod cleanup;
mod migrate;
mod preflight;
mod prepare;
mod priority;
mod roll;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::annotate::WorkloadAnnotator;
use crate::config::MigrationConfig;
use crate::connectivity::ConnectivityProbe;
use crate::k8s::cluster::ClusterClient;
use crate::k8s::node_ops::NodeOps;
use crate::node::NodeController;
use crate::phase::MigrationPhase;
use crate::resources::ResourceInventory;
use crate::wait::ReadinessWaiter;

pub use cleanup::Cleanup;
pub use migrate::Migrate;
pub use preflight::Preflight;
pub use prepare::Prepare;
pub use priority::PriorityFlip;
pub use roll::Roll;

#[async_trait]
pub trait Step: Send + Sync {
    fn phase(&self) -> MigrationPhase;

    /// True iff this step's exit condition holds for the whole cluster.
    async fn ready(&self) -> Result<bool>;

    /// Reach the exit condition. With `dry_run` only intended actions are
    /// logged.
    async fn run(&self, dry_run: bool) -> Result<()>;
}

/// Nodes the migrate step operates on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeTarget {
    All,
    Named(Vec<String>),
}

/// Collaborators shared by every step.
pub struct StepContext {
    pub config: MigrationConfig,
    pub cluster: Arc<dyn ClusterClient>,
    pub ops: Arc<dyn NodeOps>,
    pub waiter: ReadinessWaiter,
    pub probe: ConnectivityProbe,
    pub nodes: NodeController,
    pub inventory: ResourceInventory,
    pub annotator: Option<WorkloadAnnotator>,
    pub cancel: CancellationToken,
}

impl StepContext {
    pub fn new(
        config: MigrationConfig,
        cluster: Arc<dyn ClusterClient>,
        ops: Arc<dyn NodeOps>,
        cancel: CancellationToken,
    ) -> Self {
        let timeouts = config.timeouts;
        let waiter = || ReadinessWaiter::new(cluster.clone(), timeouts.readiness, cancel.clone());

        let probe = ConnectivityProbe::new(
            cluster.clone(),
            ops.clone(),
            config.workloads.probe.clone(),
            config.probe.clone(),
            timeouts.connectivity,
            waiter(),
            cancel.clone(),
        );
        let nodes = NodeController::new(
            cluster.clone(),
            ops.clone(),
            timeouts.pod_deletion,
            cancel.clone(),
        );
        let annotator = config
            .network_attachment
            .clone()
            .zip(config.paths.network_attachment.clone())
            .map(|(na, manifest)| {
                WorkloadAnnotator::new(cluster.clone(), ops.clone(), waiter(), na, manifest)
            });

        Self {
            waiter: waiter(),
            inventory: ResourceInventory::new(cluster.clone()),
            probe,
            nodes,
            annotator,
            config,
            cluster,
            ops,
            cancel,
        }
    }

    /// All nodes, ordered by name.
    pub async fn list_nodes(&self) -> Result<Vec<Node>> {
        let mut nodes = self.cluster.list_nodes().await?;
        nodes.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        Ok(nodes)
    }

    /// Resolve a node target against the live cluster. Named nodes must exist.
    pub async fn target_nodes(&self, target: &NodeTarget) -> Result<Vec<Node>> {
        match target {
            NodeTarget::All => self.list_nodes().await,
            NodeTarget::Named(names) => {
                let mut nodes = Vec::with_capacity(names.len());
                for name in names {
                    nodes.push(self.cluster.get_node(name).await?);
                }
                Ok(nodes)
            }
        }
    }

    /// Wait for every watched workload to converge.
    pub async fn wait_watched(&self) -> Result<()> {
        self.waiter.wait_all(&self.config.watched_resources).await
    }

    /// Drain, wait, force out the remaining pods, uncordon, wait and
    /// re-probe. Callers probe before calling and record progress after.
    pub async fn roll_node(&self, name: &str) -> Result<()> {
        self.nodes.drain(name, true).await?;
        self.wait_watched().await?;
        self.nodes.delete_remaining_pods(name).await?;
        self.nodes.uncordon(name).await?;
        self.wait_watched().await?;
        self.probe.check().await?;
        info!(node = name, "Node rolled");
        Ok(())
    }
}

pub fn node_name(node: &Node) -> &str {
    node.metadata.name.as_deref().unwrap_or_default()
}

/// Every step in execution order.
pub fn registry(ctx: Arc<StepContext>, target: NodeTarget) -> Vec<Box<dyn Step>> {
    vec![
        Box::new(Preflight::new(ctx.clone())),
        Box::new(Prepare::new(ctx.clone())),
        Box::new(Roll::new(ctx.clone())),
        Box::new(PriorityFlip::new(ctx.clone())),
        Box::new(Migrate::new(ctx.clone(), target)),
        Box::new(Cleanup::new(ctx)),
    ]
}
