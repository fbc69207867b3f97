//! Rollout readiness polling.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::PollSettings;
use crate::error::MigrationError;
use crate::k8s::cluster::ClusterClient;
use crate::k8s::workload::WorkloadKind;
use crate::resources::ResourceSet;

/// Sleep for `duration`, failing with `Cancelled` if the token fires first.
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = tokio::time::sleep(duration) => Ok(()),
        _ = cancel.cancelled() => Err(MigrationError::Cancelled.into()),
    }
}

/// Polls workloads until ready replicas match desired replicas.
pub struct ReadinessWaiter {
    cluster: Arc<dyn ClusterClient>,
    poll: PollSettings,
    cancel: CancellationToken,
}

impl ReadinessWaiter {
    pub fn new(cluster: Arc<dyn ClusterClient>, poll: PollSettings, cancel: CancellationToken) -> Self {
        Self {
            cluster,
            poll,
            cancel,
        }
    }

    /// Wait for one workload. A workload that does not exist yet is polled
    /// like one with no ready replicas.
    pub async fn wait_ready(&self, kind: WorkloadKind, namespace: &str, name: &str) -> Result<()> {
        let deadline = Instant::now() + self.poll.timeout();
        let mut last = (0, 0);

        loop {
            match self.cluster.get_workload(kind, namespace, name).await? {
                Some(workload) if workload.is_ready() => {
                    debug!(
                        "{} {}/{} ready: {}/{}",
                        kind, namespace, name, workload.ready, workload.desired
                    );
                    return Ok(());
                }
                Some(workload) => {
                    last = (workload.ready, workload.desired);
                    debug!(
                        "{} {}/{} not ready: {}/{}",
                        kind, namespace, name, workload.ready, workload.desired
                    );
                }
                None => debug!("{} {}/{} not found yet", kind, namespace, name),
            }

            if Instant::now() + self.poll.interval() > deadline {
                return Err(MigrationError::ReadinessTimeout {
                    kind: kind.to_string(),
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                    ready: last.0,
                    desired: last.1,
                }
                .into());
            }

            sleep_or_cancel(self.poll.interval(), &self.cancel).await?;
        }
    }

    /// Wait for every workload in the set, one after another.
    pub async fn wait_all(&self, set: &ResourceSet) -> Result<()> {
        if set.is_empty() {
            return Ok(());
        }

        info!("Waiting for {} workloads to become ready", set.len());
        for (kind, namespace, name) in set.iter() {
            self.wait_ready(kind, namespace, name).await?;
        }
        Ok(())
    }
}
