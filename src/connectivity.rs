//! Connectivity probe over the fleet of health-check agent pods.

use std::sync::Arc;

use anyhow::Result;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{PollSettings, ProbeSettings};
use crate::error::MigrationError;
use crate::k8s::cluster::ClusterClient;
use crate::k8s::node_ops::NodeOps;
use crate::k8s::workload::{WorkloadKind, WorkloadRef};
use crate::wait::{ReadinessWaiter, sleep_or_cancel};

pub struct ConnectivityProbe {
    cluster: Arc<dyn ClusterClient>,
    ops: Arc<dyn NodeOps>,
    agent: WorkloadRef,
    settings: ProbeSettings,
    poll: PollSettings,
    waiter: ReadinessWaiter,
    cancel: CancellationToken,
}

impl ConnectivityProbe {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        ops: Arc<dyn NodeOps>,
        agent: WorkloadRef,
        settings: ProbeSettings,
        poll: PollSettings,
        waiter: ReadinessWaiter,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            cluster,
            ops,
            agent,
            settings,
            poll,
            waiter,
            cancel,
        }
    }

    /// Wait for the agent rollout, then poll until every agent pod reports
    /// healthy. Fails with `Connectivity` once the deadline passes.
    pub async fn check(&self) -> Result<()> {
        self.waiter
            .wait_ready(WorkloadKind::DaemonSet, &self.agent.namespace, &self.agent.name)
            .await?;

        let start = Instant::now();
        let deadline = start + self.poll.timeout();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            if self.probe_once().await? {
                info!(
                    attempt = attempt,
                    elapsed_secs = start.elapsed().as_secs(),
                    "Connectivity check passed"
                );
                return Ok(());
            }

            if Instant::now() + self.poll.interval() > deadline {
                return Err(MigrationError::Connectivity(format!(
                    "probe pods in {} ({}) not healthy after {} attempts",
                    self.agent.namespace, self.settings.selector, attempt
                ))
                .into());
            }

            debug!(
                attempt = attempt,
                retry_interval_secs = self.poll.interval().as_secs(),
                "Connectivity check failed, retrying"
            );
            sleep_or_cancel(self.poll.interval(), &self.cancel).await?;
        }
    }

    /// Single probe round without waiting: the agent rollout is complete and
    /// every agent pod reports healthy.
    pub async fn is_healthy(&self) -> Result<bool> {
        let agent = self
            .cluster
            .get_workload(WorkloadKind::DaemonSet, &self.agent.namespace, &self.agent.name)
            .await?;
        if !agent.is_some_and(|w| w.is_ready()) {
            debug!("Probe agent {} is not ready", self.agent);
            return Ok(false);
        }
        self.probe_once().await
    }

    /// Exec the status command in every agent pod. Zero pods is unhealthy.
    async fn probe_once(&self) -> Result<bool> {
        let pods = self
            .cluster
            .list_pods(&self.agent.namespace, &self.settings.selector)
            .await?;

        if pods.is_empty() {
            warn!(
                namespace = %self.agent.namespace,
                selector = %self.settings.selector,
                "No probe pods found"
            );
            return Ok(false);
        }

        let mut healthy = true;
        for pod in &pods {
            let Some(name) = pod.metadata.name.as_deref() else {
                continue;
            };

            match self
                .ops
                .exec(&self.agent.namespace, name, &self.settings.command)
                .await
            {
                Ok(()) => debug!(pod = name, "Probe pod healthy"),
                Err(e) if is_cancelled(&e) => return Err(e),
                Err(e) => {
                    warn!(pod = name, error = %e, "Probe pod reported failure");
                    healthy = false;
                }
            }
        }

        Ok(healthy)
    }
}

fn is_cancelled(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<MigrationError>(),
        Some(MigrationError::Cancelled)
    )
}
