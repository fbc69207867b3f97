//! Named workload sets and the presence checks run against them.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use serde::Deserialize;
use tracing::{debug, info};

use crate::k8s::cluster::ClusterClient;
use crate::k8s::workload::WorkloadKind;

/// Workload names grouped by kind, then namespace.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ResourceSet {
    #[serde(default)]
    pub daemonsets: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub deployments: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub statefulsets: BTreeMap<String, Vec<String>>,
}

impl ResourceSet {
    fn by_kind(&self, kind: WorkloadKind) -> &BTreeMap<String, Vec<String>> {
        match kind {
            WorkloadKind::DaemonSet => &self.daemonsets,
            WorkloadKind::Deployment => &self.deployments,
            WorkloadKind::StatefulSet => &self.statefulsets,
        }
    }

    /// Every (kind, namespace, name) entry, Deployments first.
    pub fn iter(&self) -> impl Iterator<Item = (WorkloadKind, &str, &str)> + '_ {
        WorkloadKind::ALL.into_iter().flat_map(move |kind| {
            self.by_kind(kind).iter().flat_map(move |(ns, names)| {
                names
                    .iter()
                    .map(move |name| (kind, ns.as_str(), name.as_str()))
            })
        })
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }
}

/// Presence checks and bulk deletion over a `ResourceSet`.
pub struct ResourceInventory {
    cluster: Arc<dyn ClusterClient>,
}

impl ResourceInventory {
    pub fn new(cluster: Arc<dyn ClusterClient>) -> Self {
        Self { cluster }
    }

    /// True when every workload in the set exists.
    pub async fn has_all(&self, set: &ResourceSet) -> Result<bool> {
        for (kind, namespace, name) in set.iter() {
            if self.cluster.get_workload(kind, namespace, name).await?.is_none() {
                debug!("{} {}/{} not found", kind, namespace, name);
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// True when at least one workload in the set exists.
    pub async fn has_any(&self, set: &ResourceSet) -> Result<bool> {
        for (kind, namespace, name) in set.iter() {
            if self.cluster.get_workload(kind, namespace, name).await?.is_some() {
                debug!("{} {}/{} still present", kind, namespace, name);
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Delete every workload in the set. Returns how many existed.
    pub async fn delete_all(&self, set: &ResourceSet) -> Result<usize> {
        let mut deleted = 0;
        for (kind, namespace, name) in set.iter() {
            if self.cluster.delete_workload(kind, namespace, name).await? {
                info!("Deleted {} {}/{}", kind, namespace, name);
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}
