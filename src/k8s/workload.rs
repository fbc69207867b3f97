//! Workload model shared by the three apps/v1 kinds the migration touches.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::PodTemplateSpec;
use serde::Deserialize;

/// Workload kinds the migration watches, annotates and deletes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WorkloadKind {
    DaemonSet,
    Deployment,
    StatefulSet,
}

impl WorkloadKind {
    /// Scan order used by readiness waits and the annotator.
    pub const ALL: [WorkloadKind; 3] = [
        WorkloadKind::Deployment,
        WorkloadKind::DaemonSet,
        WorkloadKind::StatefulSet,
    ];
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkloadKind::DaemonSet => "DaemonSet",
            WorkloadKind::Deployment => "Deployment",
            WorkloadKind::StatefulSet => "StatefulSet",
        };
        f.write_str(s)
    }
}

/// Namespaced name of a workload referenced from configuration.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct WorkloadRef {
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for WorkloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Snapshot of a workload as read from the API server.
#[derive(Debug, Clone, PartialEq)]
pub struct Workload {
    pub kind: WorkloadKind,
    pub namespace: String,
    pub name: String,
    pub template_annotations: BTreeMap<String, String>,
    pub node_selector: BTreeMap<String, String>,
    pub host_network: bool,
    pub ready: i32,
    pub desired: i32,
    /// Pods running the latest template.
    pub updated: i32,
    /// All pods the controller currently owns, old and new.
    pub current: i32,
    pub generation: Option<i64>,
    pub observed_generation: Option<i64>,
}

impl Workload {
    /// The rollout has finished: the controller has seen the latest spec,
    /// every desired pod runs the latest template and is ready, and no old
    /// pods are left over.
    pub fn is_ready(&self) -> bool {
        let observed = match (self.generation, self.observed_generation) {
            (Some(generation), Some(observed)) => observed >= generation,
            (Some(_), None) => false,
            (None, _) => true,
        };
        observed
            && self.updated == self.desired
            && self.current == self.desired
            && self.ready == self.desired
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.template_annotations.get(key).map(String::as_str)
    }

    pub fn from_daemon_set(ds: &DaemonSet) -> Self {
        let status = ds.status.as_ref();
        let mut workload = Self::base(
            WorkloadKind::DaemonSet,
            &ds.metadata,
            ds.spec.as_ref().map(|s| &s.template),
        );
        workload.ready = status.map_or(0, |s| s.number_ready);
        workload.desired = status.map_or(0, |s| s.desired_number_scheduled);
        workload.updated = status.and_then(|s| s.updated_number_scheduled).unwrap_or(0);
        workload.current = status.map_or(0, |s| s.current_number_scheduled);
        workload.observed_generation = status.and_then(|s| s.observed_generation);
        workload
    }

    pub fn from_deployment(deploy: &Deployment) -> Self {
        let status = deploy.status.as_ref();
        let mut workload = Self::base(
            WorkloadKind::Deployment,
            &deploy.metadata,
            deploy.spec.as_ref().map(|s| &s.template),
        );
        workload.ready = status.and_then(|s| s.ready_replicas).unwrap_or(0);
        workload.desired = deploy.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
        workload.updated = status.and_then(|s| s.updated_replicas).unwrap_or(0);
        workload.current = status.and_then(|s| s.replicas).unwrap_or(0);
        workload.observed_generation = status.and_then(|s| s.observed_generation);
        workload
    }

    pub fn from_stateful_set(sts: &StatefulSet) -> Self {
        let status = sts.status.as_ref();
        let mut workload = Self::base(
            WorkloadKind::StatefulSet,
            &sts.metadata,
            sts.spec.as_ref().map(|s| &s.template),
        );
        workload.ready = status.and_then(|s| s.ready_replicas).unwrap_or(0);
        workload.desired = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
        workload.updated = status.and_then(|s| s.updated_replicas).unwrap_or(0);
        workload.current = status.map_or(0, |s| s.replicas);
        workload.observed_generation = status.and_then(|s| s.observed_generation);
        workload
    }

    fn base(
        kind: WorkloadKind,
        metadata: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta,
        template: Option<&PodTemplateSpec>,
    ) -> Self {
        let template_annotations = template
            .and_then(|t| t.metadata.as_ref())
            .and_then(|m| m.annotations.clone())
            .unwrap_or_default();
        let pod_spec = template.and_then(|t| t.spec.as_ref());

        Self {
            kind,
            namespace: metadata.namespace.clone().unwrap_or_default(),
            name: metadata.name.clone().unwrap_or_default(),
            template_annotations,
            node_selector: pod_spec
                .and_then(|s| s.node_selector.clone())
                .unwrap_or_default(),
            host_network: pod_spec.and_then(|s| s.host_network).unwrap_or(false),
            ready: 0,
            desired: 0,
            updated: 0,
            current: 0,
            generation: metadata.generation,
            observed_generation: None,
        }
    }
}

#[cfg(test)]
pub(crate) fn test_workload(kind: WorkloadKind, namespace: &str, name: &str) -> Workload {
    Workload {
        kind,
        namespace: namespace.to_string(),
        name: name.to_string(),
        template_annotations: BTreeMap::new(),
        node_selector: BTreeMap::new(),
        host_network: false,
        ready: 3,
        desired: 3,
        updated: 3,
        current: 3,
        generation: Some(1),
        observed_generation: Some(1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{
        DaemonSetSpec, DaemonSetStatus, DeploymentSpec, DeploymentStatus,
    };
    use k8s_openapi::api::core::v1::PodSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    #[test]
    fn test_is_ready_requires_observed_generation() {
        let mut w = test_workload(WorkloadKind::Deployment, "default", "web");
        assert!(w.is_ready());

        w.generation = Some(2);
        assert!(!w.is_ready());

        w.observed_generation = None;
        assert!(!w.is_ready());

        w.generation = None;
        assert!(w.is_ready());
    }

    #[test]
    fn test_is_ready_counts() {
        let mut w = test_workload(WorkloadKind::StatefulSet, "db", "postgres");
        w.ready = 1;
        assert!(!w.is_ready());
    }

    #[test]
    fn test_from_daemon_set() {
        let ds = DaemonSet {
            metadata: ObjectMeta {
                name: Some("canal".to_string()),
                namespace: Some("kube-system".to_string()),
                generation: Some(4),
                ..Default::default()
            },
            spec: Some(DaemonSetSpec {
                template: PodTemplateSpec {
                    metadata: None,
                    spec: Some(PodSpec {
                        host_network: Some(true),
                        node_selector: Some(BTreeMap::from([(
                            "node-role.kubernetes.io/canal-cilium".to_string(),
                            "true".to_string(),
                        )])),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            status: Some(DaemonSetStatus {
                number_ready: 2,
                desired_number_scheduled: 3,
                current_number_scheduled: 3,
                updated_number_scheduled: Some(3),
                observed_generation: Some(4),
                ..Default::default()
            }),
        };

        let w = Workload::from_daemon_set(&ds);
        assert_eq!(w.kind, WorkloadKind::DaemonSet);
        assert_eq!(w.name, "canal");
        assert!(w.host_network);
        assert_eq!((w.ready, w.desired), (2, 3));
        assert_eq!(
            w.node_selector
                .get("node-role.kubernetes.io/canal-cilium")
                .map(String::as_str),
            Some("true")
        );
        assert!(!w.is_ready());
    }

    #[test]
    fn test_deployment_surge_is_not_ready() {
        let deploy = Deployment {
            metadata: ObjectMeta {
                name: Some("coredns".to_string()),
                namespace: Some("kube-system".to_string()),
                generation: Some(2),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(3),
                ..Default::default()
            }),
            status: Some(DeploymentStatus {
                replicas: Some(4),
                ready_replicas: Some(4),
                updated_replicas: Some(1),
                observed_generation: Some(2),
                ..Default::default()
            }),
        };

        let w = Workload::from_deployment(&deploy);
        assert_eq!(w.desired, 3);
        assert!(!w.is_ready());

        let mut done = deploy.clone();
        done.status = Some(DeploymentStatus {
            replicas: Some(3),
            ready_replicas: Some(3),
            updated_replicas: Some(3),
            observed_generation: Some(2),
            ..Default::default()
        });
        assert!(Workload::from_deployment(&done).is_ready());
    }

    #[test]
    fn test_daemon_set_restart_waits_for_updated_pods() {
        let ds = DaemonSet {
            metadata: ObjectMeta {
                name: Some("knet-stress".to_string()),
                namespace: Some("knet-stress".to_string()),
                generation: Some(5),
                ..Default::default()
            },
            spec: None,
            status: Some(DaemonSetStatus {
                number_ready: 3,
                desired_number_scheduled: 3,
                current_number_scheduled: 3,
                updated_number_scheduled: Some(0),
                observed_generation: Some(5),
                ..Default::default()
            }),
        };
        assert!(!Workload::from_daemon_set(&ds).is_ready());
    }

    #[test]
    fn test_is_ready_requires_old_pods_gone() {
        let mut w = test_workload(WorkloadKind::Deployment, "default", "web");
        w.current = 4;
        assert!(!w.is_ready());
        w.current = 3;
        w.updated = 2;
        assert!(!w.is_ready());
    }
}
