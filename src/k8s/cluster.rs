//! Cluster state access.
//!
//! `ClusterClient` is the single seam through which every step reads and
//! writes live cluster state. `KubeCluster` implements it against the API
//! server; tests use the in-memory fake.

use anyhow::Result;
use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Namespace, Node, Pod};
use kube::Api;
use kube::api::{
    ApiResource, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams,
};
use serde::de::DeserializeOwned;
use tracing::debug;

use super::workload::{Workload, WorkloadKind};
use crate::error::{MigrationError, is_not_found};

/// Field manager recorded on every patch.
const FIELD_MANAGER: &str = "cni-migration";

/// Live cluster state, read and written without client-side caching.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn list_nodes(&self) -> Result<Vec<Node>>;

    /// Fails with `NodeNotFound` when the node does not exist.
    async fn get_node(&self, name: &str) -> Result<Node>;

    /// Full replace, guarded by the node's resourceVersion.
    async fn replace_node(&self, node: &Node) -> Result<()>;

    async fn list_namespaces(&self) -> Result<Vec<String>>;

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>>;

    /// Pods in every namespace scheduled to the node.
    async fn list_pods_on_node(&self, node: &str) -> Result<Vec<Pod>>;

    /// UID of the named pod, or None if it no longer exists.
    async fn pod_uid(&self, namespace: &str, name: &str) -> Result<Option<String>>;

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;

    async fn get_workload(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Workload>>;

    async fn list_workloads(&self, kind: WorkloadKind, namespace: &str) -> Result<Vec<Workload>>;

    async fn set_template_annotation(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<()>;

    /// Set a pod-template node selector entry, or remove it when `value` is None.
    async fn set_node_selector(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
        key: &str,
        value: Option<&str>,
    ) -> Result<()>;

    /// Returns false when the workload was already gone.
    async fn delete_workload(&self, kind: WorkloadKind, namespace: &str, name: &str)
    -> Result<bool>;

    /// Whether the namespace holds the named NetworkAttachmentDefinition.
    async fn has_network_attachment(&self, namespace: &str, name: &str) -> Result<bool>;

    /// Delete every NetworkAttachmentDefinition in every namespace.
    async fn delete_network_attachments(&self) -> Result<usize>;
}

/// apps/v1 resource types convertible into a `Workload`.
trait AppsResource:
    kube::Resource<Scope = NamespaceResourceScope, DynamicType = ()>
    + Clone
    + DeserializeOwned
    + std::fmt::Debug
    + Send
    + Sync
    + 'static
{
    fn to_workload(&self) -> Workload;
}

impl AppsResource for DaemonSet {
    fn to_workload(&self) -> Workload {
        Workload::from_daemon_set(self)
    }
}

impl AppsResource for Deployment {
    fn to_workload(&self) -> Workload {
        Workload::from_deployment(self)
    }
}

impl AppsResource for StatefulSet {
    fn to_workload(&self) -> Workload {
        Workload::from_stateful_set(self)
    }
}

/// ApiResource for `k8s.cni.cncf.io/v1` NetworkAttachmentDefinition.
fn network_attachment_resource() -> ApiResource {
    ApiResource {
        group: "k8s.cni.cncf.io".to_string(),
        version: "v1".to_string(),
        api_version: "k8s.cni.cncf.io/v1".to_string(),
        kind: "NetworkAttachmentDefinition".to_string(),
        plural: "network-attachment-definitions".to_string(),
    }
}

/// `ClusterClient` backed by the Kubernetes API server.
pub struct KubeCluster {
    client: kube::Client,
}

impl KubeCluster {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    async fn get_typed<K: AppsResource>(&self, namespace: &str, name: &str) -> Result<Option<Workload>> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let obj = api.get_opt(name).await.map_err(|e| {
            MigrationError::kube(&format!("get {}/{}", namespace, name), e)
        })?;
        Ok(obj.map(|o| o.to_workload()))
    }

    async fn list_typed<K: AppsResource>(&self, namespace: &str) -> Result<Vec<Workload>> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(&ListParams::default()).await.map_err(|e| {
            MigrationError::kube(&format!("list workloads in {}", namespace), e)
        })?;
        Ok(list.items.iter().map(AppsResource::to_workload).collect())
    }

    async fn patch_typed<K: AppsResource>(
        &self,
        namespace: &str,
        name: &str,
        patch: serde_json::Value,
    ) -> Result<()> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        debug!("Patching {}/{} with {}", namespace, name, patch);
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(patch))
            .await
            .map_err(|e| MigrationError::kube(&format!("patch {}/{}", namespace, name), e))?;
        Ok(())
    }

    async fn delete_typed<K: AppsResource>(&self, namespace: &str, name: &str) -> Result<bool> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(MigrationError::kube(&format!("delete {}/{}", namespace, name), e).into()),
        }
    }

    async fn patch_workload(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
        patch: serde_json::Value,
    ) -> Result<()> {
        match kind {
            WorkloadKind::DaemonSet => self.patch_typed::<DaemonSet>(namespace, name, patch).await,
            WorkloadKind::Deployment => self.patch_typed::<Deployment>(namespace, name, patch).await,
            WorkloadKind::StatefulSet => {
                self.patch_typed::<StatefulSet>(namespace, name, patch).await
            }
        }
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| MigrationError::kube("list nodes", e))?;
        debug!("Found {} nodes", list.items.len());
        Ok(list.items)
    }

    async fn get_node(&self, name: &str) -> Result<Node> {
        let api: Api<Node> = Api::all(self.client.clone());
        api.get_opt(name)
            .await
            .map_err(|e| MigrationError::kube(&format!("get node {}", name), e))?
            .ok_or_else(|| MigrationError::NodeNotFound(name.to_string()).into())
    }

    async fn replace_node(&self, node: &Node) -> Result<()> {
        let name = node.metadata.name.as_deref().unwrap_or_default();
        let api: Api<Node> = Api::all(self.client.clone());
        api.replace(name, &PostParams::default(), node)
            .await
            .map_err(|e| MigrationError::kube(&format!("update node {}", name), e))?;
        Ok(())
    }

    async fn list_namespaces(&self) -> Result<Vec<String>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| MigrationError::kube("list namespaces", e))?;
        Ok(list
            .items
            .into_iter()
            .filter_map(|ns| ns.metadata.name)
            .collect())
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = api
            .list(&ListParams::default().labels(label_selector))
            .await
            .map_err(|e| {
                MigrationError::kube(
                    &format!("list pods in {} ({})", namespace, label_selector),
                    e,
                )
            })?;
        Ok(list.items)
    }

    async fn list_pods_on_node(&self, node: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let selector = format!("spec.nodeName={}", node);
        let list = api
            .list(&ListParams::default().fields(&selector))
            .await
            .map_err(|e| MigrationError::kube(&format!("list pods on node {}", node), e))?;
        Ok(list.items)
    }

    async fn pod_uid(&self, namespace: &str, name: &str) -> Result<Option<String>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pod = api
            .get_opt(name)
            .await
            .map_err(|e| MigrationError::kube(&format!("get pod {}/{}", namespace, name), e))?;
        Ok(pod.map(|p| p.metadata.uid.unwrap_or_default()))
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => {
                Err(MigrationError::kube(&format!("delete pod {}/{}", namespace, name), e).into())
            }
        }
    }

    async fn get_workload(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Workload>> {
        match kind {
            WorkloadKind::DaemonSet => self.get_typed::<DaemonSet>(namespace, name).await,
            WorkloadKind::Deployment => self.get_typed::<Deployment>(namespace, name).await,
            WorkloadKind::StatefulSet => self.get_typed::<StatefulSet>(namespace, name).await,
        }
    }

    async fn list_workloads(&self, kind: WorkloadKind, namespace: &str) -> Result<Vec<Workload>> {
        match kind {
            WorkloadKind::DaemonSet => self.list_typed::<DaemonSet>(namespace).await,
            WorkloadKind::Deployment => self.list_typed::<Deployment>(namespace).await,
            WorkloadKind::StatefulSet => self.list_typed::<StatefulSet>(namespace).await,
        }
    }

    async fn set_template_annotation(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<()> {
        let patch = serde_json::json!({
            "spec": {
                "template": {
                    "metadata": {
                        "annotations": { key: value }
                    }
                }
            }
        });
        self.patch_workload(kind, namespace, name, patch).await
    }

    async fn set_node_selector(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
        key: &str,
        value: Option<&str>,
    ) -> Result<()> {
        // A null value removes the key under JSON merge patch semantics.
        let patch = serde_json::json!({
            "spec": {
                "template": {
                    "spec": {
                        "nodeSelector": { key: value }
                    }
                }
            }
        });
        self.patch_workload(kind, namespace, name, patch).await
    }

    async fn delete_workload(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
    ) -> Result<bool> {
        match kind {
            WorkloadKind::DaemonSet => self.delete_typed::<DaemonSet>(namespace, name).await,
            WorkloadKind::Deployment => self.delete_typed::<Deployment>(namespace, name).await,
            WorkloadKind::StatefulSet => self.delete_typed::<StatefulSet>(namespace, name).await,
        }
    }

    async fn has_network_attachment(&self, namespace: &str, name: &str) -> Result<bool> {
        let ar = network_attachment_resource();
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, &ar);
        match api.get_opt(name).await {
            Ok(found) => Ok(found.is_some()),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(MigrationError::kube(
                &format!("get network attachment {}/{}", namespace, name),
                e,
            )
            .into()),
        }
    }

    async fn delete_network_attachments(&self) -> Result<usize> {
        let ar = network_attachment_resource();
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);

        let list = match api.list(&ListParams::default()).await {
            Ok(list) => list,
            Err(e) if is_not_found(&e) => {
                debug!("NetworkAttachmentDefinition CRD not installed, nothing to delete");
                return Ok(0);
            }
            Err(e) => return Err(MigrationError::kube("list network attachments", e).into()),
        };

        let mut deleted = 0;
        for obj in &list.items {
            let (Some(namespace), Some(name)) =
                (obj.metadata.namespace.as_deref(), obj.metadata.name.as_deref())
            else {
                continue;
            };

            let ns_api: Api<DynamicObject> =
                Api::namespaced_with(self.client.clone(), namespace, &ar);
            match ns_api.delete(name, &DeleteParams::default()).await {
                Ok(_) => deleted += 1,
                Err(e) if is_not_found(&e) => {}
                Err(e) => {
                    return Err(MigrationError::kube(
                        &format!("delete network attachment {}/{}", namespace, name),
                        e,
                    )
                    .into());
                }
            }
        }

        Ok(deleted)
    }
}
