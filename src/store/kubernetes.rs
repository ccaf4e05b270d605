//! `ClusterStore` and `DrainClient` backed by a live API server.

use super::{annotations_merge_patch, ClusterStore, LabelQuery};
use crate::crd::{Annotations, Cluster, ControlPlane, Machine, MachineDeployment, MachineSet};
use crate::drain::{DrainClient, EvictOutcome};
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Node, Pod, Secret};
use kube::api::{DeleteParams, EvictParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::fmt::Debug;
use tracing::debug;

const NOT_FOUND: u16 = 404;
const CONFLICT: u16 = 409;
const TOO_MANY_REQUESTS: u16 = 429;

/// Kubernetes-backed store
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = kube::core::NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn api_code(err: &kube::Error) -> Option<u16> {
    match err {
        kube::Error::Api(resp) => Some(resp.code),
        _ => None,
    }
}

/// Map a failed patch to `Error::Conflict` when the resource version was stale.
fn patch_error(err: kube::Error, what: &str) -> Error {
    if api_code(&err) == Some(CONFLICT) {
        Error::Conflict(what.to_string())
    } else {
        Error::Kube(err)
    }
}

async fn get_opt<K>(api: &Api<K>, name: &str) -> Result<Option<K>>
where
    K: Clone + DeserializeOwned + Debug,
{
    Ok(api.get_opt(name).await?)
}

async fn patch_annotations<K>(api: &Api<K>, obj: &K, annotations: &Annotations) -> Result<K>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    let name = obj.name_any();
    let patch = annotations_merge_patch(
        obj.meta().annotations.as_ref(),
        annotations,
        obj.meta().resource_version.as_deref(),
    );
    debug!("Patching annotations of {}: {}", name, patch);
    api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .map_err(|e| patch_error(e, &name))
}

#[async_trait]
impl ClusterStore for KubeStore {
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<Cluster>> {
        get_opt(&self.namespaced::<Cluster>(namespace), name).await
    }

    async fn get_machine(&self, namespace: &str, name: &str) -> Result<Option<Machine>> {
        get_opt(&self.namespaced::<Machine>(namespace), name).await
    }

    async fn get_machine_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<MachineDeployment>> {
        get_opt(&self.namespaced::<MachineDeployment>(namespace), name).await
    }

    async fn get_control_plane(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ControlPlane>> {
        get_opt(&self.namespaced::<ControlPlane>(namespace), name).await
    }

    async fn list_machines(&self, namespace: &str, query: &LabelQuery) -> Result<Vec<Machine>> {
        let lp = ListParams::default().labels(&query.to_selector());
        Ok(self.namespaced::<Machine>(namespace).list(&lp).await?.items)
    }

    async fn list_machine_sets(
        &self,
        namespace: &str,
        query: &LabelQuery,
    ) -> Result<Vec<MachineSet>> {
        let lp = ListParams::default().labels(&query.to_selector());
        Ok(self.namespaced::<MachineSet>(namespace).list(&lp).await?.items)
    }

    async fn patch_machine(&self, machine: &Machine, annotations: &Annotations) -> Result<Machine> {
        let ns = machine.namespace().unwrap_or_default();
        patch_annotations(&self.namespaced::<Machine>(&ns), machine, annotations).await
    }

    async fn patch_machine_deployment(
        &self,
        deployment: &MachineDeployment,
        annotations: &Annotations,
    ) -> Result<MachineDeployment> {
        let ns = deployment.namespace().unwrap_or_default();
        patch_annotations(&self.namespaced::<MachineDeployment>(&ns), deployment, annotations).await
    }

    async fn patch_control_plane(
        &self,
        control_plane: &ControlPlane,
        annotations: &Annotations,
    ) -> Result<ControlPlane> {
        let ns = control_plane.namespace().unwrap_or_default();
        patch_annotations(&self.namespaced::<ControlPlane>(&ns), control_plane, annotations).await
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        get_opt(&self.namespaced::<ConfigMap>(namespace), name).await
    }

    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<()> {
        let ns = config_map.namespace().unwrap_or_default();
        match self
            .namespaced::<ConfigMap>(&ns)
            .create(&PostParams::default(), config_map)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if api_code(&e) == Some(CONFLICT) => {
                Err(Error::AlreadyExists(config_map.name_any()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<bool> {
        match self
            .namespaced::<ConfigMap>(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if api_code(&e) == Some(NOT_FOUND) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        get_opt(&self.namespaced::<Secret>(namespace), name).await
    }
}

#[async_trait]
impl DrainClient for KubeStore {
    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        get_opt(&nodes, name).await
    }

    async fn set_node_unschedulable(&self, node: &Node, unschedulable: bool) -> Result<Node> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let name = node.name_any();
        let patch = json!({
            "metadata": { "resourceVersion": node.resource_version() },
            "spec": { "unschedulable": unschedulable }
        });
        nodes
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| patch_error(e, &name))
    }

    async fn list_pods_on_node(&self, node: &str) -> Result<Vec<Pod>> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let lp = ListParams::default().fields(&format!("spec.nodeName={}", node));
        Ok(pods.list(&lp).await?.items)
    }

    async fn evict_pod(
        &self,
        pod: &Pod,
        grace_period_seconds: Option<u32>,
    ) -> Result<EvictOutcome> {
        let ns = pod.namespace().unwrap_or_default();
        let pods: Api<Pod> = self.namespaced(&ns);
        let params = EvictParams {
            delete_options: Some(DeleteParams {
                grace_period_seconds,
                ..Default::default()
            }),
            ..Default::default()
        };
        match pods.evict(&pod.name_any(), &params).await {
            Ok(_) => Ok(EvictOutcome::Evicted),
            Err(e) => match api_code(&e) {
                Some(TOO_MANY_REQUESTS) => Ok(EvictOutcome::Blocked),
                Some(NOT_FOUND) => Ok(EvictOutcome::NotFound),
                _ => Err(e.into()),
            },
        }
    }

    async fn delete_pod(&self, pod: &Pod, grace_period_seconds: Option<u32>) -> Result<bool> {
        let ns = pod.namespace().unwrap_or_default();
        let pods: Api<Pod> = self.namespaced(&ns);
        let params = DeleteParams {
            grace_period_seconds,
            ..Default::default()
        };
        match pods.delete(&pod.name_any(), &params).await {
            Ok(_) => Ok(true),
            Err(e) if api_code(&e) == Some(NOT_FOUND) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_pod_finalizers(&self, pod: &Pod) -> Result<()> {
        let ns = pod.namespace().unwrap_or_default();
        let pods: Api<Pod> = self.namespaced(&ns);
        let name = pod.name_any();
        let patch = json!({
            "metadata": {
                "resourceVersion": pod.resource_version(),
                "finalizers": null
            }
        });
        match pods
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if api_code(&e) == Some(NOT_FOUND) => Ok(()),
            Err(e) => Err(patch_error(e, &name)),
        }
    }
}
