//! Upgrade Groups
//!
//! A group is an object whose annotations request an upgrade for a set of
//! sibling machines. The orchestrator walks the members of a group one at a time.

use crate::crd::{
    annotations_of, is_deleting, is_owned_by, owner_name_of_kind, Annotations, Cluster,
    ControlPlane, Machine, MachineDeployment, CLUSTER_NAME_LABEL, CONTROL_PLANE_LABEL,
    DEPLOYMENT_NAME_LABEL,
};
use crate::error::{Error, Result};
use crate::store::{ClusterStore, LabelQuery};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::{Resource, ResourceExt};
use std::sync::Arc;

#[async_trait]
pub trait UpgradeGroup: Send + Sync {
    fn name(&self) -> String;

    fn annotations(&self) -> Annotations;

    fn object_ref(&self) -> ObjectReference;

    fn is_deleting(&self) -> bool;

    /// Whether all desired members are up before any of them is touched.
    fn members_ready(&self) -> bool {
        true
    }

    /// Whether members lose their pending target once the group has none.
    fn cancels_withdrawn_instructions(&self) -> bool {
        false
    }

    /// Cluster the group belongs to. `None` while it is not yet linked to one.
    async fn cluster(&self) -> Result<Option<Cluster>>;

    /// Member machines in upgrade order.
    async fn list_members(&self) -> Result<Vec<Machine>>;

    /// Replace the group's annotations, keeping the fresh object for later writes.
    async fn patch_self(&mut self, annotations: &Annotations) -> Result<()>;

    async fn patch_member(&self, machine: &Machine, annotations: &Annotations) -> Result<Machine>;
}

/// Order by uid with the name as tie-break, so every pass picks the same next machine.
pub fn sort_members(machines: &mut [Machine]) {
    machines.sort_by(|a, b| {
        (a.metadata.uid.as_deref(), a.metadata.name.as_deref())
            .cmp(&(b.metadata.uid.as_deref(), b.metadata.name.as_deref()))
    });
}

// ==================== MachineDeployment ====================

/// Worker machines of a deployment, reached through the MachineSet it owns.
pub struct MachineDeploymentGroup {
    store: Arc<dyn ClusterStore>,
    deployment: MachineDeployment,
}

impl MachineDeploymentGroup {
    pub fn new(store: Arc<dyn ClusterStore>, deployment: MachineDeployment) -> Self {
        Self { store, deployment }
    }
}

#[async_trait]
impl UpgradeGroup for MachineDeploymentGroup {
    fn name(&self) -> String {
        self.deployment.name_any()
    }

    fn annotations(&self) -> Annotations {
        annotations_of(&self.deployment)
    }

    fn object_ref(&self) -> ObjectReference {
        self.deployment.object_ref(&())
    }

    fn is_deleting(&self) -> bool {
        is_deleting(&self.deployment.metadata)
    }

    fn cancels_withdrawn_instructions(&self) -> bool {
        true
    }

    async fn cluster(&self) -> Result<Option<Cluster>> {
        let namespace = self.deployment.namespace().unwrap_or_default();
        self.store
            .get_cluster(&namespace, &self.deployment.spec.cluster_name)
            .await
    }

    async fn list_members(&self) -> Result<Vec<Machine>> {
        let namespace = self.deployment.namespace().unwrap_or_default();
        let cluster_name = &self.deployment.spec.cluster_name;
        let deployment_uid = self.deployment.uid().unwrap_or_default();

        let query = LabelQuery::new()
            .label(CLUSTER_NAME_LABEL, cluster_name.as_str())
            .label(DEPLOYMENT_NAME_LABEL, self.name());
        let machine_set = self
            .store
            .list_machine_sets(&namespace, &query)
            .await?
            .into_iter()
            .find(|ms| is_owned_by(&ms.metadata, &deployment_uid))
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "MachineSet owned by MachineDeployment {}/{}",
                    namespace,
                    self.name()
                ))
            })?;
        let set_uid = machine_set.uid().unwrap_or_default();

        let query = LabelQuery::new().label(CLUSTER_NAME_LABEL, cluster_name.as_str());
        let mut machines: Vec<Machine> = self
            .store
            .list_machines(&namespace, &query)
            .await?
            .into_iter()
            .filter(|m| is_owned_by(&m.metadata, &set_uid))
            .collect();
        sort_members(&mut machines);
        Ok(machines)
    }

    async fn patch_self(&mut self, annotations: &Annotations) -> Result<()> {
        self.deployment = self
            .store
            .patch_machine_deployment(&self.deployment, annotations)
            .await?;
        Ok(())
    }

    async fn patch_member(&self, machine: &Machine, annotations: &Annotations) -> Result<Machine> {
        self.store.patch_machine(machine, annotations).await
    }
}

// ==================== Control plane ====================

/// Control-plane machines of the cluster that owns the control plane.
pub struct ControlPlaneGroup {
    store: Arc<dyn ClusterStore>,
    control_plane: ControlPlane,
}

impl ControlPlaneGroup {
    pub fn new(store: Arc<dyn ClusterStore>, control_plane: ControlPlane) -> Self {
        Self {
            store,
            control_plane,
        }
    }

    fn cluster_name(&self) -> Option<&str> {
        owner_name_of_kind(&self.control_plane.metadata, "Cluster")
    }
}

#[async_trait]
impl UpgradeGroup for ControlPlaneGroup {
    fn name(&self) -> String {
        self.control_plane.name_any()
    }

    fn annotations(&self) -> Annotations {
        annotations_of(&self.control_plane)
    }

    fn object_ref(&self) -> ObjectReference {
        self.control_plane.object_ref(&())
    }

    fn is_deleting(&self) -> bool {
        is_deleting(&self.control_plane.metadata)
    }

    fn members_ready(&self) -> bool {
        self.control_plane.replicas_ready()
    }

    async fn cluster(&self) -> Result<Option<Cluster>> {
        let Some(cluster_name) = self.cluster_name() else {
            return Ok(None);
        };
        let namespace = self.control_plane.namespace().unwrap_or_default();
        self.store.get_cluster(&namespace, cluster_name).await
    }

    async fn list_members(&self) -> Result<Vec<Machine>> {
        let Some(cluster_name) = self.cluster_name() else {
            return Ok(Vec::new());
        };
        let namespace = self.control_plane.namespace().unwrap_or_default();
        let query = LabelQuery::new()
            .label(CLUSTER_NAME_LABEL, cluster_name)
            .has(CONTROL_PLANE_LABEL);
        let mut machines = self.store.list_machines(&namespace, &query).await?;
        sort_members(&mut machines);
        Ok(machines)
    }

    async fn patch_self(&mut self, annotations: &Annotations) -> Result<()> {
        self.control_plane = self
            .store
            .patch_control_plane(&self.control_plane, annotations)
            .await?;
        Ok(())
    }

    async fn patch_member(&self, machine: &Machine, annotations: &Annotations) -> Result<Machine> {
        self.store.patch_machine(machine, annotations).await
    }
}
