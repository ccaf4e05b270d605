//! Cluster API resources
//!
//! Partial typed views of the Cluster API kinds this operator reads and annotates.
//! Only the fields the upgrade and drain logic touch are declared; everything else
//! on the live objects is ignored on read and left untouched by merge patches.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{CustomResource, Resource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Annotation or label map as stored in object metadata
pub type Annotations = BTreeMap<String, String>;

/// Label carrying the owning cluster's name
pub const CLUSTER_NAME_LABEL: &str = "cluster.x-k8s.io/cluster-name";

/// Label carrying the owning machine deployment's name
pub const DEPLOYMENT_NAME_LABEL: &str = "cluster.x-k8s.io/deployment-name";

/// Label present on control-plane machines
pub const CONTROL_PLANE_LABEL: &str = "cluster.x-k8s.io/control-plane";

/// API version of the core Cluster API kinds
pub const CLUSTER_API_VERSION: &str = "cluster.x-k8s.io/v1beta1";

// ==================== Cluster ====================

#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "cluster.x-k8s.io",
    version = "v1beta1",
    kind = "Cluster",
    plural = "clusters",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Whether reconciliation of the cluster is paused
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused: Option<bool>,
}

// ==================== Machine ====================

#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "cluster.x-k8s.io",
    version = "v1beta1",
    kind = "Machine",
    plural = "machines",
    shortname = "ma",
    status = "MachineStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    /// Name of the cluster this machine belongs to
    #[serde(default)]
    pub cluster_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    /// Node backing this machine, once it joined
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_ref: Option<NodeReference>,

    /// Addresses reported by the infrastructure provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addresses: Option<Vec<MachineAddress>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
pub struct NodeReference {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct MachineAddress {
    /// InternalIP, ExternalIP, Hostname, ...
    #[serde(rename = "type")]
    pub type_: String,
    pub address: String,
}

// ==================== MachineSet ====================

#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "cluster.x-k8s.io",
    version = "v1beta1",
    kind = "MachineSet",
    plural = "machinesets",
    shortname = "ms",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSetSpec {
    #[serde(default)]
    pub cluster_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
}

// ==================== MachineDeployment ====================

#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "cluster.x-k8s.io",
    version = "v1beta1",
    kind = "MachineDeployment",
    plural = "machinedeployments",
    shortname = "md",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct MachineDeploymentSpec {
    #[serde(default)]
    pub cluster_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
}

// ==================== Control plane ====================

#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "controlplane.cluster.x-k8s.io",
    version = "v1beta2",
    kind = "CK8sControlPlane",
    root = "ControlPlane",
    plural = "ck8scontrolplanes",
    status = "ControlPlaneStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneSpec {
    /// Desired number of control-plane machines
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_replicas: Option<i32>,
}

// ==================== Helpers ====================

/// Whether the object carries a deletion timestamp.
pub fn is_deleting(meta: &ObjectMeta) -> bool {
    meta.deletion_timestamp.is_some()
}

/// Whether `meta` lists an owner reference with the given uid.
pub fn is_owned_by(meta: &ObjectMeta, owner_uid: &str) -> bool {
    meta.owner_references
        .as_ref()
        .is_some_and(|refs| refs.iter().any(|r| r.uid == owner_uid))
}

/// Name of the owner reference of the given kind, if any.
pub fn owner_name_of_kind<'a>(meta: &'a ObjectMeta, kind: &str) -> Option<&'a str> {
    meta.owner_references
        .as_ref()?
        .iter()
        .find(|r| r.kind == kind)
        .map(|r| r.name.as_str())
}

/// Annotations of any resource, empty if unset.
pub fn annotations_of<K: Resource>(obj: &K) -> Annotations {
    obj.meta().annotations.clone().unwrap_or_default()
}

impl Machine {
    /// Node backing this machine, if it has joined the cluster.
    pub fn node_name(&self) -> Option<&str> {
        self.status
            .as_ref()?
            .node_ref
            .as_ref()
            .map(|r| r.name.as_str())
            .filter(|n| !n.is_empty())
    }

    /// First address of the given type.
    pub fn address_of_type(&self, type_: &str) -> Option<&str> {
        self.status
            .as_ref()?
            .addresses
            .as_ref()?
            .iter()
            .find(|a| a.type_ == type_)
            .map(|a| a.address.as_str())
    }
}

impl ControlPlane {
    /// Whether every desired control-plane machine is reported ready.
    pub fn replicas_ready(&self) -> bool {
        let desired = self.spec.replicas.unwrap_or(0);
        let ready = self
            .status
            .as_ref()
            .and_then(|s| s.ready_replicas)
            .unwrap_or(0);
        ready == desired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

    #[test]
    fn test_machine_address_lookup() {
        let mut machine = Machine::new("m1", MachineSpec::default());
        machine.status = Some(MachineStatus {
            addresses: Some(vec![
                MachineAddress {
                    type_: "ExternalIP".to_string(),
                    address: "203.0.113.7".to_string(),
                },
                MachineAddress {
                    type_: "InternalIP".to_string(),
                    address: "10.0.0.7".to_string(),
                },
            ]),
            ..Default::default()
        });

        assert_eq!(machine.address_of_type("InternalIP"), Some("10.0.0.7"));
        assert_eq!(machine.address_of_type("Hostname"), None);
        assert_eq!(machine.node_name(), None);
    }

    #[test]
    fn test_machine_status_wire_names() {
        let raw = serde_json::json!({
            "nodeRef": {"name": "node-a"},
            "addresses": [{"type": "InternalIP", "address": "10.1.1.1"}]
        });
        let status: MachineStatus = serde_json::from_value(raw).unwrap();
        assert_eq!(status.node_ref.unwrap().name, "node-a");
        assert_eq!(status.addresses.unwrap()[0].type_, "InternalIP");
    }

    #[test]
    fn test_owner_helpers() {
        let meta = ObjectMeta {
            owner_references: Some(vec![OwnerReference {
                api_version: CLUSTER_API_VERSION.to_string(),
                kind: "Cluster".to_string(),
                name: "c1".to_string(),
                uid: "uid-c1".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        };
        assert!(is_owned_by(&meta, "uid-c1"));
        assert!(!is_owned_by(&meta, "uid-other"));
        assert_eq!(owner_name_of_kind(&meta, "Cluster"), Some("c1"));
        assert_eq!(owner_name_of_kind(&meta, "MachineSet"), None);
    }

    #[test]
    fn test_control_plane_readiness() {
        let mut cp = ControlPlane::new(
            "cp",
            ControlPlaneSpec {
                replicas: Some(3),
                version: None,
            },
        );
        assert!(!cp.replicas_ready());
        cp.status = Some(ControlPlaneStatus {
            replicas: Some(3),
            ready_replicas: Some(3),
        });
        assert!(cp.replicas_ready());
    }
}
