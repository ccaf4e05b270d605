//! Object store access
//!
//! `ClusterStore` is the narrow view of the Kubernetes API the upgrade logic
//! needs: typed reads, label-selected lists, ConfigMap create/delete for the
//! lock, and annotation patches guarded by `metadata.resourceVersion`.

mod kubernetes;

pub use kubernetes::KubeStore;

use crate::crd::{Annotations, Cluster, ControlPlane, Machine, MachineDeployment, MachineSet};
use crate::error::Result;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use serde_json::{json, Map, Value};

/// Equality and existence label requirements, ANDed together.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelQuery {
    requirements: Vec<(String, Option<String>)>,
}

impl LabelQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `key=value`.
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.requirements.push((key.into(), Some(value.into())));
        self
    }

    /// Require `key` to be present with any value.
    pub fn has(mut self, key: impl Into<String>) -> Self {
        self.requirements.push((key.into(), None));
        self
    }

    /// Selector string in Kubernetes list syntax.
    pub fn to_selector(&self) -> String {
        self.requirements
            .iter()
            .map(|(k, v)| match v {
                Some(v) => format!("{}={}", k, v),
                None => k.clone(),
            })
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn matches(&self, labels: Option<&Annotations>) -> bool {
        self.requirements.iter().all(|(k, v)| {
            let actual = labels.and_then(|l| l.get(k));
            match (v, actual) {
                (Some(want), Some(got)) => want == got,
                (None, Some(_)) => true,
                (_, None) => false,
            }
        })
    }
}

#[async_trait]
pub trait ClusterStore: Send + Sync {
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<Cluster>>;

    async fn get_machine(&self, namespace: &str, name: &str) -> Result<Option<Machine>>;

    async fn get_machine_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<MachineDeployment>>;

    async fn get_control_plane(&self, namespace: &str, name: &str)
        -> Result<Option<ControlPlane>>;

    async fn list_machines(&self, namespace: &str, query: &LabelQuery) -> Result<Vec<Machine>>;

    async fn list_machine_sets(&self, namespace: &str, query: &LabelQuery)
        -> Result<Vec<MachineSet>>;

    /// Replace the machine's annotations with `annotations`.
    ///
    /// Fails with `Error::Conflict` if the machine changed since it was read.
    async fn patch_machine(&self, machine: &Machine, annotations: &Annotations) -> Result<Machine>;

    async fn patch_machine_deployment(
        &self,
        deployment: &MachineDeployment,
        annotations: &Annotations,
    ) -> Result<MachineDeployment>;

    async fn patch_control_plane(
        &self,
        control_plane: &ControlPlane,
        annotations: &Annotations,
    ) -> Result<ControlPlane>;

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>>;

    /// Create, failing with `Error::AlreadyExists` if the name is taken.
    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<()>;

    /// Delete if present. Returns whether an object was removed.
    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<bool>;

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;
}

/// JSON merge patch turning `current` annotations into `desired`.
///
/// Removed keys are sent as `null`. The resource version, when known, makes the
/// API server reject the patch if the object moved on in the meantime.
pub fn annotations_merge_patch(
    current: Option<&Annotations>,
    desired: &Annotations,
    resource_version: Option<&str>,
) -> Value {
    let mut changes = Map::new();
    if let Some(current) = current {
        for key in current.keys().filter(|k| !desired.contains_key(*k)) {
            changes.insert(key.clone(), Value::Null);
        }
    }
    for (key, value) in desired {
        if current.and_then(|c| c.get(key)) != Some(value) {
            changes.insert(key.clone(), Value::String(value.clone()));
        }
    }

    let mut metadata = Map::new();
    metadata.insert("annotations".to_string(), Value::Object(changes));
    if let Some(rv) = resource_version {
        metadata.insert("resourceVersion".to_string(), json!(rv));
    }
    json!({ "metadata": metadata })
}
