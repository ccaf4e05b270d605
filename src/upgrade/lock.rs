//! Upgrade Lock
//!
//! Cluster-scoped advisory lock naming the one machine allowed to upgrade.
//! The lock is a ConfigMap: creating it acquires, deleting it releases.

use crate::crd::{Cluster, Machine, CLUSTER_API_VERSION, CLUSTER_NAME_LABEL};
use crate::error::{Error, Result};
use crate::store::ClusterStore;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Data key holding the lock holder
pub const LOCK_INFORMATION_KEY: &str = "lock-information";

#[async_trait]
pub trait UpgradeLock: Send + Sync {
    /// Machine currently holding the lock, if any.
    async fn is_locked(&self, cluster: &Cluster) -> Result<Option<Machine>>;

    /// Acquire for `machine`. Fails with `Error::LockHeld` if anyone holds it.
    async fn lock(&self, cluster: &Cluster, machine: &Machine) -> Result<()>;

    /// Release. Releasing a free lock is fine.
    async fn unlock(&self, cluster: &Cluster) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockInformation {
    pub machine_name: String,
    pub machine_namespace: String,
}

pub fn lock_record_name(cluster_name: &str) -> String {
    format!("{}-cp-inplace-upgrade-lock", cluster_name)
}

pub struct ConfigMapUpgradeLock {
    store: Arc<dyn ClusterStore>,
}

impl ConfigMapUpgradeLock {
    pub fn new(store: Arc<dyn ClusterStore>) -> Self {
        Self { store }
    }

    fn record(cluster: &Cluster, machine: &Machine) -> Result<ConfigMap> {
        let info = LockInformation {
            machine_name: machine.name_any(),
            machine_namespace: machine.namespace().unwrap_or_default(),
        };
        let cluster_name = cluster.name_any();
        Ok(ConfigMap {
            metadata: ObjectMeta {
                name: Some(lock_record_name(&cluster_name)),
                namespace: cluster.namespace(),
                labels: Some(BTreeMap::from([(
                    CLUSTER_NAME_LABEL.to_string(),
                    cluster_name.clone(),
                )])),
                owner_references: Some(vec![OwnerReference {
                    api_version: CLUSTER_API_VERSION.to_string(),
                    kind: "Cluster".to_string(),
                    name: cluster_name,
                    uid: cluster.uid().unwrap_or_default(),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                LOCK_INFORMATION_KEY.to_string(),
                serde_json::to_string(&info)?,
            )])),
            ..Default::default()
        })
    }
}

#[async_trait]
impl UpgradeLock for ConfigMapUpgradeLock {
    async fn is_locked(&self, cluster: &Cluster) -> Result<Option<Machine>> {
        let namespace = cluster.namespace().unwrap_or_default();
        let name = lock_record_name(&cluster.name_any());

        let Some(record) = self.store.get_config_map(&namespace, &name).await? else {
            return Ok(None);
        };

        let raw = record
            .data
            .as_ref()
            .and_then(|d| d.get(LOCK_INFORMATION_KEY))
            .ok_or_else(|| {
                Error::InvalidLock(format!(
                    "{}/{} has no {}",
                    namespace, name, LOCK_INFORMATION_KEY
                ))
            })?;
        let info: LockInformation = serde_json::from_str(raw)
            .map_err(|e| Error::InvalidLock(format!("{}/{}: {}", namespace, name, e)))?;

        match self
            .store
            .get_machine(&info.machine_namespace, &info.machine_name)
            .await?
        {
            Some(machine) => Ok(Some(machine)),
            None => {
                info!(
                    cluster = %cluster.name_any(),
                    machine = %info.machine_name,
                    "Lock holder no longer exists, releasing lock"
                );
                self.store.delete_config_map(&namespace, &name).await?;
                Ok(None)
            }
        }
    }

    async fn lock(&self, cluster: &Cluster, machine: &Machine) -> Result<()> {
        let record = Self::record(cluster, machine)?;
        match self.store.create_config_map(&record).await {
            Ok(()) => {
                debug!(
                    cluster = %cluster.name_any(),
                    machine = %machine.name_any(),
                    "Acquired upgrade lock"
                );
                Ok(())
            }
            Err(Error::AlreadyExists(_)) => Err(Error::LockHeld(cluster.name_any())),
            Err(e) => Err(e),
        }
    }

    async fn unlock(&self, cluster: &Cluster) -> Result<()> {
        let namespace = cluster.namespace().unwrap_or_default();
        if self
            .store
            .delete_config_map(&namespace, &lock_record_name(&cluster.name_any()))
            .await?
        {
            debug!(cluster = %cluster.name_any(), "Released upgrade lock");
        }
        Ok(())
    }
}
