//! Node Drainer
//!
//! Cordons, uncordons and drains nodes. Draining evicts pods through the
//! eviction subresource so PodDisruptionBudgets are honored, optionally falls
//! back to deletion when a budget blocks eviction, and force-deletes pods that
//! stay terminating past their grace period.

mod filter;

pub use filter::{
    has_controller, has_emptydir_volume, is_daemonset_pod, is_mirror_pod, pods_to_evict,
    MIRROR_POD_ANNOTATION,
};

use crate::error::{DrainError, Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, info_span, warn, Instrument};

/// Drain policy for one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainOptions {
    /// Overall deadline for `drain_node`
    pub timeout: Duration,
    /// Deadline for one eviction pass; zero means no per-pass deadline
    pub eviction_timeout: Duration,
    /// Pause between passes
    pub retry_interval: Duration,
    /// Grace period handed to evictions and deletions; negative uses the pod's own
    pub grace_period_seconds: i64,
    pub delete_emptydir_data: bool,
    /// Remove pods that no controller will recreate
    pub force: bool,
    pub ignore_daemonsets: bool,
    /// Delete pods whose eviction is blocked by a disruption budget
    pub allow_deletion: bool,
}

impl Default for DrainOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            eviction_timeout: Duration::from_secs(60),
            retry_interval: Duration::from_secs(5),
            grace_period_seconds: -1,
            delete_emptydir_data: false,
            force: false,
            ignore_daemonsets: false,
            allow_deletion: false,
        }
    }
}

impl DrainOptions {
    /// Grace period to send with evictions and plain deletions.
    pub fn grace_period(&self) -> Option<u32> {
        u32::try_from(self.grace_period_seconds).ok()
    }
}

/// Result of an eviction request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictOutcome {
    Evicted,
    /// Refused with 429: a disruption budget does not allow it right now
    Blocked,
    NotFound,
}

/// Node and pod operations the drainer needs.
#[async_trait]
pub trait DrainClient: Send + Sync {
    async fn get_node(&self, name: &str) -> Result<Option<Node>>;

    /// Set `spec.unschedulable`, failing with `Error::Conflict` if the node moved on.
    async fn set_node_unschedulable(&self, node: &Node, unschedulable: bool) -> Result<Node>;

    async fn list_pods_on_node(&self, node: &str) -> Result<Vec<Pod>>;

    async fn evict_pod(&self, pod: &Pod, grace_period_seconds: Option<u32>)
        -> Result<EvictOutcome>;

    /// Returns `false` if the pod was already gone.
    async fn delete_pod(&self, pod: &Pod, grace_period_seconds: Option<u32>) -> Result<bool>;

    async fn remove_pod_finalizers(&self, pod: &Pod) -> Result<()>;
}

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub struct Drainer {
    client: Arc<dyn DrainClient>,
    opts: DrainOptions,
    now: Clock,
}

impl Drainer {
    pub fn new(client: Arc<dyn DrainClient>, opts: DrainOptions) -> Self {
        Self {
            client,
            opts,
            now: Arc::new(Utc::now),
        }
    }

    pub fn with_clock(mut self, now: Clock) -> Self {
        self.now = now;
        self
    }

    pub async fn cordon_node(&self, node: &str) -> Result<()> {
        self.set_unschedulable(node, true).await?;
        info!(node = %node, "Node cordoned");
        Ok(())
    }

    pub async fn uncordon_node(&self, node: &str) -> Result<()> {
        self.set_unschedulable(node, false).await?;
        info!(node = %node, "Node uncordoned");
        Ok(())
    }

    async fn set_unschedulable(&self, name: &str, unschedulable: bool) -> Result<()> {
        let node = self
            .client
            .get_node(name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("node {}", name)))?;
        self.client.set_node_unschedulable(&node, unschedulable).await?;
        Ok(())
    }

    /// Evict every removable pod from `node`.
    ///
    /// Returns once no pod that has to leave is left, or fails on a pod the
    /// options do not allow removing, or on the overall timeout.
    pub async fn drain_node(&self, node: &str) -> Result<()> {
        let span = info_span!("drain_node", node = %node);
        async {
            info!("Starting node drain");
            match tokio::time::timeout(self.opts.timeout, self.drain_until_empty(node)).await {
                Ok(result) => result,
                Err(_) => Err(DrainError::Timeout {
                    node: node.to_string(),
                    after: self.opts.timeout,
                }
                .into()),
            }
        }
        .instrument(span)
        .await
    }

    async fn drain_until_empty(&self, node: &str) -> Result<()> {
        loop {
            let pods = self
                .client
                .list_pods_on_node(node)
                .await
                .map_err(|e| DrainError::Api {
                    node: node.to_string(),
                    action: "list pods",
                    message: e.to_string(),
                })?;
            let pods = pods_to_evict(pods, &self.opts)?;

            if pods.is_empty() {
                info!("No pods to evict, drain complete");
                return Ok(());
            }

            info!(count = pods.len(), "Evicting pods");
            if self.opts.eviction_timeout.is_zero() {
                self.evict_or_delete(&pods).await;
            } else if tokio::time::timeout(self.opts.eviction_timeout, self.evict_or_delete(&pods))
                .await
                .is_err()
            {
                warn!(
                    "Eviction pass did not finish within {:?}",
                    self.opts.eviction_timeout
                );
            }

            tokio::time::sleep(self.opts.retry_interval).await;
        }
    }

    /// Whether the pod has been terminating longer than its grace period.
    pub fn is_stuck_terminating(&self, pod: &Pod) -> bool {
        let Some(deleted_at) = pod.metadata.deletion_timestamp.as_ref() else {
            return false;
        };
        let grace = if self.opts.grace_period_seconds >= 0 {
            self.opts.grace_period_seconds
        } else {
            pod.metadata.deletion_grace_period_seconds.unwrap_or(0)
        };
        // Out-of-range grace never expires.
        chrono::Duration::try_seconds(grace)
            .and_then(|grace| deleted_at.0.checked_add_signed(grace))
            .is_some_and(|deadline| (self.now)() > deadline)
    }

    async fn evict_or_delete(&self, pods: &[Pod]) {
        for pod in pods {
            let namespace = pod.namespace().unwrap_or_default();
            let name = pod.name_any();

            if self.is_stuck_terminating(pod) {
                info!(pod = %name, namespace = %namespace, "Pod stuck terminating, force deleting");
                if let Err(e) = self.client.remove_pod_finalizers(pod).await {
                    warn!(
                        pod = %name,
                        namespace = %namespace,
                        "Failed to remove finalizers: {}",
                        e
                    );
                    continue;
                }
                if let Err(e) = self.client.delete_pod(pod, Some(0)).await {
                    warn!(pod = %name, namespace = %namespace, "Failed to force delete pod: {}", e);
                }
                continue;
            }

            match self.client.evict_pod(pod, self.opts.grace_period()).await {
                Ok(EvictOutcome::Evicted) => {
                    debug!(pod = %name, namespace = %namespace, "Pod eviction initiated");
                }
                Ok(EvictOutcome::NotFound) => {
                    debug!(pod = %name, namespace = %namespace, "Pod already gone");
                }
                Ok(EvictOutcome::Blocked) if self.opts.allow_deletion => {
                    info!(
                        pod = %name,
                        namespace = %namespace,
                        "Eviction blocked by disruption budget, deleting pod"
                    );
                    if let Err(e) = self.client.delete_pod(pod, self.opts.grace_period()).await {
                        warn!(pod = %name, namespace = %namespace, "Failed to delete pod: {}", e);
                    }
                }
                Ok(EvictOutcome::Blocked) => {
                    info!(
                        pod = %name,
                        namespace = %namespace,
                        "Eviction blocked by disruption budget, retrying later"
                    );
                }
                Err(e) => {
                    warn!(pod = %name, namespace = %namespace, "Failed to evict pod: {}", e);
                }
            }
        }
    }
}
