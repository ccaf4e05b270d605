//! Operator Types
//!
//! Shared controller context and reconcile plumbing

use crate::config::ControllerSettings;
use crate::error::Error;
use crate::refresh::RefreshClient;
use crate::store::ClusterStore;
use crate::upgrade::{EventRecorder, UpgradeTiming};
use kube::runtime::controller::Action;
use kube::{Client, Resource, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

/// Context data for the controllers
pub struct Context {
    pub client: Client,
    pub store: Arc<dyn ClusterStore>,
    pub refresh: Arc<dyn RefreshClient>,
    pub events: Arc<dyn EventRecorder>,
    pub timing: UpgradeTiming,
    /// Requeue delay after a reconcile error
    pub error_requeue: Duration,
}

impl Context {
    pub fn new(
        client: Client,
        store: Arc<dyn ClusterStore>,
        refresh: Arc<dyn RefreshClient>,
        events: Arc<dyn EventRecorder>,
        settings: &ControllerSettings,
    ) -> Self {
        Self {
            client,
            store,
            refresh,
            events,
            timing: UpgradeTiming::from(settings),
            error_requeue: settings.error_requeue(),
        }
    }
}

/// Error handler shared by all controllers
///
/// Expected races (conflicts, a held lock, an unreachable node) retry on the
/// short interval; everything else backs off.
pub fn error_policy<K>(obj: Arc<K>, error: &Error, ctx: Arc<Context>) -> Action
where
    K: Resource,
{
    let namespace = obj.namespace().unwrap_or_default();
    let name = obj.name_any();
    if error.is_transient() {
        warn!("Reconciliation of {}/{} will retry: {}", namespace, name, error);
        Action::requeue(ctx.timing.requeue_after)
    } else {
        error!("Reconciliation error for {}/{}: {:?}", namespace, name, error);
        Action::requeue(ctx.error_requeue)
    }
}
