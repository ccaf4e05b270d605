//! Kubernetes operator runtime
//!
//! Wires the upgrade state machines to the API server as `kube` controllers.

mod controlplane;
mod machine;
mod machinedeployment;
mod types;

pub use controlplane::{reconcile_control_plane, run_control_plane_controller};
pub use machine::{reconcile_machine, run_machine_controller};
pub use machinedeployment::{
    deployment_for_machine, reconcile_machine_deployment, run_machine_deployment_controller,
};
pub use types::{error_policy, Context};

use crate::config::OperatorConfig;
use crate::error::Result;
use crate::refresh::{K8sdRefreshClient, RefreshClient};
use crate::store::{ClusterStore, KubeStore};
use crate::upgrade::{EventRecorder, KubeEventRecorder};
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use kube::Client;
use std::sync::Arc;
use tracing::{info, warn};

/// Run every enabled controller until shutdown.
pub async fn run(client: Client, config: &OperatorConfig) -> Result<()> {
    let store: Arc<dyn ClusterStore> = Arc::new(KubeStore::new(client.clone()));
    let refresh: Arc<dyn RefreshClient> =
        Arc::new(K8sdRefreshClient::new(store.clone(), &config.refresh)?);
    let events: Arc<dyn EventRecorder> = Arc::new(KubeEventRecorder::new(
        client.clone(),
        &config.controller.reporter,
    ));
    let ctx = Arc::new(Context::new(
        client,
        store,
        refresh,
        events,
        &config.controller,
    ));

    let settings = &config.controller;
    let mut controllers: Vec<BoxFuture<'static, ()>> = Vec::new();
    if settings.machine_upgrade_enabled {
        controllers.push(run_machine_controller(ctx.clone()).boxed());
    }
    if settings.machine_deployment_enabled {
        controllers.push(run_machine_deployment_controller(ctx.clone()).boxed());
    }
    if settings.control_plane_enabled {
        controllers.push(run_control_plane_controller(ctx.clone()).boxed());
    }

    if controllers.is_empty() {
        warn!("All controllers are disabled, nothing to do");
        return Ok(());
    }

    info!(controllers = controllers.len(), "Operator started");
    join_all(controllers).await;
    info!("Operator stopped");
    Ok(())
}
