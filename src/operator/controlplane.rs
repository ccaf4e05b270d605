//! Control Plane Controller
//!
//! Orchestrates in-place upgrades across control-plane machines, one holder of
//! the cluster upgrade lock at a time.

use super::types::{error_policy, Context};
use crate::crd::{ControlPlane, Machine};
use crate::error::{Error, Result};
use crate::upgrade::{ConfigMapUpgradeLock, ControlPlaneGroup, Orchestrator};
use futures::StreamExt;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Api, ResourceExt};
use std::sync::Arc;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Reconcile one control plane
pub async fn reconcile_control_plane(cp: Arc<ControlPlane>, ctx: Arc<Context>) -> Result<Action> {
    let ns = cp
        .namespace()
        .ok_or_else(|| Error::InvalidResource("namespace required".to_string()))?;
    let name = cp.name_any();
    let span = info_span!(
        "reconcile",
        kind = "CK8sControlPlane",
        namespace = %ns,
        name = %name,
        trace_id = %Uuid::new_v4()
    );

    async move {
        debug!("Reconciling CK8sControlPlane {}/{}", ns, name);

        let Some(current) = ctx.store.get_control_plane(&ns, &name).await? else {
            debug!("CK8sControlPlane {}/{} is gone, ignoring", ns, name);
            return Ok(Action::await_change());
        };

        let lock = Arc::new(ConfigMapUpgradeLock::new(ctx.store.clone()));
        let mut group = ControlPlaneGroup::new(ctx.store.clone(), current);
        Orchestrator::new(ctx.events.clone(), ctx.timing)
            .with_lock(lock)
            .reconcile(&mut group)
            .await
    }
    .instrument(span)
    .await
}

/// Start the control plane controller
pub async fn run_control_plane_controller(ctx: Arc<Context>) {
    let control_planes: Api<ControlPlane> = Api::all(ctx.client.clone());
    let machines: Api<Machine> = Api::all(ctx.client.clone());

    info!("Starting CK8sControlPlane upgrade controller");

    Controller::new(control_planes, WatcherConfig::default())
        .owns(machines, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile_control_plane, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _action)) => {
                    debug!("Reconciled {:?}", obj);
                }
                Err(e) => {
                    warn!("Reconciliation failed: {:?}", e);
                }
            }
        })
        .await;
}
