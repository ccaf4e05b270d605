//! MachineDeployment Controller
//!
//! Orchestrates in-place upgrades across the worker machines of a deployment.

use super::types::{error_policy, Context};
use crate::crd::{Machine, MachineDeployment, DEPLOYMENT_NAME_LABEL};
use crate::error::{Error, Result};
use crate::upgrade::{MachineDeploymentGroup, Orchestrator};
use futures::StreamExt;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Api, ResourceExt};
use std::sync::Arc;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Reconcile one MachineDeployment
pub async fn reconcile_machine_deployment(
    md: Arc<MachineDeployment>,
    ctx: Arc<Context>,
) -> Result<Action> {
    let ns = md
        .namespace()
        .ok_or_else(|| Error::InvalidResource("namespace required".to_string()))?;
    let name = md.name_any();
    let span = info_span!(
        "reconcile",
        kind = "MachineDeployment",
        namespace = %ns,
        name = %name,
        trace_id = %Uuid::new_v4()
    );

    async move {
        debug!("Reconciling MachineDeployment {}/{}", ns, name);

        let Some(current) = ctx.store.get_machine_deployment(&ns, &name).await? else {
            debug!("MachineDeployment {}/{} is gone, ignoring", ns, name);
            return Ok(Action::await_change());
        };

        let mut group = MachineDeploymentGroup::new(ctx.store.clone(), current);
        Orchestrator::new(ctx.events.clone(), ctx.timing)
            .reconcile(&mut group)
            .await
    }
    .instrument(span)
    .await
}

/// Deployment a machine belongs to, read from its deployment-name label.
pub fn deployment_for_machine(machine: Machine) -> Option<ObjectRef<MachineDeployment>> {
    let namespace = machine.namespace()?;
    let name = machine.labels().get(DEPLOYMENT_NAME_LABEL)?;
    Some(ObjectRef::new(name).within(&namespace))
}

/// Start the MachineDeployment controller
pub async fn run_machine_deployment_controller(ctx: Arc<Context>) {
    let deployments: Api<MachineDeployment> = Api::all(ctx.client.clone());
    let machines: Api<Machine> = Api::all(ctx.client.clone());

    info!("Starting MachineDeployment upgrade controller");

    Controller::new(deployments, WatcherConfig::default())
        .watches(machines, WatcherConfig::default(), deployment_for_machine)
        .shutdown_on_signal()
        .run(reconcile_machine_deployment, error_policy, ctx)
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
