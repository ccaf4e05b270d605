//! Machine Controller
//!
//! Runs the per-machine upgrade state machine for every Machine.

use super::types::{error_policy, Context};
use crate::crd::Machine;
use crate::error::{Error, Result};
use crate::upgrade::MachineUpgrader;
use futures::StreamExt;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Api, ResourceExt};
use std::sync::Arc;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Reconcile one Machine
pub async fn reconcile_machine(machine: Arc<Machine>, ctx: Arc<Context>) -> Result<Action> {
    let ns = machine
        .namespace()
        .ok_or_else(|| Error::InvalidResource("namespace required".to_string()))?;
    let name = machine.name_any();
    let span = info_span!(
        "reconcile",
        kind = "Machine",
        namespace = %ns,
        machine = %name,
        trace_id = %Uuid::new_v4()
    );

    async move {
        debug!("Reconciling Machine {}/{}", ns, name);

        let Some(current) = ctx.store.get_machine(&ns, &name).await? else {
            debug!("Machine {}/{} is gone, ignoring", ns, name);
            return Ok(Action::await_change());
        };

        let upgrader = MachineUpgrader::new(
            ctx.store.clone(),
            ctx.refresh.clone(),
            ctx.events.clone(),
            ctx.timing,
        );
        upgrader.reconcile(&current).await
    }
    .instrument(span)
    .await
}

/// Start the Machine controller
pub async fn run_machine_controller(ctx: Arc<Context>) {
    let machines: Api<Machine> = Api::all(ctx.client.clone());

    info!("Starting Machine upgrade controller");

    Controller::new(machines, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile_machine, error_policy, ctx)
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
