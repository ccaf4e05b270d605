//! Machine Upgrade
//!
//! Per-machine state machine driving one node through a refresh on the node agent.

use super::consts::*;
use super::events::{EventRecorder, UpgradeEvent};
use super::mark::{
    clear_stale_progress, mark_attempt_failed, mark_refresh_started, mark_upgrade_done,
    reset_failed_attempt,
};
use super::UpgradeTiming;
use crate::crd::{annotations_of, Annotations, Machine};
use crate::drain::Clock;
use crate::error::Result;
use crate::refresh::{RefreshClient, RefreshOutcome};
use crate::store::ClusterStore;
use chrono::Utc;
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Where a machine stands, read from its annotations alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MachineUpgradeState {
    /// Nothing requested
    Idle,
    /// Target requested, no refresh running
    Requested { target: String },
    /// Refresh running on the node
    InProgress { target: String, change_id: String },
    /// Refresh finished but the done transition was not fully written
    Succeeded { target: String },
    /// Last attempt failed, waiting for a retry
    Failed { target: String },
    /// Status value this operator does not know
    Unknown { target: String, status: String },
}

impl MachineUpgradeState {
    pub fn from_annotations(annotations: &Annotations) -> Self {
        // An empty target counts as no request.
        let Some(target) = annotations
            .get(UPGRADE_TO)
            .filter(|t| !t.is_empty())
            .cloned()
        else {
            return Self::Idle;
        };
        let status = annotations.get(UPGRADE_STATUS);
        let change_id = annotations.get(UPGRADE_CHANGE_ID);

        match (status, change_id) {
            (Some(status), Some(change_id)) => match status.as_str() {
                STATUS_IN_PROGRESS => Self::InProgress {
                    target,
                    change_id: change_id.clone(),
                },
                STATUS_DONE => Self::Succeeded { target },
                STATUS_FAILED => Self::Failed { target },
                other => Self::Unknown {
                    target,
                    status: other.to_string(),
                },
            },
            _ => Self::Requested { target },
        }
    }
}

pub struct MachineUpgrader {
    store: Arc<dyn ClusterStore>,
    refresh: Arc<dyn RefreshClient>,
    events: Arc<dyn EventRecorder>,
    timing: UpgradeTiming,
    now: Clock,
}

impl MachineUpgrader {
    pub fn new(
        store: Arc<dyn ClusterStore>,
        refresh: Arc<dyn RefreshClient>,
        events: Arc<dyn EventRecorder>,
        timing: UpgradeTiming,
    ) -> Self {
        Self {
            store,
            refresh,
            events,
            timing,
            now: Arc::new(Utc::now),
        }
    }

    pub fn with_clock(mut self, now: Clock) -> Self {
        self.now = now;
        self
    }

    /// Advance `machine` by one step.
    ///
    /// Refresh client failures come back as errors so the controller retries;
    /// they never mark the machine failed.
    pub async fn reconcile(&self, machine: &Machine) -> Result<Action> {
        let annotations = annotations_of(machine);
        let state = MachineUpgradeState::from_annotations(&annotations);
        let name = machine.name_any();
        debug!(machine = %name, ?state, "Evaluated machine upgrade state");

        match state {
            MachineUpgradeState::Idle => Ok(Action::await_change()),
            MachineUpgradeState::Requested { target } => {
                self.start(machine, annotations, &target).await
            }
            MachineUpgradeState::InProgress { target, change_id } => {
                let status = self.refresh.refresh_status(machine, &change_id).await?;
                match status.outcome() {
                    RefreshOutcome::Pending => {
                        debug!(machine = %name, change_id = %change_id, "Refresh still running");
                        Ok(Action::requeue(self.timing.requeue_after))
                    }
                    RefreshOutcome::Succeeded => self.finish(machine, annotations, &target).await,
                    RefreshOutcome::Failed => {
                        warn!(
                            machine = %name,
                            status = %status.status,
                            "In-place upgrade failed: {}",
                            status.error_message
                        );
                        self.fail(machine, annotations, &target, &status.error_message)
                            .await
                    }
                }
            }
            MachineUpgradeState::Succeeded { target } => {
                self.finish(machine, annotations, &target).await
            }
            MachineUpgradeState::Failed { target } => {
                let mut annotations = annotations;
                reset_failed_attempt(&mut annotations);
                let machine = self.store.patch_machine(machine, &annotations).await?;
                info!(machine = %name, target = %target, "Retrying failed in-place upgrade");
                self.publish(
                    &machine,
                    UpgradeEvent::normal(
                        REASON_RETRYING,
                        format!("Retrying in place upgrade with {}", target),
                    ),
                )
                .await;
                Ok(Action::requeue(self.timing.failed_retry))
            }
            MachineUpgradeState::Unknown { target, status } => {
                warn!(
                    machine = %name,
                    status = %status,
                    "Unknown upgrade status, marking as failed"
                );
                self.fail(machine, annotations, &target, "").await
            }
        }
    }

    async fn start(
        &self,
        machine: &Machine,
        mut annotations: Annotations,
        target: &str,
    ) -> Result<Action> {
        clear_stale_progress(&mut annotations);
        let machine = self.store.patch_machine(machine, &annotations).await?;

        let change_id = self.refresh.start_refresh(&machine, target).await?;

        mark_refresh_started(&mut annotations, &change_id);
        let machine = self.store.patch_machine(&machine, &annotations).await?;
        info!(
            machine = %machine.name_any(),
            target = %target,
            change_id = %change_id,
            "Started in-place upgrade"
        );
        self.publish(
            &machine,
            UpgradeEvent::normal(
                REASON_IN_PROGRESS,
                format!("Performing in place upgrade with {}", target),
            ),
        )
        .await;
        Ok(Action::requeue(self.timing.requeue_after))
    }

    async fn finish(
        &self,
        machine: &Machine,
        mut annotations: Annotations,
        target: &str,
    ) -> Result<Action> {
        mark_upgrade_done(&mut annotations, target);
        let machine = self.store.patch_machine(machine, &annotations).await?;
        info!(machine = %machine.name_any(), target = %target, "In-place upgrade completed");
        self.publish(
            &machine,
            UpgradeEvent::normal(
                REASON_DONE,
                format!("Successfully performed in place upgrade with {}", target),
            ),
        )
        .await;
        Ok(Action::await_change())
    }

    async fn fail(
        &self,
        machine: &Machine,
        mut annotations: Annotations,
        target: &str,
        message: &str,
    ) -> Result<Action> {
        mark_attempt_failed(&mut annotations, (self.now)());
        let machine = self.store.patch_machine(machine, &annotations).await?;

        let mut note = format!("Failed to perform in place upgrade with option {}", target);
        if !message.is_empty() {
            note = format!("{}: {}", note, message);
        }
        self.publish(&machine, UpgradeEvent::warning(REASON_FAILED, note))
            .await;
        Ok(Action::requeue(self.timing.failed_retry))
    }

    async fn publish(&self, machine: &Machine, event: UpgradeEvent) {
        self.events.publish(&machine.object_ref(&()), event).await;
    }
}
