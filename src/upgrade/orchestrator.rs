//! Upgrade Orchestrator
//!
//! Rolls a group's requested release across its members, one machine per pass.
//! With a lock configured, the lock record names the machine being upgraded and
//! nothing else in the cluster may start until it is released.

use super::consts::*;
use super::events::{EventRecorder, UpgradeEvent};
use super::group::UpgradeGroup;
use super::inplace::{
    get_upgrade_instructions, is_machine_upgrade_failed, is_machine_upgrading, is_mid_refresh,
    is_upgraded,
};
use super::lock::UpgradeLock;
use super::mark::{
    cancel_upgrade, mark_machine_to_upgrade, mark_upgrade_done, mark_upgrade_failed,
    mark_upgrade_in_progress,
};
use super::UpgradeTiming;
use crate::crd::{annotations_of, is_deleting, Cluster, Machine};
use crate::error::{Error, Result};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct Orchestrator {
    lock: Option<Arc<dyn UpgradeLock>>,
    events: Arc<dyn EventRecorder>,
    timing: UpgradeTiming,
}

impl Orchestrator {
    /// Orchestrator that relies on member order alone.
    pub fn new(events: Arc<dyn EventRecorder>, timing: UpgradeTiming) -> Self {
        Self {
            lock: None,
            events,
            timing,
        }
    }

    /// Serialize upgrades through `lock` as well.
    pub fn with_lock(mut self, lock: Arc<dyn UpgradeLock>) -> Self {
        self.lock = Some(lock);
        self
    }

    fn requeue(&self) -> Action {
        Action::requeue(self.timing.requeue_after)
    }

    pub async fn reconcile(&self, group: &mut dyn UpgradeGroup) -> Result<Action> {
        let target = get_upgrade_instructions(&group.annotations());
        if target.is_empty() {
            if group.cancels_withdrawn_instructions() {
                self.cancel_members(group).await?;
            }
            debug!(group = %group.name(), "No upgrade instructions");
            return Ok(Action::await_change());
        }

        if group.is_deleting() {
            debug!(group = %group.name(), "Group is being deleted, skipping");
            return Ok(Action::await_change());
        }

        if !group.members_ready() {
            debug!(group = %group.name(), "Members are not ready, requeuing");
            return Ok(self.requeue());
        }

        let cluster = match &self.lock {
            Some(lock) => {
                let Some(cluster) = group.cluster().await? else {
                    debug!(group = %group.name(), "Group has no owning cluster yet, requeuing");
                    return Ok(self.requeue());
                };
                if let Some(holder) = lock.is_locked(&cluster).await? {
                    return self
                        .check_lock_holder(group, lock.as_ref(), &cluster, &holder, &target)
                        .await;
                }
                Some(cluster)
            }
            None => None,
        };

        let members = group.list_members().await?;
        let mut upgraded = 0;
        for member in &members {
            let annotations = annotations_of(member);
            let name = member.name_any();

            if is_upgraded(&annotations, &target) {
                debug!(group = %group.name(), machine = %name, "Machine is already upgraded");
                upgraded += 1;
                continue;
            }

            if is_deleting(&member.metadata) {
                debug!(
                    group = %group.name(),
                    machine = %name,
                    "Machine is being deleted, requeuing"
                );
                return Ok(self.requeue());
            }

            if is_machine_upgrade_failed(&annotations) {
                warn!(group = %group.name(), machine = %name, "Machine upgrade failed");
                self.mark_failed(group, &name).await?;
                return Ok(self.requeue());
            }

            if is_machine_upgrading(&annotations) {
                debug!(group = %group.name(), machine = %name, "Machine is upgrading, requeuing");
                return Ok(self.requeue());
            }

            if let (Some(lock), Some(cluster)) = (&self.lock, &cluster) {
                match lock.lock(cluster, member).await {
                    Ok(()) => {}
                    Err(Error::LockHeld(_)) => {
                        debug!(group = %group.name(), "Upgrade lock taken concurrently, requeuing");
                        return Ok(self.requeue());
                    }
                    Err(e) => return Err(e),
                }
            }

            self.start_member(group, member, &target).await?;
            return Ok(self.requeue());
        }

        if upgraded == members.len() {
            self.mark_done(group, &target).await?;
            return Ok(Action::await_change());
        }

        Ok(self.requeue())
    }

    async fn check_lock_holder(
        &self,
        group: &mut dyn UpgradeGroup,
        lock: &dyn UpgradeLock,
        cluster: &Cluster,
        holder: &Machine,
        target: &str,
    ) -> Result<Action> {
        let annotations = annotations_of(holder);
        let name = holder.name_any();

        if get_upgrade_instructions(&annotations) != target {
            info!(
                cluster = %cluster.name_any(),
                machine = %name,
                "Lock holder does not carry the requested upgrade, unlocking"
            );
            let note = format!(
                "Released upgrade lock held by {:?}, which is not upgrading to {:?}",
                name, target
            );
            return self.release_lock(group, lock, cluster, note).await;
        }

        if is_upgraded(&annotations, target) {
            info!(
                cluster = %cluster.name_any(),
                machine = %name,
                "Lock holder upgraded, unlocking"
            );
            let note = format!("Released upgrade lock held by upgraded machine {:?}", name);
            return self.release_lock(group, lock, cluster, note).await;
        }

        if is_machine_upgrade_failed(&annotations) {
            warn!(cluster = %cluster.name_any(), machine = %name, "Lock holder upgrade failed");
            self.mark_failed(group, &name).await?;
            return Ok(self.requeue());
        }

        debug!(cluster = %cluster.name_any(), machine = %name, "Machine is upgrading, requeuing");
        Ok(self.requeue())
    }

    async fn release_lock(
        &self,
        group: &dyn UpgradeGroup,
        lock: &dyn UpgradeLock,
        cluster: &Cluster,
        note: String,
    ) -> Result<Action> {
        lock.unlock(cluster).await?;
        self.events
            .publish(
                &group.object_ref(),
                UpgradeEvent::normal(REASON_LOCK_RELEASED, note),
            )
            .await;
        Ok(Action::requeue(Duration::ZERO))
    }

    async fn start_member(
        &self,
        group: &mut dyn UpgradeGroup,
        member: &Machine,
        target: &str,
    ) -> Result<()> {
        let name = member.name_any();

        let mut annotations = annotations_of(member);
        mark_machine_to_upgrade(&mut annotations, target);
        group.patch_member(member, &annotations).await?;
        info!(
            group = %group.name(),
            machine = %name,
            target = %target,
            "Machine marked for upgrade"
        );
        self.events
            .publish(
                &group.object_ref(),
                UpgradeEvent::normal(
                    REASON_IN_PROGRESS,
                    format!("Machine {:?} is upgrading to {:?}", name, target),
                ),
            )
            .await;

        let mut annotations = group.annotations();
        mark_upgrade_in_progress(&mut annotations, target);
        group.patch_self(&annotations).await?;
        self.events
            .publish(
                &group.object_ref(),
                UpgradeEvent::normal(
                    REASON_IN_PROGRESS,
                    format!("In-place upgrade is in-progress for {:?}", name),
                ),
            )
            .await;
        Ok(())
    }

    async fn mark_failed(&self, group: &mut dyn UpgradeGroup, machine: &str) -> Result<()> {
        let mut annotations = group.annotations();
        if annotations.get(UPGRADE_STATUS).map(String::as_str) == Some(STATUS_FAILED) {
            return Ok(());
        }
        mark_upgrade_failed(&mut annotations);
        group.patch_self(&annotations).await?;
        self.events
            .publish(
                &group.object_ref(),
                UpgradeEvent::warning(
                    REASON_FAILED,
                    format!("In-place upgrade failed for machine {:?}.", machine),
                ),
            )
            .await;
        Ok(())
    }

    async fn mark_done(&self, group: &mut dyn UpgradeGroup, target: &str) -> Result<()> {
        let mut annotations = group.annotations();
        let before = annotations.clone();
        mark_upgrade_done(&mut annotations, target);
        if annotations == before {
            return Ok(());
        }
        group.patch_self(&annotations).await?;
        info!(group = %group.name(), target = %target, "All machines are upgraded");
        self.events
            .publish(
                &group.object_ref(),
                UpgradeEvent::normal(REASON_DONE, "In-place upgrade is done"),
            )
            .await;
        Ok(())
    }

    /// Withdraw member targets that never made it to the node agent.
    async fn cancel_members(&self, group: &dyn UpgradeGroup) -> Result<()> {
        let members = match group.list_members().await {
            Ok(members) => members,
            Err(Error::NotFound(what)) => {
                debug!(group = %group.name(), "Nothing to cancel: {}", what);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        for member in &members {
            let mut annotations = annotations_of(member);
            if is_mid_refresh(&annotations) || !cancel_upgrade(&mut annotations) {
                continue;
            }
            group.patch_member(member, &annotations).await?;
            let name = member.name_any();
            info!(group = %group.name(), machine = %name, "Canceled pending upgrade");
            self.events
                .publish(
                    &group.object_ref(),
                    UpgradeEvent::normal(
                        REASON_CANCELED,
                        format!("In-place upgrade of machine {:?} canceled", name),
                    ),
                )
                .await;
        }
        Ok(())
    }
}
