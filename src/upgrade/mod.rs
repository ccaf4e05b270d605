//! In-place upgrade coordination
//!
//! Annotation-driven state machines that move machines to a new node-software
//! release one at a time. All state lives in object annotations and the lock
//! record, so every step can be re-derived after a restart.

pub mod consts;
pub mod events;
pub mod group;
pub mod inplace;
pub mod lock;
pub mod machine;
pub mod mark;
pub mod orchestrator;

pub use events::{EventRecorder, EventType, KubeEventRecorder, UpgradeEvent};
pub use group::{ControlPlaneGroup, MachineDeploymentGroup, UpgradeGroup};
pub use inplace::{
    get_upgrade_instructions, is_machine_upgrade_failed, is_machine_upgrading, is_mid_refresh,
    is_upgraded,
};
pub use lock::{ConfigMapUpgradeLock, LockInformation, UpgradeLock};
pub use machine::{MachineUpgradeState, MachineUpgrader};
pub use orchestrator::Orchestrator;

use crate::config::ControllerSettings;
use std::time::Duration;

/// Requeue delays used by the state machines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpgradeTiming {
    /// Wait between polls while something is in flight
    pub requeue_after: Duration,
    /// Wait before retrying a failed machine
    pub failed_retry: Duration,
}

impl Default for UpgradeTiming {
    fn default() -> Self {
        Self {
            requeue_after: Duration::from_secs(5),
            failed_retry: Duration::from_secs(3),
        }
    }
}

impl From<&ControllerSettings> for UpgradeTiming {
    fn from(settings: &ControllerSettings) -> Self {
        Self {
            requeue_after: settings.requeue_after(),
            failed_retry: settings.failed_retry(),
        }
    }
}
