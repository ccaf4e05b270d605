//! Node refresh service
//!
//! The per-machine state machine hands the requested target to the node agent
//! and later polls it with the returned change id. `RefreshClient` is that
//! seam; `K8sdRefreshClient` is the implementation talking to k8sd over HTTPS.

mod k8sd;

pub use k8sd::K8sdRefreshClient;

use crate::crd::Machine;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Status value the node agent reports for a successful refresh
pub const REFRESH_STATUS_DONE: &str = "Done";

/// Status value the node agent reports for a failed refresh
pub const REFRESH_STATUS_ERROR: &str = "Error";

#[async_trait]
pub trait RefreshClient: Send + Sync {
    /// Ask the machine's node agent to move to `target`. Returns the change id.
    async fn start_refresh(&self, machine: &Machine, target: &str) -> Result<String>;

    /// Poll a refresh previously started on the machine.
    async fn refresh_status(&self, machine: &Machine, change_id: &str) -> Result<RefreshStatus>;
}

/// Reported state of a refresh.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshStatus {
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub error_message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Pending,
    Succeeded,
    /// Reported error, or a status value nobody recognizes
    Failed,
}

impl RefreshStatus {
    pub fn outcome(&self) -> RefreshOutcome {
        if !self.completed {
            return RefreshOutcome::Pending;
        }
        match self.status.as_str() {
            REFRESH_STATUS_DONE => RefreshOutcome::Succeeded,
            _ => RefreshOutcome::Failed,
        }
    }
}

/// Where the node agent should take its new software from.
///
/// Written as `channel=<name>`, `revision=<rev>` or `localPath=<path>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeOption {
    Channel(String),
    Revision(String),
    LocalPath(String),
}

impl FromStr for UpgradeOption {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('=').collect();
        let [key, value] = parts.as_slice() else {
            return Err(Error::InvalidUpgradeOption(s.to_string()));
        };
        let value = value.to_string();
        match *key {
            "channel" => Ok(UpgradeOption::Channel(value)),
            "revision" => Ok(UpgradeOption::Revision(value)),
            "localPath" => Ok(UpgradeOption::LocalPath(value)),
            _ => Err(Error::InvalidUpgradeOption(s.to_string())),
        }
    }
}

impl fmt::Display for UpgradeOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpgradeOption::Channel(v) => write!(f, "channel={}", v),
            UpgradeOption::Revision(v) => write!(f, "revision={}", v),
            UpgradeOption::LocalPath(v) => write!(f, "localPath={}", v),
        }
    }
}
