//! # inplace-operator
//!
//! Kubernetes operator that upgrades cluster machines in place, one machine at a
//! time, and drains nodes safely.
//!
//! The upgrade logic is annotation driven: a group object (a machine deployment
//! or a control plane) asks for a release, the orchestrator hands it to one member
//! machine at a time, and the per-machine state machine performs the refresh
//! through the node agent. A ConfigMap lock serializes control-plane upgrades.

pub mod config;
pub mod crd;
pub mod drain;
pub mod error;
pub mod logging;
pub mod operator;
pub mod refresh;
pub mod store;
pub mod upgrade;

#[cfg(test)]
pub(crate) mod testing;

pub use drain::{DrainOptions, Drainer};
pub use error::{DrainError, Error, Result};
pub use upgrade::{MachineUpgrader, Orchestrator};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = Error::LockHeld("c1".to_string());
        assert!(err.to_string().contains("c1"));
    }
}
