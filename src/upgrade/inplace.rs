//! Read-only predicates over in-place upgrade annotations.

use super::consts::*;
use crate::crd::Annotations;

/// Whether the object already runs `target`.
pub fn is_upgraded(annotations: &Annotations, target: &str) -> bool {
    annotations.get(UPGRADE_RELEASE).map(String::as_str) == Some(target)
}

/// Pending target if one is requested, otherwise the last applied release.
///
/// An empty pending target counts as no request. Returns an empty string when
/// neither is set.
pub fn get_upgrade_instructions(annotations: &Annotations) -> String {
    annotations
        .get(UPGRADE_TO)
        .filter(|v| !v.is_empty())
        .or_else(|| annotations.get(UPGRADE_RELEASE))
        .cloned()
        .unwrap_or_default()
}

/// A machine has failed once it carries a failure timestamp.
pub fn is_machine_upgrade_failed(annotations: &Annotations) -> bool {
    annotations
        .get(UPGRADE_LAST_FAILED_ATTEMPT_AT)
        .is_some_and(|v| !v.is_empty())
}

/// Upgrade in flight, or requested and not yet picked up.
pub fn is_machine_upgrading(annotations: &Annotations) -> bool {
    annotations.get(UPGRADE_STATUS).map(String::as_str) == Some(STATUS_IN_PROGRESS)
        || annotations.get(UPGRADE_TO).is_some_and(|v| !v.is_empty())
}

/// Refresh handed to the node agent and not yet finished.
pub fn is_mid_refresh(annotations: &Annotations) -> bool {
    annotations.get(UPGRADE_STATUS).map(String::as_str) == Some(STATUS_IN_PROGRESS)
        && annotations.contains_key(UPGRADE_CHANGE_ID)
}
