//! Annotation keys, status values and event reasons shared by machines and groups.

/// Requested upgrade target
pub const UPGRADE_TO: &str = "v1beta2.k8sd.io/in-place-upgrade-to";

/// Progress of the current attempt
pub const UPGRADE_STATUS: &str = "v1beta2.k8sd.io/in-place-upgrade-status";

/// Last successfully applied target
pub const UPGRADE_RELEASE: &str = "v1beta2.k8sd.io/in-place-upgrade-release";

/// Handle of the running refresh on the node
pub const UPGRADE_CHANGE_ID: &str = "v1beta2.k8sd.io/in-place-upgrade-change-id";

/// RFC 2822 time of the most recent failed attempt
pub const UPGRADE_LAST_FAILED_ATTEMPT_AT: &str =
    "v1beta2.k8sd.io/in-place-upgrade-last-failed-attempt-at";

pub const STATUS_IN_PROGRESS: &str = "in-progress";
pub const STATUS_DONE: &str = "done";
pub const STATUS_FAILED: &str = "failed";

pub const REASON_IN_PROGRESS: &str = "InPlaceUpgradeInProgress";
pub const REASON_DONE: &str = "InPlaceUpgradeDone";
pub const REASON_FAILED: &str = "InPlaceUpgradeFailed";
pub const REASON_CANCELED: &str = "InPlaceUpgradeCanceled";
pub const REASON_RETRYING: &str = "InPlaceUpgradeRetrying";
pub const REASON_LOCK_RELEASED: &str = "InPlaceUpgradeLockReleased";
