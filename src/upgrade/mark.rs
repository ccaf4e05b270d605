//! Annotation mutators for machines and groups.
//!
//! Each function rewrites an annotation map in place; callers persist the
//! result with an optimistic-lock patch. Keys that are removed here are sent
//! as `null` in the merge patch.

use super::consts::*;
use crate::crd::Annotations;
use chrono::{DateTime, TimeZone};

/// Request `target` on a machine, dropping every trace of earlier attempts.
pub fn mark_machine_to_upgrade(annotations: &mut Annotations, target: &str) {
    annotations.remove(UPGRADE_RELEASE);
    annotations.remove(UPGRADE_STATUS);
    annotations.remove(UPGRADE_CHANGE_ID);
    annotations.remove(UPGRADE_LAST_FAILED_ATTEMPT_AT);
    annotations.insert(UPGRADE_TO.to_string(), target.to_string());
}

/// Mark a group as rolling out `target`.
pub fn mark_upgrade_in_progress(annotations: &mut Annotations, target: &str) {
    annotations.remove(UPGRADE_RELEASE);
    annotations.insert(UPGRADE_STATUS.to_string(), STATUS_IN_PROGRESS.to_string());
    annotations.insert(UPGRADE_TO.to_string(), target.to_string());
}

/// Record `target` as applied. Used for machines and groups alike.
pub fn mark_upgrade_done(annotations: &mut Annotations, target: &str) {
    annotations.remove(UPGRADE_TO);
    annotations.remove(UPGRADE_CHANGE_ID);
    annotations.remove(UPGRADE_LAST_FAILED_ATTEMPT_AT);
    annotations.insert(UPGRADE_STATUS.to_string(), STATUS_DONE.to_string());
    annotations.insert(UPGRADE_RELEASE.to_string(), target.to_string());
}

/// Mark a group as failed. The pending target stays so the failure is attributable.
pub fn mark_upgrade_failed(annotations: &mut Annotations) {
    annotations.remove(UPGRADE_RELEASE);
    annotations.insert(UPGRADE_STATUS.to_string(), STATUS_FAILED.to_string());
}

/// Drop progress left by an earlier attempt before starting a new one.
///
/// The failure timestamp survives so retries stay distinguishable from first attempts.
pub fn clear_stale_progress(annotations: &mut Annotations) {
    annotations.remove(UPGRADE_STATUS);
    annotations.remove(UPGRADE_CHANGE_ID);
    annotations.remove(UPGRADE_RELEASE);
}

pub fn mark_refresh_started(annotations: &mut Annotations, change_id: &str) {
    annotations.insert(UPGRADE_STATUS.to_string(), STATUS_IN_PROGRESS.to_string());
    annotations.insert(UPGRADE_CHANGE_ID.to_string(), change_id.to_string());
}

/// Record a failed attempt at `now`, keeping `upgrade-to` for the retry.
pub fn mark_attempt_failed<Tz>(annotations: &mut Annotations, now: DateTime<Tz>)
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    annotations.insert(UPGRADE_STATUS.to_string(), STATUS_FAILED.to_string());
    annotations.insert(
        UPGRADE_LAST_FAILED_ATTEMPT_AT.to_string(),
        now.to_rfc2822(),
    );
}

/// Put a failed machine back into the requested state.
pub fn reset_failed_attempt(annotations: &mut Annotations) {
    annotations.remove(UPGRADE_STATUS);
    annotations.remove(UPGRADE_CHANGE_ID);
}

/// Withdraw a pending instruction. Returns whether anything was removed.
pub fn cancel_upgrade(annotations: &mut Annotations) -> bool {
    annotations.remove(UPGRADE_TO).is_some()
}
