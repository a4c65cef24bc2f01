//! Condition management helpers following Kubernetes API conventions

use chrono::{DateTime, SecondsFormat, Utc};

use crate::crd::Condition;

/// Condition types reported on a VirtualMachineExport
pub const CONDITION_TYPE_READY: &str = "Ready";
pub const CONDITION_TYPE_PVC_READY: &str = "PVCReady";
pub const CONDITION_TYPE_VOLUMES_CREATED: &str = "VolumesCreated";

/// Standard condition statuses
pub const CONDITION_STATUS_TRUE: &str = "True";
pub const CONDITION_STATUS_FALSE: &str = "False";
pub const CONDITION_STATUS_UNKNOWN: &str = "Unknown";

/// Ready condition reasons
pub const REASON_INITIALIZING: &str = "Initializing";
pub const REASON_IN_USE: &str = "InUse";
pub const REASON_POD_READY: &str = "PodReady";
pub const REASON_POD_PENDING: &str = "PodPending";
pub const REASON_POD_COMPLETED: &str = "PodCompleted";
pub const REASON_UNKNOWN: &str = "Unknown";

/// PVCReady condition reasons
pub const REASON_PVC_BOUND: &str = "PVCBound";
pub const REASON_PVC_PENDING: &str = "PVCPending";
pub const REASON_PVC_NOT_FOUND: &str = "PVCNotFound";

/// VolumesCreated condition reasons
pub const REASON_ALL_PVCS_READY: &str = "AllPVCsReady";
pub const REASON_NOT_ALL_PVCS_CREATED: &str = "NotAllPVCsCreated";

/// RFC 3339 timestamp with second precision, as the API server writes them
pub fn format_time(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Build a condition stamped with `now`
pub fn new_condition(
    type_: &str,
    status: &str,
    reason: &str,
    message: &str,
    now: DateTime<Utc>,
) -> Condition {
    Condition {
        type_: type_.to_string(),
        status: status.to_string(),
        last_transition_time: format_time(now),
        reason: reason.to_string(),
        message: message.to_string(),
    }
}

/// Merge `update` into `conditions`
///
/// An existing condition of the same type is replaced only when its status,
/// reason or message differ; otherwise the stored value, including its
/// transition time, is kept. Returns whether anything changed.
pub fn update_condition(conditions: &mut Vec<Condition>, update: Condition) -> bool {
    match conditions.iter_mut().find(|c| c.type_ == update.type_) {
        Some(existing) => {
            if existing.status == update.status
                && existing.reason == update.reason
                && existing.message == update.message
            {
                return false;
            }
            *existing = update;
            true
        }
        None => {
            conditions.push(update);
            true
        }
    }
}

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Check if a condition is true
pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_)
        .map(|c| c.status == CONDITION_STATUS_TRUE)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_update_condition_adds_new() {
        let mut conditions = Vec::new();
        let changed = update_condition(
            &mut conditions,
            new_condition(
                CONDITION_TYPE_READY,
                CONDITION_STATUS_TRUE,
                REASON_POD_READY,
                "",
                t(0),
            ),
        );

        assert!(changed);
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].type_, CONDITION_TYPE_READY);
        assert_eq!(conditions[0].status, CONDITION_STATUS_TRUE);
    }

    #[test]
    fn test_update_condition_keeps_timestamp_when_unchanged() {
        let mut conditions = vec![new_condition(
            CONDITION_TYPE_READY,
            CONDITION_STATUS_FALSE,
            REASON_IN_USE,
            "pvc default/disk is in use",
            t(0),
        )];

        let changed = update_condition(
            &mut conditions,
            new_condition(
                CONDITION_TYPE_READY,
                CONDITION_STATUS_FALSE,
                REASON_IN_USE,
                "pvc default/disk is in use",
                t(60),
            ),
        );

        assert!(!changed);
        assert_eq!(conditions[0].last_transition_time, format_time(t(0)));
    }

    #[test]
    fn test_update_condition_replaces_on_message_change() {
        let mut conditions = vec![new_condition(
            CONDITION_TYPE_READY,
            CONDITION_STATUS_FALSE,
            REASON_IN_USE,
            "old",
            t(0),
        )];

        let changed = update_condition(
            &mut conditions,
            new_condition(
                CONDITION_TYPE_READY,
                CONDITION_STATUS_FALSE,
                REASON_IN_USE,
                "new",
                t(60),
            ),
        );

        assert!(changed);
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].message, "new");
        assert_eq!(conditions[0].last_transition_time, format_time(t(60)));
    }

    #[test]
    fn test_is_condition_true() {
        let conditions = vec![new_condition(
            CONDITION_TYPE_READY,
            CONDITION_STATUS_TRUE,
            REASON_POD_READY,
            "",
            t(0),
        )];

        assert!(is_condition_true(&conditions, CONDITION_TYPE_READY));
        assert!(!is_condition_true(&conditions, CONDITION_TYPE_PVC_READY));
    }

    #[test]
    fn test_format_time_uses_zulu() {
        assert_eq!(format_time(t(0)), "2023-11-14T22:13:20Z");
    }
}
