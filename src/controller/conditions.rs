//! Status conditions for VpnGw, KeepAlived and IpsecConn

use chrono::Utc;

use crate::crd::Condition;
use crate::error::Error;

pub const CONDITION_TYPE_READY: &str = "Ready";
pub const CONDITION_TYPE_DEGRADED: &str = "Degraded";

pub const CONDITION_STATUS_TRUE: &str = "True";
pub const CONDITION_STATUS_FALSE: &str = "False";

/// Update or add a condition of type `type_`.
///
/// The transition time only moves when the status flips, so re-asserting
/// the same state leaves the list byte-identical.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: &str,
    reason: &str,
    message: &str,
    observed_generation: Option<i64>,
) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == type_) {
        if existing.status != status {
            existing.last_transition_time = Utc::now().to_rfc3339();
        }
        existing.status = status.to_string();
        existing.reason = reason.to_string();
        existing.message = message.to_string();
        existing.observed_generation = observed_generation;
    } else {
        conditions.push(Condition {
            type_: type_.to_string(),
            status: status.to_string(),
            last_transition_time: Utc::now().to_rfc3339(),
            reason: reason.to_string(),
            message: message.to_string(),
            observed_generation,
        });
    }
}

pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_)
        .map(|c| c.status == CONDITION_STATUS_TRUE)
        .unwrap_or(false)
}

/// Ready=True and Degraded=False
pub fn mark_ready(
    conditions: &mut Vec<Condition>,
    reason: &str,
    message: &str,
    observed_generation: Option<i64>,
) {
    set_condition(
        conditions,
        CONDITION_TYPE_READY,
        CONDITION_STATUS_TRUE,
        reason,
        message,
        observed_generation,
    );
    set_condition(
        conditions,
        CONDITION_TYPE_DEGRADED,
        CONDITION_STATUS_FALSE,
        "NoIssues",
        "No degradation detected",
        observed_generation,
    );
}

/// Ready=False, plus Degraded=True when the failure needs an operator edit
pub fn mark_failed(conditions: &mut Vec<Condition>, error: &Error, observed_generation: Option<i64>) {
    let reason = error_reason(error);
    let message = error.to_string();
    set_condition(
        conditions,
        CONDITION_TYPE_READY,
        CONDITION_STATUS_FALSE,
        reason,
        &message,
        observed_generation,
    );
    if !error.is_retriable() {
        set_condition(
            conditions,
            CONDITION_TYPE_DEGRADED,
            CONDITION_STATUS_TRUE,
            reason,
            &message,
            observed_generation,
        );
    }
}

/// Condition reason for an error
pub fn error_reason(error: &Error) -> &'static str {
    match error {
        Error::ValidationError(_) => "ValidationFailed",
        Error::CapacityExhausted(_) => "RouterIdExhausted",
        Error::TransientInfraError(_) => "Progressing",
        Error::OwnershipError(_) => "OwnershipConflict",
        Error::KubeError(_) => "ApiError",
        Error::SerializationError(_) | Error::ConfigError(_) => "InternalError",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_condition_adds_new() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            CONDITION_TYPE_READY,
            CONDITION_STATUS_TRUE,
            "Reconciled",
            "Gateway is serving",
            Some(2),
        );

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].type_, CONDITION_TYPE_READY);
        assert_eq!(conditions[0].observed_generation, Some(2));
    }

    #[test]
    fn test_same_status_keeps_transition_time() {
        let mut conditions = vec![Condition {
            type_: CONDITION_TYPE_READY.to_string(),
            status: CONDITION_STATUS_TRUE.to_string(),
            last_transition_time: "2024-01-01T00:00:00Z".to_string(),
            reason: "Reconciled".to_string(),
            message: "Gateway is serving".to_string(),
            observed_generation: Some(1),
        }];

        mark_ready(&mut conditions, "Reconciled", "Gateway is serving", Some(1));

        assert_eq!(conditions[0].last_transition_time, "2024-01-01T00:00:00Z");
        assert!(!is_condition_true(&conditions, CONDITION_TYPE_DEGRADED));
    }

    #[test]
    fn test_status_flip_moves_transition_time() {
        let mut conditions = vec![Condition::ready(true, "Reconciled", "ok")];
        conditions[0].last_transition_time = "2024-01-01T00:00:00Z".to_string();

        mark_failed(
            &mut conditions,
            &Error::TransientInfraError("replica gw1-1 not running".into()),
            Some(3),
        );

        let ready = find_condition(&conditions, CONDITION_TYPE_READY).unwrap();
        assert_eq!(ready.status, CONDITION_STATUS_FALSE);
        assert_eq!(ready.reason, "Progressing");
        assert_ne!(ready.last_transition_time, "2024-01-01T00:00:00Z");
        // Retryable failures do not degrade
        assert!(find_condition(&conditions, CONDITION_TYPE_DEGRADED).is_none());
    }

    #[test]
    fn test_terminal_failure_degrades() {
        let mut conditions = Vec::new();
        mark_failed(
            &mut conditions,
            &Error::CapacityExhausted("cannot allocate more than 255 ids".into()),
            None,
        );

        assert!(is_condition_true(&conditions, CONDITION_TYPE_DEGRADED));
        assert_eq!(
            find_condition(&conditions, CONDITION_TYPE_DEGRADED).unwrap().reason,
            "RouterIdExhausted"
        );
    }
}
