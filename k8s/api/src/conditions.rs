use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};

/// Builds a condition with the transition time set to now.
pub fn new_condition(type_: &str, status: bool, reason: &str, message: &str) -> Condition {
    Condition {
        type_: type_.to_string(),
        status: if status { "True" } else { "False" }.to_string(),
        reason: reason.to_string(),
        message: message.to_string(),
        last_transition_time: Time(Utc::now()),
        observed_generation: None,
    }
}

/// Index-or-append by condition type. An existing condition is only replaced
/// when its status changed, preserving the original transition time across
/// no-op reconciles.
pub fn upsert(conditions: &mut Vec<Condition>, condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.status != condition.status {
                *existing = condition;
            }
        }
        None => conditions.push(condition),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_appends_new_types() {
        let mut conditions = Vec::new();
        upsert(&mut conditions, new_condition("JobCreated", true, "Running", ""));
        upsert(&mut conditions, new_condition("ScanCompleted", true, "Completed", ""));
        assert_eq!(conditions.len(), 2);
    }

    #[test]
    fn upsert_replaces_on_status_change() {
        let mut conditions = vec![new_condition("ScanCompleted", false, "Running", "")];
        upsert(
            &mut conditions,
            new_condition("ScanCompleted", true, "Completed", "done"),
        );
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].status, "True");
        assert_eq!(conditions[0].message, "done");
    }

    #[test]
    fn upsert_keeps_existing_when_status_unchanged() {
        let mut conditions = vec![new_condition("ScanCompleted", true, "Completed", "first")];
        upsert(
            &mut conditions,
            new_condition("ScanCompleted", true, "Completed", "second"),
        );
        assert_eq!(conditions[0].message, "first");
    }
}
