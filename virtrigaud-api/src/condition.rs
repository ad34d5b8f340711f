//! Typed status conditions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Condition status values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl Default for ConditionStatus {
    fn default() -> Self {
        Self::Unknown
    }
}

/// A typed status tuple summarizing one aspect of health.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type, e.g. "Ready" or "Available"
    pub r#type: String,
    pub status: ConditionStatus,
    /// Machine-readable cause, e.g. "ProviderUnavailable"
    pub reason: String,
    /// Human-readable detail
    pub message: String,
    /// Generation the condition was computed against
    pub observed_generation: i64,
    /// When `status` last changed
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    pub fn new(
        r#type: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
        observed_generation: i64,
    ) -> Self {
        Self {
            r#type: r#type.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            observed_generation,
            last_transition_time: Utc::now(),
        }
    }
}

/// Merge a condition into the list.
///
/// `last_transition_time` is retained from the existing condition unless the
/// status changed. Returns true when the stored condition differs from what
/// was already present.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition) -> bool {
    match conditions.iter_mut().find(|c| c.r#type == condition.r#type) {
        Some(existing) => {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time;
            }
            if *existing == condition {
                return false;
            }
            *existing = condition;
            true
        }
        None => {
            conditions.push(condition);
            true
        }
    }
}

/// Find a condition by type.
pub fn find_condition<'a>(conditions: &'a [Condition], r#type: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.r#type == r#type)
}

/// Whether the condition of the given type is present and True.
///
/// This is the readiness check: callers must never compare phase strings.
pub fn is_condition_true(conditions: &[Condition], r#type: &str) -> bool {
    matches!(
        find_condition(conditions, r#type),
        Some(c) if c.status == ConditionStatus::True
    )
}

/// Well-known condition types.
pub mod types {
    pub const READY: &str = "Ready";
    pub const AVAILABLE: &str = "Available";
    pub const CAPABILITY: &str = "CapabilitySatisfied";
}

/// Well-known condition reasons.
pub mod reasons {
    pub const PROVIDER_UNAVAILABLE: &str = "ProviderUnavailable";
    pub const INVALID_SPEC: &str = "InvalidSpec";
    pub const TASK_FAILED: &str = "TaskFailed";
    pub const PROVISIONING: &str = "Provisioning";
    pub const RECONFIGURING: &str = "Reconfiguring";
    pub const POWER_PENDING: &str = "PowerStatePending";
    pub const SYNCED: &str = "Synced";
    pub const DELETING: &str = "Deleting";
    pub const NOT_SUPPORTED: &str = "NotSupported";
    pub const VALIDATE_FAILED: &str = "ValidateFailed";
    pub const WORKLOAD_PENDING: &str = "WorkloadPending";
    pub const MIGRATION_FAILED: &str = "MigrationFailed";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_condition_keeps_transition_time_on_same_status() {
        let mut conditions = Vec::new();
        let first = Condition::new("Ready", ConditionStatus::False, "Provisioning", "creating", 1);
        set_condition(&mut conditions, first.clone());
        let t0 = conditions[0].last_transition_time;

        // Same status, new reason: transition time must be retained.
        let update = Condition::new("Ready", ConditionStatus::False, "TaskFailed", "task err", 2);
        assert!(set_condition(&mut conditions, update));
        assert_eq!(conditions[0].last_transition_time, t0);
        assert_eq!(conditions[0].reason, "TaskFailed");

        // Status flip: transition time moves.
        let flip = Condition::new("Ready", ConditionStatus::True, "Synced", "", 2);
        assert!(set_condition(&mut conditions, flip));
        assert!(conditions[0].last_transition_time >= t0);
        assert_eq!(conditions[0].status, ConditionStatus::True);
    }

    #[test]
    fn test_set_condition_no_change_returns_false() {
        let mut conditions = Vec::new();
        let c = Condition::new("Ready", ConditionStatus::True, "Synced", "", 3);
        assert!(set_condition(&mut conditions, c.clone()));
        // Identical payload (modulo transition time, which is retained).
        let again = Condition::new("Ready", ConditionStatus::True, "Synced", "", 3);
        assert!(!set_condition(&mut conditions, again));
    }

    #[test]
    fn test_is_condition_true() {
        let mut conditions = Vec::new();
        assert!(!is_condition_true(&conditions, types::READY));
        set_condition(
            &mut conditions,
            Condition::new(types::READY, ConditionStatus::True, "Synced", "", 1),
        );
        assert!(is_condition_true(&conditions, types::READY));
        assert!(!is_condition_true(&conditions, types::AVAILABLE));
    }
}
