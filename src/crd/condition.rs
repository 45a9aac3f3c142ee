//! Status conditions and the event-reason vocabulary shared by the pool and
//! replica resources.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition type tracking the lifecycle of the resource
pub const CONDITION_READY: &str = "Ready";

/// Condition type tracking the last status sync
pub const CONDITION_SYNCED: &str = "Synced";

/// Condition type set while the capacity threshold holds the pool read-only
pub const CONDITION_READ_ONLY_THRESHOLD: &str = "ReadOnlyThreshold";

// =============================================================================
// Event Reasons
// =============================================================================

/// Machine-readable reason written alongside every condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventReason {
    Synced,
    FailedSync,
    Created,
    FailCreate,
    Imported,
    FailImport,
    AlreadyPresent,
    FailValidate,
    FailDestroy,
    FailRemoveFinalizer,
    FailStatusSync,
    FailCapacitySync,
    PoolReadOnlyThreshold,
}

impl EventReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventReason::Synced => "Synced",
            EventReason::FailedSync => "FailedSync",
            EventReason::Created => "Created",
            EventReason::FailCreate => "FailCreate",
            EventReason::Imported => "Imported",
            EventReason::FailImport => "FailImport",
            EventReason::AlreadyPresent => "AlreadyPresent",
            EventReason::FailValidate => "FailValidate",
            EventReason::FailDestroy => "FailDestroy",
            EventReason::FailRemoveFinalizer => "FailRemoveFinalizer",
            EventReason::FailStatusSync => "FailStatusSync",
            EventReason::FailCapacitySync => "FailCapacitySync",
            EventReason::PoolReadOnlyThreshold => "PoolReadOnlyThreshold",
        }
    }

    /// Default human message for the reason
    pub fn message(&self) -> &'static str {
        match self {
            EventReason::Synced => "Resource successfully synced",
            EventReason::FailedSync => "Resource sync failed",
            EventReason::Created => "Resource created successfully",
            EventReason::FailCreate => "Resource creation failed",
            EventReason::Imported => "Resource imported successfully",
            EventReason::FailImport => "Resource import failed",
            EventReason::AlreadyPresent => "Resource already present",
            EventReason::FailValidate => "Resource validation failed",
            EventReason::FailDestroy => "Resource destroy failed",
            EventReason::FailRemoveFinalizer => "Resource finalizer removal failed",
            EventReason::FailStatusSync => "Resource status sync failed",
            EventReason::FailCapacitySync => "Resource capacity sync failed",
            EventReason::PoolReadOnlyThreshold => {
                "Pool storage limit reached to threshold. Pool expansion is required to make it's replica RW"
            }
        }
    }

    /// Whether the reason reports a failure
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            EventReason::FailedSync
                | EventReason::FailCreate
                | EventReason::FailImport
                | EventReason::FailValidate
                | EventReason::FailDestroy
                | EventReason::FailRemoveFinalizer
                | EventReason::FailStatusSync
                | EventReason::FailCapacitySync
        )
    }
}

impl std::fmt::Display for EventReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Condition
// =============================================================================

/// Resource condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceCondition {
    /// Type of condition
    pub r#type: String,
    /// Status: True, False, Unknown
    pub status: String,
    /// Last transition time
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_transition_time: Option<DateTime<Utc>>,
    /// Reason
    #[serde(default)]
    pub reason: Option<String>,
    /// Message
    #[serde(default)]
    pub message: Option<String>,
}

impl ResourceCondition {
    /// Build a condition from a reason; failures are reported as "False"
    pub fn new(r#type: &str, reason: EventReason, message: impl Into<String>) -> Self {
        let status = if reason.is_failure() { "False" } else { "True" };
        Self {
            r#type: r#type.to_string(),
            status: status.to_string(),
            last_transition_time: Some(Utc::now()),
            reason: Some(reason.as_str().to_string()),
            message: Some(message.into()),
        }
    }

    /// Build a condition with an explicit status
    pub fn with_status(r#type: &str, status: bool, reason: EventReason, message: impl Into<String>) -> Self {
        Self {
            status: if status { "True" } else { "False" }.to_string(),
            ..Self::new(r#type, reason, message)
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == "True"
    }
}

/// Replace the condition of the same type, keeping the transition time when
/// the status did not change
pub fn set_condition(conditions: &mut Vec<ResourceCondition>, condition: ResourceCondition) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.r#type == condition.r#type) {
        let last_transition_time = if existing.status == condition.status {
            existing.last_transition_time
        } else {
            condition.last_transition_time
        };
        *existing = ResourceCondition {
            last_transition_time,
            ..condition
        };
    } else {
        conditions.push(condition);
    }
}

/// Find a condition by type
pub fn find_condition<'a>(
    conditions: &'a [ResourceCondition],
    r#type: &str,
) -> Option<&'a ResourceCondition> {
    conditions.iter().find(|c| c.r#type == r#type)
}
