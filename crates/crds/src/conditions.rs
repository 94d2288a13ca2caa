//! Status conditions shared by IPPool and VirtualMachineNetworkConfig.
//!
//! Every failure surfaces as a condition with a stable `reason` and a
//! human-readable `message`.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "PascalCase")]
pub enum ConditionType {
    /// IPPool: subnet installed in the allocator
    Registered,
    /// IPPool: status replayed into the allocator
    CacheReady,
    /// IPPool: agent pod is Ready
    AgentReady,
    /// IPPool: Registered and CacheReady and AgentReady
    Ready,
    /// IPPool / VMNetCfg: administratively paused
    Disabled,
    /// VMNetCfg: every NIC holds an address
    Allocated,
    /// VMNetCfg: status matches spec
    InSynced,
}

/// Condition status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum ConditionStatus {
    /// Condition holds
    True,
    /// Condition does not hold
    False,
    /// Not yet evaluated
    #[default]
    Unknown,
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value { Self::True } else { Self::False }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type
    #[serde(rename = "type")]
    pub type_: ConditionType,

    /// True, False or Unknown
    pub status: ConditionStatus,

    /// Machine-readable reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Last time the condition was written
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<DateTime<Utc>>,

    /// Last time `status` changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

/// Looks up a condition by type.
pub fn get_condition(conditions: &[Condition], type_: ConditionType) -> Option<&Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Whether the condition exists and is True.
pub fn is_condition_true(conditions: &[Condition], type_: ConditionType) -> bool {
    get_condition(conditions, type_).is_some_and(|c| c.status == ConditionStatus::True)
}

/// Whether the condition exists and is False.
pub fn is_condition_false(conditions: &[Condition], type_: ConditionType) -> bool {
    get_condition(conditions, type_).is_some_and(|c| c.status == ConditionStatus::False)
}

/// Sets a condition in place.
///
/// `lastTransitionTime` only moves when `status` changes, and timestamps are
/// left alone entirely when nothing changed, so repeated reconciles produce
/// identical status and do not retrigger watches.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: ConditionType,
    status: impl Into<ConditionStatus>,
    reason: &str,
    message: &str,
) {
    let status = status.into();
    let reason = (!reason.is_empty()).then(|| reason.to_string());
    let message = (!message.is_empty()).then(|| message.to_string());
    let now = Utc::now();

    match conditions.iter_mut().find(|c| c.type_ == type_) {
        Some(existing) => {
            if existing.status == status && existing.reason == reason && existing.message == message {
                return;
            }
            if existing.status != status {
                existing.last_transition_time = Some(now);
            }
            existing.status = status;
            existing.reason = reason;
            existing.message = message;
            existing.last_update_time = Some(now);
        }
        None => conditions.push(Condition {
            type_,
            status,
            reason,
            message,
            last_update_time: Some(now),
            last_transition_time: Some(now),
        }),
    }
}
