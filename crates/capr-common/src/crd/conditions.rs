//! Kubernetes-style status conditions shared by the control plane and CAPI objects

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Control plane has at least one etcd, control plane and worker machine
pub const PROVISIONED: &str = "Provisioned";
/// Cluster is not being restored or torn down
pub const STABLE: &str = "Stable";
/// Control plane plans match the current spec
pub const UPDATED: &str = "Updated";
/// Per-machine summary written by the tiered reconciler
pub const RECONCILED: &str = "Reconciled";
/// Object is ready
pub const READY: &str = "Ready";
/// Node has applied its current plan
pub const PLAN_APPLIED: &str = "PlanApplied";
/// Init node has been bootstrapped
pub const BOOTSTRAPPED: &str = "Bootstrapped";
/// CAPI infrastructure provider reports the machine as ready
pub const INFRASTRUCTURE_READY: &str = "InfrastructureReady";
/// CAPI cluster condition mirroring control plane initialization
pub const CONTROL_PLANE_INITIALIZED: &str = "ControlPlaneInitialized";

/// Condition status following Kubernetes conventions
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g., Ready, Reconciled)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// Last time the condition transitioned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Some(Utc::now()),
        }
    }
}

/// Lookup and mutation helpers over a condition list
pub trait Conditions {
    /// Borrow the condition list
    fn conditions(&self) -> &[Condition];

    /// Mutably borrow the condition list
    fn conditions_mut(&mut self) -> &mut Vec<Condition>;

    /// Find a condition by type
    fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions().iter().find(|c| c.type_ == type_)
    }

    /// True if the condition exists and is True
    fn is_true(&self, type_: &str) -> bool {
        self.condition(type_)
            .is_some_and(|c| c.status == ConditionStatus::True)
    }

    /// True if the condition exists and is False
    fn is_false(&self, type_: &str) -> bool {
        self.condition(type_)
            .is_some_and(|c| c.status == ConditionStatus::False)
    }

    /// Message of the condition, empty if absent
    fn condition_message(&self, type_: &str) -> &str {
        self.condition(type_).map(|c| c.message.as_str()).unwrap_or("")
    }

    /// Reason of the condition, empty if absent
    fn condition_reason(&self, type_: &str) -> &str {
        self.condition(type_).map(|c| c.reason.as_str()).unwrap_or("")
    }

    /// Set a condition, only bumping the transition time when status changes
    fn set_condition(
        &mut self,
        type_: &str,
        status: ConditionStatus,
        reason: &str,
        message: &str,
    ) {
        let conditions = self.conditions_mut();
        match conditions.iter_mut().find(|c| c.type_ == type_) {
            Some(existing) => {
                if existing.status != status {
                    existing.last_transition_time = Some(Utc::now());
                }
                existing.status = status;
                existing.reason = reason.to_string();
                existing.message = message.to_string();
            }
            None => conditions.push(Condition::new(type_, status, reason, message)),
        }
    }

    /// Set a condition True with no reason or message
    fn set_true(&mut self, type_: &str) {
        self.set_condition(type_, ConditionStatus::True, "", "");
    }

    /// Set a condition False with no reason or message
    fn set_false(&mut self, type_: &str) {
        self.set_condition(type_, ConditionStatus::False, "", "");
    }
}

impl Conditions for Vec<Condition> {
    fn conditions(&self) -> &[Condition] {
        self
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        self
    }
}
