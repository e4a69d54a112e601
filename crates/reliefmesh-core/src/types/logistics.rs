//! Logistics plan record - output of the plan-generation stage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::RequestId;

/// Logistics plan state machine; `Planning` doubles as the claim state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    #[default]
    Pending,
    Planning,
    Complete,
    Failed,
}

impl PlanStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PlanStatus::Complete | PlanStatus::Failed)
    }

    pub fn is_claimed_or_complete(&self) -> bool {
        matches!(self, PlanStatus::Planning | PlanStatus::Complete)
    }
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PlanStatus::Pending => "pending",
            PlanStatus::Planning => "planning",
            PlanStatus::Complete => "complete",
            PlanStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Deployment priority, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

/// One resource deployment in the ordered action sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentAction {
    /// Resource type, matching the inventory vocabulary.
    pub resource: String,
    pub quantity: u32,
    pub destination: String,
    pub priority: Priority,
}

/// LogisticsPlan - written by the logistics stage, only after a complete
/// DamageReport exists for the same request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogisticsPlan {
    pub request_id: RequestId,
    /// Ordered deployment sequence.
    #[serde(default)]
    pub actions: Vec<DeploymentAction>,
    #[serde(default)]
    pub summary: Option<String>,
    pub plan_status: PlanStatus,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub planner_model: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LogisticsPlan {
    /// Build the claim placeholder written before plan generation starts.
    pub fn claim(request_id: RequestId) -> Self {
        let now = Utc::now();
        Self {
            request_id,
            actions: Vec::new(),
            summary: None,
            plan_status: PlanStatus::Planning,
            error: None,
            planner_model: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Build a terminal failed plan, used when the precondition (a complete
    /// damage report) can no longer be met.
    pub fn failed(request_id: RequestId, reason: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            request_id,
            actions: Vec::new(),
            summary: None,
            plan_status: PlanStatus::Failed,
            error: Some(reason.into()),
            planner_model: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn complete_with(
        &mut self,
        actions: Vec<DeploymentAction>,
        summary: Option<String>,
        planner_model: Option<String>,
    ) {
        self.actions = actions;
        self.summary = summary;
        self.planner_model = planner_model;
        self.error = None;
        self.plan_status = PlanStatus::Complete;
        self.updated_at = Utc::now();
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.error = Some(reason.into());
        self.plan_status = PlanStatus::Failed;
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_placeholder_is_planning() {
        let plan = LogisticsPlan::claim(RequestId::from("req-1"));
        assert_eq!(plan.plan_status, PlanStatus::Planning);
        assert!(plan.actions.is_empty());
    }

    #[test]
    fn test_failed_constructor_records_reason() {
        let plan = LogisticsPlan::failed(RequestId::from("req-1"), "damage report not ready");
        assert_eq!(plan.plan_status, PlanStatus::Failed);
        assert_eq!(plan.error.as_deref(), Some("damage report not ready"));
    }

    #[test]
    fn test_complete_with_preserves_action_order() {
        let mut plan = LogisticsPlan::claim(RequestId::from("req-1"));
        plan.complete_with(
            vec![
                DeploymentAction {
                    resource: "Medical Kits (Level 2)".to_string(),
                    quantity: 20,
                    destination: "Cebu City".to_string(),
                    priority: Priority::Critical,
                },
                DeploymentAction {
                    resource: "Water Filters (units)".to_string(),
                    quantity: 100,
                    destination: "Bantayan".to_string(),
                    priority: Priority::High,
                },
            ],
            None,
            Some("planner-v1".to_string()),
        );
        assert_eq!(plan.plan_status, PlanStatus::Complete);
        assert_eq!(plan.actions[0].priority, Priority::Critical);
        assert_eq!(plan.actions[1].resource, "Water Filters (units)");
    }

    #[test]
    fn test_priority_orders_highest_first() {
        assert!(Priority::Critical < Priority::High);
        assert!(Priority::High < Priority::Medium);
        assert!(Priority::Medium < Priority::Low);
    }
}
