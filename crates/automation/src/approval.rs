use serde::Serialize;
use serde_json::Value;

use crate::evaluator::resolve_field;
use crate::rule::{ApprovalConfig, ApprovalStrategy};

/// Human sign-off an action needs before it may execute.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalRequirement {
    None,
    Single,
    Dual,
}

impl ApprovalRequirement {
    pub fn is_gated(self) -> bool {
        self != ApprovalRequirement::None
    }

    /// Distinct approvers needed to clear the gate.
    pub fn required_approvals(self) -> usize {
        match self {
            ApprovalRequirement::None => 0,
            ApprovalRequirement::Single => 1,
            ApprovalRequirement::Dual => 2,
        }
    }

    pub fn approvals_remaining(self, distinct_approvers: usize) -> usize {
        self.required_approvals().saturating_sub(distinct_approvers)
    }

    pub fn is_satisfied_by(self, distinct_approvers: usize) -> bool {
        self.approvals_remaining(distinct_approvers) == 0
    }
}

/// Resolve the approval gate for a rule against the evaluation context.
///
/// `threshold_based` compares `order.totalAmount` with the configured thresholds; without a
/// usable amount or thresholds it falls back to the `required` flag.
pub fn approval_requirement(approval: &ApprovalConfig, context: &Value) -> ApprovalRequirement {
    let flagged = |level| if approval.required { level } else { ApprovalRequirement::None };

    match approval.strategy {
        ApprovalStrategy::AutoApprove => ApprovalRequirement::None,
        ApprovalStrategy::SingleApproval => flagged(ApprovalRequirement::Single),
        ApprovalStrategy::DualApproval => flagged(ApprovalRequirement::Dual),
        ApprovalStrategy::ThresholdBased => {
            let amount = resolve_field(context, "order.totalAmount").and_then(Value::as_f64);
            match (amount, approval.thresholds) {
                (Some(amount), Some(t)) => {
                    if t.dual_approval_above.is_some_and(|limit| amount >= limit) {
                        ApprovalRequirement::Dual
                    } else if t.require_approval_above.is_some_and(|limit| amount >= limit) {
                        ApprovalRequirement::Single
                    } else {
                        ApprovalRequirement::None
                    }
                }
                _ => flagged(ApprovalRequirement::Single),
            }
        }
    }
}
