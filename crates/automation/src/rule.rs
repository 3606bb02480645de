//! `AutomationRule`: a plain tagged record, camelCase on the wire.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    Allow,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trigger {
    pub event: String,
    #[serde(default)]
    pub source_entity: Option<String>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,
    Exists,
    Regex,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Dot path into the evaluation context, e.g. `loop.loopType`.
    pub field: String,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub value: serde_json::Value,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    CreatePurchaseOrder,
    CreateWorkOrder,
    CreateTransferOrder,
    SendEmail,
    TransitionCard,
    ProductionHold,
    ProductionResume,
    ProductionExpedite,
    ProductionSplit,
}

impl ActionType {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionType::CreatePurchaseOrder => "create_purchase_order",
            ActionType::CreateWorkOrder => "create_work_order",
            ActionType::CreateTransferOrder => "create_transfer_order",
            ActionType::SendEmail => "send_email",
            ActionType::TransitionCard => "transition_card",
            ActionType::ProductionHold => "production_hold",
            ActionType::ProductionResume => "production_resume",
            ActionType::ProductionExpedite => "production_expedite",
            ActionType::ProductionSplit => "production_split",
        }
    }

    /// Actions guarded by the financial guardrails.
    pub fn creates_order(self) -> bool {
        matches!(
            self,
            ActionType::CreatePurchaseOrder
                | ActionType::CreateWorkOrder
                | ActionType::CreateTransferOrder
        )
    }

    /// Actions guarded by the outbound guardrails.
    pub fn is_outbound(self) -> bool {
        matches!(self, ActionType::SendEmail)
    }
}

impl core::fmt::Display for ActionType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleAction {
    #[serde(rename = "type")]
    pub action_type: ActionType,
    #[serde(default)]
    pub idempotency_key_template: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl RuleAction {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStrategy {
    #[default]
    AutoApprove,
    SingleApproval,
    DualApproval,
    ThresholdBased,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalThresholds {
    #[serde(default)]
    pub require_approval_above: Option<f64>,
    #[serde(default)]
    pub dual_approval_above: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalConfig {
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub strategy: ApprovalStrategy,
    #[serde(default)]
    pub thresholds: Option<ApprovalThresholds>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnConditionFail {
    #[default]
    Skip,
    Log,
    Alert,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnActionFail {
    #[default]
    Escalate,
    QueueForReview,
    Ignore,
}

impl OnActionFail {
    pub fn as_str(self) -> &'static str {
        match self {
            OnActionFail::Escalate => "escalate",
            OnActionFail::QueueForReview => "queue_for_review",
            OnActionFail::Ignore => "ignore",
        }
    }
}

/// What to do when conditions or the action fail, including retry/backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FallbackPolicy {
    #[serde(default)]
    pub on_condition_fail: OnConditionFail,
    #[serde(default)]
    pub on_action_fail: OnActionFail,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "FallbackPolicy::default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "FallbackPolicy::default_backoff_multiplier")]
    pub retry_backoff_multiplier: f64,
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        Self {
            on_condition_fail: OnConditionFail::default(),
            on_action_fail: OnActionFail::default(),
            max_retries: 0,
            retry_delay_ms: Self::default_retry_delay_ms(),
            retry_backoff_multiplier: Self::default_backoff_multiplier(),
        }
    }
}

impl FallbackPolicy {
    fn default_retry_delay_ms() -> u64 {
        1_000
    }

    fn default_backoff_multiplier() -> f64 {
        2.0
    }

    /// Total attempts including the first one.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retry number `attempt` (1-indexed):
    /// `retry_delay_ms * retry_backoff_multiplier^(attempt - 1)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let multiplier = self.retry_backoff_multiplier;
        let multiplier = if multiplier.is_finite() && multiplier > 0.0 { multiplier } else { 1.0 };
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let delay_ms = self.retry_delay_ms as f64 * multiplier.powi(exponent);

        if delay_ms.is_finite() {
            Duration::from_millis(delay_ms.min(u64::MAX as f64) as u64)
        } else {
            Duration::from_millis(u64::MAX)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationRule {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub rule_type: RuleType,
    #[serde(default)]
    pub category: Option<String>,
    pub trigger: Trigger,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub action: RuleAction,
    #[serde(default)]
    pub approval: ApprovalConfig,
    #[serde(default)]
    pub fallback: FallbackPolicy,
    /// Lower number = higher precedence.
    pub priority: i32,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub tenant_configurable: bool,
}

fn default_true() -> bool {
    true
}
