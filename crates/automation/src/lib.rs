//! Automation domain: rules, their pure evaluation, idempotency keys and guardrail policy.
//!
//! Everything here is deterministic and IO-free; counters, claims and adapters live in
//! `loopforge-infra`.

pub mod approval;
pub mod evaluator;
pub mod guardrail;
pub mod idempotency;
pub mod rule;

pub use approval::{ApprovalRequirement, approval_requirement};
pub use evaluator::{RuleEvaluation, evaluate_condition, evaluate_rules, resolve_field, rule_matches};
pub use guardrail::{
    FinancialCounters, GuardrailCheckResult, GuardrailPolicy, GuardrailViolation,
    OrderGuardrailInput, OutboundCounters, OutboundGuardrailInput, evaluate_financial,
    evaluate_outbound, recipient_domain,
};
pub use idempotency::{build_idempotency_key, build_idempotency_key_at};
pub use rule::{
    ActionType, ApprovalConfig, ApprovalStrategy, ApprovalThresholds, AutomationRule, Condition,
    ConditionOperator, FallbackPolicy, OnActionFail, OnConditionFail, RuleAction, RuleType,
    Trigger,
};
