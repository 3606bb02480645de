//! Automation orchestration: rule decision -> claim -> approval -> guardrails -> action.
//!
//! Action adapters (ERP order creation, email, production control) sit behind
//! [`ActionAdapter`]; everything else here is wiring of the components in this crate.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::instrument;
use uuid::Uuid;

use loopforge_automation::{
    ActionType, ApprovalRequirement, AutomationRule, GuardrailCheckResult, OnActionFail,
    OnConditionFail, OrderGuardrailInput, OutboundGuardrailInput, RuleEvaluation, RuleType,
    approval_requirement, build_idempotency_key, evaluate_rules, resolve_field, rule_matches,
};
use loopforge_core::{CardId, ErrorClass, TenantId, UserId};
use loopforge_events::{LifecycleEvent, OrderCreated, ProductionAction, ProductionSignal};

use crate::audit::AuditChain;
use crate::dedupe::{DedupeError, ScanDedupeManager};
use crate::event_bus::{EventPublisher, publish_lifecycle_event};
use crate::guardrails::{GuardrailEngine, GuardrailError};
use crate::review_queue::{ReviewItem, ReviewQueue};
use crate::store::{NewAuditEntry, StoreError};

/// One attempt at an action, as handed to an adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionRequest {
    pub tenant_id: TenantId,
    pub rule_id: String,
    pub action_type: ActionType,
    pub entity_id: String,
    pub idempotency_key: String,
    pub context: Value,
    /// 1-based.
    pub attempt: u32,
    pub actor: Option<UserId>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ActionError {
    /// Worth retrying (downstream timeout, 5xx, connection reset).
    #[error("transient action failure: {0}")]
    Transient(String),

    /// Downstream refused the action; retrying will not help.
    #[error("action rejected: {0}")]
    Rejected(String),
}

impl ActionError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ActionError::Transient(_) => ErrorClass::TransientInfrastructure,
            ActionError::Rejected(_) => ErrorClass::PreconditionFailed,
        }
    }
}

/// Executes one action type against the outside world. Must honour the idempotency key.
#[async_trait]
pub trait ActionAdapter: Send + Sync {
    async fn execute(&self, request: &ActionRequest) -> Result<Value, ActionError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct AutomationRequest {
    pub tenant_id: TenantId,
    pub trigger_event: String,
    /// Entity the claim is scoped to (the card id for card-driven triggers).
    pub entity_id: String,
    pub rules: Vec<AutomationRule>,
    pub context: Value,
    pub actor: Option<UserId>,
    /// Users who signed off on this action. Repeats of the same user count once.
    pub approvals: Vec<UserId>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum AutomationOutcome {
    Denied {
        evaluation: RuleEvaluation,
    },
    Replayed {
        idempotency_key: String,
        cached_result: Option<Value>,
    },
    InFlight {
        idempotency_key: String,
    },
    PendingApproval {
        rule_id: String,
        requirement: ApprovalRequirement,
        idempotency_key: String,
    },
    Blocked {
        rule_id: String,
        guardrails: GuardrailCheckResult,
    },
    Executed {
        rule_id: String,
        action_type: ActionType,
        idempotency_key: String,
        attempts: u32,
        result: Value,
    },
    Failed {
        rule_id: String,
        disposition: OnActionFail,
        attempts: u32,
        error: String,
    },
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum OrchestratorError {
    #[error("no adapter registered for {0}")]
    NoAdapter(ActionType),

    #[error(transparent)]
    Dedupe(#[from] DedupeError),

    #[error(transparent)]
    Guardrail(#[from] GuardrailError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl OrchestratorError {
    pub fn class(&self) -> ErrorClass {
        match self {
            OrchestratorError::NoAdapter(_) => ErrorClass::PreconditionFailed,
            OrchestratorError::Dedupe(e) => e.class(),
            OrchestratorError::Guardrail(e) => e.class(),
            OrchestratorError::Store(e) => e.class(),
        }
    }
}

fn order_type(action_type: ActionType) -> &'static str {
    match action_type {
        ActionType::CreatePurchaseOrder => "purchase_order",
        ActionType::CreateWorkOrder => "work_order",
        ActionType::CreateTransferOrder => "transfer_order",
        other => other.as_str(),
    }
}

fn production_action(action_type: ActionType) -> Option<ProductionAction> {
    match action_type {
        ActionType::ProductionHold => Some(ProductionAction::Hold),
        ActionType::ProductionResume => Some(ProductionAction::Resume),
        ActionType::ProductionExpedite => Some(ProductionAction::Expedite),
        ActionType::ProductionSplit => Some(ProductionAction::Split),
        _ => None,
    }
}

fn context_str(context: &Value, paths: &[&str]) -> Option<String> {
    paths
        .iter()
        .filter_map(|p| resolve_field(context, p))
        .find_map(|v| match v {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

fn order_input(context: &Value) -> OrderGuardrailInput {
    OrderGuardrailInput {
        supplier_id: context_str(context, &["order.supplierId", "supplier.id"]),
        total_amount: resolve_field(context, "order.totalAmount")
            .and_then(Value::as_f64)
            .unwrap_or(0.0),
        is_expedited: resolve_field(context, "order.isExpedited")
            .and_then(Value::as_bool)
            .unwrap_or(false),
    }
}

/// The context the idempotency key is rendered from, with the request tenant filled in.
fn key_context(context: &Value, tenant_id: TenantId) -> Value {
    let mut scoped = context.clone();
    if let Value::Object(map) = &mut scoped {
        map.entry("tenantId")
            .or_insert_with(|| Value::String(tenant_id.to_string()));
    }
    scoped
}

fn outbound_input(context: &Value) -> OutboundGuardrailInput {
    OutboundGuardrailInput {
        recipient: context_str(context, &["email.recipient"]).unwrap_or_default(),
        order_id: context_str(context, &["order.id"]),
    }
}

pub struct AutomationOrchestrator {
    audit: AuditChain,
    dedupe: ScanDedupeManager,
    guardrails: Arc<GuardrailEngine>,
    publisher: Arc<dyn EventPublisher>,
    review_queue: Arc<dyn ReviewQueue>,
    adapters: HashMap<ActionType, Arc<dyn ActionAdapter>>,
    dedupe_fail_open: bool,
}

impl AutomationOrchestrator {
    pub fn new(
        audit: AuditChain,
        dedupe: ScanDedupeManager,
        guardrails: Arc<GuardrailEngine>,
        publisher: Arc<dyn EventPublisher>,
        review_queue: Arc<dyn ReviewQueue>,
    ) -> Self {
        Self {
            audit,
            dedupe,
            guardrails,
            publisher,
            review_queue,
            adapters: HashMap::new(),
            dedupe_fail_open: true,
        }
    }

    pub fn with_adapter(mut self, action_type: ActionType, adapter: Arc<dyn ActionAdapter>) -> Self {
        self.adapters.insert(action_type, adapter);
        self
    }

    pub fn with_dedupe_fail_open(mut self, fail_open: bool) -> Self {
        self.dedupe_fail_open = fail_open;
        self
    }

    async fn audit(&self, entry: NewAuditEntry) {
        let tenant_id = entry.tenant_id;
        let action = entry.action.clone();
        if let Err(err) = self.audit.write_entry(entry).await {
            tracing::error!(tenant_id = %tenant_id, action = %action, error = %err, "audit write failed");
        }
    }

    async fn release(&self, claimed: bool, request: &AutomationRequest, key: &str, reason: &str) {
        if !claimed {
            return;
        }
        if let Err(err) = self
            .dedupe
            .mark_failed(&request.entity_id, key, request.tenant_id, reason)
            .await
        {
            tracing::warn!(tenant_id = %request.tenant_id, error = %err, "failed to release claim");
        }
    }

    /// Apply `on_condition_fail` for allow rules on this trigger whose conditions did not hold.
    async fn report_condition_failures(&self, request: &AutomationRequest) {
        let failed = request.rules.iter().filter(|r| {
            r.is_active
                && r.rule_type == RuleType::Allow
                && r.trigger.event == request.trigger_event
                && !rule_matches(r, &request.context)
        });
        for rule in failed {
            match rule.fallback.on_condition_fail {
                OnConditionFail::Skip => {}
                OnConditionFail::Log => {
                    tracing::info!(
                        tenant_id = %request.tenant_id,
                        rule_id = %rule.id,
                        entity_id = %request.entity_id,
                        "rule conditions not met"
                    );
                }
                OnConditionFail::Alert => {
                    tracing::warn!(
                        tenant_id = %request.tenant_id,
                        rule_id = %rule.id,
                        entity_id = %request.entity_id,
                        "rule conditions not met"
                    );
                    self.audit(
                        NewAuditEntry::new(request.tenant_id, "automation.condition_failed", "automation_rule")
                            .entity_id(rule.id.clone())
                            .metadata(json!({
                                "triggerEvent": request.trigger_event,
                                "entityId": request.entity_id,
                                "actionType": rule.action.action_type,
                            }))
                            .user_id(request.actor),
                    )
                    .await;
                }
            }
        }
    }

    #[instrument(
        skip(self, request),
        fields(tenant_id = %request.tenant_id, trigger = %request.trigger_event, entity_id = %request.entity_id),
        err
    )]
    pub async fn execute(&self, request: AutomationRequest) -> Result<AutomationOutcome, OrchestratorError> {
        let evaluation = evaluate_rules(&request.rules, &request.trigger_event, &request.context);

        let rule = match evaluation.matched_rule.clone().filter(|_| evaluation.allowed) {
            Some(rule) => rule,
            None => {
                self.report_condition_failures(&request).await;
                let rule_id = evaluation.matched_rule.as_ref().map(|r| r.id.clone());
                self.audit(
                    NewAuditEntry::new(request.tenant_id, "automation.denied", "automation_rule")
                        .entity_id(rule_id.unwrap_or_else(|| request.entity_id.clone()))
                        .metadata(json!({
                            "triggerEvent": request.trigger_event,
                            "entityId": request.entity_id,
                            "reason": evaluation.reason,
                            "matchedDenyRules": evaluation.matched_deny_rules,
                            "matchedAllowRules": evaluation.matched_allow_rules,
                        }))
                        .user_id(request.actor),
                )
                .await;
                return Ok(AutomationOutcome::Denied { evaluation });
            }
        };

        let action_type = rule.action.action_type;
        let key = build_idempotency_key(
            action_type,
            &key_context(&request.context, request.tenant_id),
            rule.action.idempotency_key_template.as_deref(),
        );

        let claimed = match self
            .dedupe
            .check_and_claim(&request.entity_id, &key, request.tenant_id)
            .await
        {
            Ok(claim) if claim.allowed => true,
            Ok(claim) if claim.was_replay => {
                return Ok(AutomationOutcome::Replayed {
                    idempotency_key: key,
                    cached_result: claim.cached_result,
                });
            }
            Ok(_) => return Ok(AutomationOutcome::InFlight { idempotency_key: key }),
            Err(err) if self.dedupe_fail_open => {
                tracing::warn!(
                    tenant_id = %request.tenant_id,
                    idempotency_key = %key,
                    error = %err,
                    "dedupe store unavailable; executing without idempotency guarantee"
                );
                false
            }
            Err(err) => return Err(err.into()),
        };

        let requirement = approval_requirement(&rule.approval, &request.context);
        if requirement.is_gated() {
            let approvers: HashSet<UserId> = request.approvals.iter().copied().collect();
            if !requirement.is_satisfied_by(approvers.len()) {
                self.release(claimed, &request, &key, "awaiting approval").await;
                self.audit(
                    NewAuditEntry::new(request.tenant_id, "automation.pending_approval", "automation_rule")
                        .entity_id(rule.id.clone())
                        .metadata(json!({
                            "actionType": action_type,
                            "requirement": requirement,
                            "approvalsRemaining": requirement.approvals_remaining(approvers.len()),
                            "idempotencyKey": key,
                            "entityId": request.entity_id,
                        }))
                        .user_id(request.actor),
                )
                .await;
                return Ok(AutomationOutcome::PendingApproval {
                    rule_id: rule.id,
                    requirement,
                    idempotency_key: key,
                });
            }

            let mut approved_by: Vec<String> = approvers.iter().map(ToString::to_string).collect();
            approved_by.sort();
            self.audit(
                NewAuditEntry::new(request.tenant_id, "automation.approval_granted", "automation_rule")
                    .entity_id(rule.id.clone())
                    .metadata(json!({
                        "actionType": action_type,
                        "requirement": requirement,
                        "approvedBy": approved_by,
                        "idempotencyKey": key,
                        "entityId": request.entity_id,
                    }))
                    .user_id(request.actor),
            )
            .await;
        }

        let guardrails = if action_type.creates_order() {
            Some(self.guardrails.check_financial(request.tenant_id, &order_input(&request.context)).await)
        } else if action_type.is_outbound() {
            Some(self.guardrails.check_outbound(request.tenant_id, &outbound_input(&request.context)).await)
        } else {
            None
        };
        match guardrails {
            Some(Err(err)) => {
                self.release(claimed, &request, &key, &err.to_string()).await;
                return Err(err.into());
            }
            Some(Ok(check)) if !check.passed => {
                self.release(claimed, &request, &key, "blocked by guardrails").await;
                self.audit(
                    NewAuditEntry::new(request.tenant_id, "automation.guardrail_blocked", "automation_rule")
                        .entity_id(rule.id.clone())
                        .metadata(json!({
                            "actionType": action_type,
                            "idempotencyKey": key,
                            "violations": check.violations,
                        }))
                        .user_id(request.actor),
                )
                .await;
                return Ok(AutomationOutcome::Blocked {
                    rule_id: rule.id,
                    guardrails: check,
                });
            }
            _ => {}
        }

        let Some(adapter) = self.adapters.get(&action_type).cloned() else {
            self.release(claimed, &request, &key, "no adapter").await;
            return Err(OrchestratorError::NoAdapter(action_type));
        };

        let (attempts, result) = self.run_with_retries(&rule, &request, &key, adapter.as_ref()).await;
        match result {
            Ok(value) => {
                self.on_executed(&rule, &request, &key, attempts, &value, claimed).await;
                Ok(AutomationOutcome::Executed {
                    rule_id: rule.id,
                    action_type,
                    idempotency_key: key,
                    attempts,
                    result: value,
                })
            }
            Err(err) => {
                let error = err.to_string();
                self.release(claimed, &request, &key, &error).await;
                let disposition = self.on_failed(&rule, &request, &key, attempts, &error).await?;
                Ok(AutomationOutcome::Failed {
                    rule_id: rule.id,
                    disposition,
                    attempts,
                    error,
                })
            }
        }
    }

    /// Attempts = 1 + `max_retries`; only transient failures and timeouts are retried.
    async fn run_with_retries(
        &self,
        rule: &AutomationRule,
        request: &AutomationRequest,
        key: &str,
        adapter: &dyn ActionAdapter,
    ) -> (u32, Result<Value, ActionError>) {
        let policy = &rule.fallback;
        let max_attempts = policy.max_attempts();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let action = ActionRequest {
                tenant_id: request.tenant_id,
                rule_id: rule.id.clone(),
                action_type: rule.action.action_type,
                entity_id: request.entity_id.clone(),
                idempotency_key: key.to_string(),
                context: request.context.clone(),
                attempt,
                actor: request.actor,
            };

            let err = match tokio::time::timeout(rule.action.timeout(), adapter.execute(&action)).await {
                Ok(Ok(value)) => return (attempt, Ok(value)),
                Ok(Err(err @ ActionError::Rejected(_))) => return (attempt, Err(err)),
                Ok(Err(err)) => err,
                Err(_) => ActionError::Transient(format!(
                    "timed out after {}ms",
                    rule.action.timeout_ms
                )),
            };

            if attempt >= max_attempts {
                return (attempt, Err(err));
            }

            let delay = policy.delay_for_attempt(attempt);
            tracing::warn!(
                tenant_id = %request.tenant_id,
                rule_id = %rule.id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "action attempt failed; retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn on_executed(
        &self,
        rule: &AutomationRule,
        request: &AutomationRequest,
        key: &str,
        attempts: u32,
        result: &Value,
        claimed: bool,
    ) {
        let action_type = rule.action.action_type;
        let tenant_id = request.tenant_id;

        let recorded = if action_type.creates_order() {
            self.guardrails.record_order_created(tenant_id, &order_input(&request.context)).await
        } else if action_type.is_outbound() {
            self.guardrails.record_email_sent(tenant_id, &outbound_input(&request.context)).await
        } else {
            self.guardrails.record_action(tenant_id).await
        };
        if let Err(err) = recorded {
            tracing::warn!(tenant_id = %tenant_id, error = %err, "guardrail counters not recorded");
        }

        if claimed {
            if let Err(err) = self
                .dedupe
                .mark_completed(&request.entity_id, key, tenant_id, result.clone())
                .await
            {
                tracing::warn!(tenant_id = %tenant_id, error = %err, "failed to complete claim");
            }
        }

        self.audit(
            NewAuditEntry::new(tenant_id, "automation.executed", "automation_rule")
                .entity_id(rule.id.clone())
                .new_state(result.clone())
                .metadata(json!({
                    "actionType": action_type,
                    "idempotencyKey": key,
                    "attempts": attempts,
                    "entityId": request.entity_id,
                }))
                .user_id(request.actor),
        )
        .await;

        let card_id = request.entity_id.parse::<CardId>().ok();
        let now = Utc::now();
        if action_type.creates_order() {
            let input = order_input(&request.context);
            let order_id = context_str(result, &["orderId", "id"]).unwrap_or_else(|| key.to_string());
            publish_lifecycle_event(
                &self.publisher,
                LifecycleEvent::OrderCreated(OrderCreated {
                    tenant_id,
                    order_type: order_type(action_type).to_string(),
                    order_id,
                    card_id,
                    supplier_id: input.supplier_id,
                    total_amount: resolve_field(&request.context, "order.totalAmount").and_then(Value::as_f64),
                    occurred_at: now,
                }),
            );
        } else if let Some(action) = production_action(action_type) {
            let work_order_id = context_str(&request.context, &["workOrder.id", "order.id"])
                .or_else(|| context_str(result, &["workOrderId"]))
                .unwrap_or_else(|| request.entity_id.clone());
            publish_lifecycle_event(
                &self.publisher,
                LifecycleEvent::Production(ProductionSignal {
                    tenant_id,
                    action,
                    work_order_id,
                    card_id,
                    reason: context_str(&request.context, &["reason"]),
                    occurred_at: now,
                }),
            );
        }
    }

    async fn on_failed(
        &self,
        rule: &AutomationRule,
        request: &AutomationRequest,
        key: &str,
        attempts: u32,
        error: &str,
    ) -> Result<OnActionFail, OrchestratorError> {
        let disposition = rule.fallback.on_action_fail;
        match disposition {
            OnActionFail::Escalate => {
                self.audit(
                    NewAuditEntry::new(request.tenant_id, "automation.escalated", "automation_rule")
                        .entity_id(rule.id.clone())
                        .metadata(json!({
                            "actionType": rule.action.action_type,
                            "idempotencyKey": key,
                            "attempts": attempts,
                            "error": error,
                            "entityId": request.entity_id,
                        }))
                        .user_id(request.actor),
                )
                .await;
            }
            OnActionFail::QueueForReview => {
                self.review_queue
                    .enqueue(ReviewItem {
                        id: Uuid::now_v7(),
                        tenant_id: request.tenant_id,
                        rule_id: rule.id.clone(),
                        action_type: rule.action.action_type,
                        entity_id: request.entity_id.clone(),
                        idempotency_key: key.to_string(),
                        attempts,
                        last_error: error.to_string(),
                        context: request.context.clone(),
                        enqueued_at: Utc::now(),
                        resolved_at: None,
                        resolved_by: None,
                    })
                    .await?;
            }
            OnActionFail::Ignore => {
                tracing::info!(
                    tenant_id = %request.tenant_id,
                    rule_id = %rule.id,
                    error = %error,
                    "action failed; ignored per fallback policy"
                );
            }
        }
        Ok(disposition)
    }
}
