//! The card lifecycle state machine.
//!
//! [`StageTransitionEngine`] composes the pure planning in `loopforge-kanban` with
//! persistence, dedupe claims, event publication and the audit chain:
//!
//! 1. load card + loop (tenant-scoped)
//! 2. plan (activity, matrix) and, on the authorized path, check roles/linkage
//! 3. commit history row + card update atomically, guarded by the current stage
//! 4. publish `card.transition` and append an audit entry (failures are logged only)

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::instrument;
use uuid::Uuid;

use loopforge_auth::Role;
use loopforge_core::{CardId, ErrorClass, LoopId, TenantId, UserId};
use loopforge_events::{CardTransitioned, LifecycleEvent};
use loopforge_kanban::{
    Card, KanbanLoop, LifecycleError, LoopType, Stage, StageTransition, TransitionMethod,
    TransitionPlan, authorize_transition, plan_scan_trigger, plan_transition, queue_for_loop,
    require_linkage,
};

use crate::audit::AuditChain;
use crate::dedupe::{DedupeError, ScanDedupeManager};
use crate::event_bus::{EventPublisher, publish_lifecycle_event};
use crate::store::{LifecycleStore, NewAuditEntry, StoreError};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransitionError {
    #[error("card {0} not found")]
    CardNotFound(CardId),

    #[error("loop {0} not found")]
    LoopNotFound(LoopId),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    /// The card left the planned `from` stage before the commit landed.
    #[error("card {0} changed stage concurrently")]
    ConcurrentTransition(CardId),

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Dedupe(#[from] DedupeError),
}

impl TransitionError {
    pub fn class(&self) -> ErrorClass {
        match self {
            TransitionError::CardNotFound(_) | TransitionError::LoopNotFound(_) => ErrorClass::NotFound,
            TransitionError::Lifecycle(e) => e.class(),
            TransitionError::ConcurrentTransition(_) => ErrorClass::Conflict,
            TransitionError::Store(e) => e.class(),
            TransitionError::Dedupe(e) => e.class(),
        }
    }
}

impl From<StoreError> for TransitionError {
    fn from(err: StoreError) -> Self {
        TransitionError::Store(err)
    }
}

/// Who is asking, as established by the auth layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub user_id: UserId,
    pub roles: Vec<Role>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransitionRequest {
    pub card_id: CardId,
    pub tenant_id: TenantId,
    pub to_stage: Stage,
    pub user_id: Option<UserId>,
    pub method: TransitionMethod,
    pub notes: Option<String>,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionOutcome {
    pub card: Card,
    pub transition: StageTransition,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScanRequest {
    pub card_id: CardId,
    /// When supplied, must match the card's tenant.
    pub tenant_id: Option<TenantId>,
    /// Anonymous scans (kiosk, shop-floor reader) skip the role check.
    pub actor: Option<Actor>,
    pub location: Option<String>,
    pub idempotency_key: Option<String>,
}

/// What a successful scan produced. Cached verbatim for replays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanOutcome {
    pub card_id: CardId,
    pub tenant_id: TenantId,
    pub loop_type: LoopType,
    pub stage: Stage,
    pub queue: String,
    pub transition_id: Uuid,
    pub cycle_number: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ScanResult {
    Triggered(ScanOutcome),
    /// Same idempotency key already completed; nothing new was written.
    Replayed(ScanOutcome),
    /// Same idempotency key is still being processed elsewhere.
    InFlight { card_id: CardId },
}

fn stage_snapshot(card: &Card) -> serde_json::Value {
    json!({
        "stage": card.current_stage,
        "completedCycles": card.completed_cycles,
        "linkedOrders": card.linked_orders,
    })
}

pub struct StageTransitionEngine {
    store: Arc<dyn LifecycleStore>,
    audit: AuditChain,
    dedupe: ScanDedupeManager,
    publisher: Arc<dyn EventPublisher>,
    dedupe_fail_open: bool,
}

impl StageTransitionEngine {
    pub fn new(
        store: Arc<dyn LifecycleStore>,
        audit: AuditChain,
        dedupe: ScanDedupeManager,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            store,
            audit,
            dedupe,
            publisher,
            dedupe_fail_open: true,
        }
    }

    /// Whether a scan proceeds without its dedupe guarantee when the claim store is down.
    pub fn with_dedupe_fail_open(mut self, fail_open: bool) -> Self {
        self.dedupe_fail_open = fail_open;
        self
    }

    async fn load(&self, card_id: CardId, tenant_id: Option<TenantId>) -> Result<(Card, KanbanLoop), TransitionError> {
        let card = self
            .store
            .find_card(card_id)
            .await?
            .filter(|c| tenant_id.is_none_or(|t| t == c.tenant_id))
            .ok_or(TransitionError::CardNotFound(card_id))?;

        let kanban_loop = self
            .store
            .find_loop(card.tenant_id, card.loop_id)
            .await?
            .ok_or(TransitionError::LoopNotFound(card.loop_id))?;

        Ok((card, kanban_loop))
    }

    /// Validate and apply a transition without role checks (system callers).
    #[instrument(
        skip(self, request),
        fields(tenant_id = %request.tenant_id, card_id = %request.card_id, to = %request.to_stage),
        err
    )]
    pub async fn transition_card(&self, request: TransitionRequest) -> Result<TransitionOutcome, TransitionError> {
        let (card, kanban_loop) = self.load(request.card_id, Some(request.tenant_id)).await?;
        let plan = plan_transition(
            &card,
            kanban_loop.loop_type,
            request.to_stage,
            &request.metadata,
            Utc::now(),
        )?;

        self.commit(&card, plan, request.user_id, request.method, request.notes, request.metadata)
            .await
    }

    /// [`transition_card`](Self::transition_card) behind the per-pair authorization rule and
    /// the linkage requirement. The actor is recorded as the transitioning user.
    #[instrument(
        skip(self, actor, request),
        fields(tenant_id = %request.tenant_id, card_id = %request.card_id, to = %request.to_stage),
        err
    )]
    pub async fn authorized_transition(
        &self,
        actor: &Actor,
        request: TransitionRequest,
    ) -> Result<TransitionOutcome, TransitionError> {
        let (card, kanban_loop) = self.load(request.card_id, Some(request.tenant_id)).await?;
        let plan = plan_transition(
            &card,
            kanban_loop.loop_type,
            request.to_stage,
            &request.metadata,
            Utc::now(),
        )?;

        authorize_transition(&actor.roles, kanban_loop.loop_type, request.method, plan.from, plan.to)
            .map_err(LifecycleError::from)?;
        require_linkage(plan.from, plan.to, kanban_loop.loop_type, &request.metadata)?;

        self.commit(
            &card,
            plan,
            Some(actor.user_id),
            request.method,
            request.notes,
            request.metadata,
        )
        .await
    }

    /// QR-scan entry point: `created -> triggered`, routed to the loop's downstream queue.
    #[instrument(skip(self, request), fields(card_id = %request.card_id), err)]
    pub async fn trigger_card_by_scan(&self, request: ScanRequest) -> Result<ScanResult, TransitionError> {
        let card = self
            .store
            .find_card(request.card_id)
            .await?
            .filter(|c| request.tenant_id.is_none_or(|t| t == c.tenant_id))
            .ok_or(TransitionError::CardNotFound(request.card_id))?;

        let card_key = card.id.to_string();
        let tenant_id = card.tenant_id;
        let mut claimed = None;
        if let Some(key) = request.idempotency_key.as_deref() {
            match self.dedupe.check_and_claim(&card_key, key, card.tenant_id).await {
                Ok(claim) if claim.allowed => claimed = Some(key),
                Ok(claim) if claim.was_replay => {
                    let cached = claim.cached_result.unwrap_or(serde_json::Value::Null);
                    let outcome: ScanOutcome =
                        serde_json::from_value(cached).map_err(|e| DedupeError::Corrupt {
                            key: key.to_string(),
                            reason: e.to_string(),
                        })?;
                    tracing::info!(card_id = %card.id, "scan replayed from completed claim");
                    return Ok(ScanResult::Replayed(outcome));
                }
                Ok(_) => return Ok(ScanResult::InFlight { card_id: card.id }),
                Err(err) if self.dedupe_fail_open => {
                    tracing::warn!(
                        tenant_id = %card.tenant_id,
                        card_id = %card.id,
                        error = %err,
                        "dedupe store unavailable; scanning without idempotency guarantee"
                    );
                }
                Err(err) => return Err(err.into()),
            }
        }

        let result = self.scan(card, &request).await;

        if let Some(key) = claimed {
            let marked = match &result {
                Ok(outcome) => match serde_json::to_value(outcome) {
                    Ok(value) => self.dedupe.mark_completed(&card_key, key, tenant_id, value).await,
                    Err(e) => self.dedupe.mark_failed(&card_key, key, tenant_id, &e.to_string()).await,
                },
                Err(err) => self.dedupe.mark_failed(&card_key, key, tenant_id, &err.to_string()).await,
            };
            if let Err(err) = marked {
                tracing::warn!(card_id = %card_key, error = %err, "failed to settle dedupe claim");
            }
        }

        result.map(ScanResult::Triggered)
    }

    async fn scan(&self, card: Card, request: &ScanRequest) -> Result<ScanOutcome, TransitionError> {
        let kanban_loop = self
            .store
            .find_loop(card.tenant_id, card.loop_id)
            .await?
            .ok_or(TransitionError::LoopNotFound(card.loop_id))?;

        let plan = plan_scan_trigger(&card, request.tenant_id, kanban_loop.loop_type, Utc::now())?;

        if let Some(actor) = &request.actor {
            authorize_transition(
                &actor.roles,
                kanban_loop.loop_type,
                TransitionMethod::QrScan,
                plan.from,
                plan.to,
            )
            .map_err(LifecycleError::from)?;
        }

        let mut metadata = serde_json::Map::new();
        if let Some(location) = &request.location {
            metadata.insert("location".to_string(), json!(location));
        }
        if let Some(key) = &request.idempotency_key {
            metadata.insert("idempotencyKey".to_string(), json!(key));
        }

        let outcome = self
            .commit(
                &card,
                plan,
                request.actor.as_ref().map(|a| a.user_id),
                TransitionMethod::QrScan,
                None,
                serde_json::Value::Object(metadata),
            )
            .await?;

        Ok(ScanOutcome {
            card_id: outcome.card.id,
            tenant_id: outcome.card.tenant_id,
            loop_type: kanban_loop.loop_type,
            stage: outcome.card.current_stage,
            queue: queue_for_loop(kanban_loop.loop_type).to_string(),
            transition_id: outcome.transition.id,
            cycle_number: outcome.transition.cycle_number,
        })
    }

    /// Transition history for a card in the caller's tenant, oldest first.
    pub async fn history(&self, tenant_id: TenantId, card_id: CardId) -> Result<Vec<StageTransition>, TransitionError> {
        self.store
            .find_card(card_id)
            .await?
            .filter(|c| c.tenant_id == tenant_id)
            .ok_or(TransitionError::CardNotFound(card_id))?;

        Ok(self.store.list_transitions(tenant_id, card_id).await?)
    }

    async fn commit(
        &self,
        card: &Card,
        plan: TransitionPlan,
        user_id: Option<UserId>,
        method: TransitionMethod,
        notes: Option<String>,
        metadata: serde_json::Value,
    ) -> Result<TransitionOutcome, TransitionError> {
        let transition = plan.record(card, user_id, method, notes, metadata);

        let updated = match self.store.commit_transition(&plan, &transition).await {
            Ok(updated) => updated,
            Err(StoreError::Conflict(msg)) => {
                tracing::info!(card_id = %card.id, reason = %msg, "lost transition race");
                return Err(TransitionError::ConcurrentTransition(card.id));
            }
            Err(err) => return Err(err.into()),
        };

        tracing::info!(
            tenant_id = %card.tenant_id,
            card_id = %card.id,
            from = %plan.from,
            to = %plan.to,
            cycle = plan.cycle_number,
            "card transitioned"
        );

        publish_lifecycle_event(
            &self.publisher,
            LifecycleEvent::CardTransitioned(CardTransitioned {
                tenant_id: card.tenant_id,
                card_id: card.id,
                loop_id: card.loop_id,
                from_stage: plan.from.as_str().to_string(),
                to_stage: plan.to.as_str().to_string(),
                method: method.as_str().to_string(),
                cycle_number: plan.cycle_number,
                transitioned_by: user_id,
                occurred_at: transition.transitioned_at,
            }),
        );

        let entry = NewAuditEntry::new(card.tenant_id, "card.transition", "kanban_card")
            .entity_id(card.id.to_string())
            .previous_state(stage_snapshot(card))
            .new_state(stage_snapshot(&updated))
            .metadata(json!({
                "transitionId": transition.id,
                "method": method,
                "cycleNumber": plan.cycle_number,
            }))
            .user_id(user_id);
        if let Err(err) = self.audit.write_entry(entry).await {
            tracing::error!(
                tenant_id = %card.tenant_id,
                card_id = %card.id,
                error = %err,
                "audit write failed after committed transition"
            );
        }

        Ok(TransitionOutcome {
            card: updated,
            transition,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryAuditStore, InMemoryKeyValueStore, InMemoryLifecycleStore};
    use loopforge_events::{EventBus, EventEnvelope, InMemoryEventBus, Subscription};

    struct Harness {
        engine: StageTransitionEngine,
        store: Arc<InMemoryLifecycleStore>,
        kv: Arc<InMemoryKeyValueStore>,
        audit: AuditChain,
        events: Subscription<EventEnvelope<LifecycleEvent>>,
    }

    fn harness() -> Harness {
        let store = Arc::new(InMemoryLifecycleStore::new());
        let kv = Arc::new(InMemoryKeyValueStore::new());
        let audit = AuditChain::new(Arc::new(InMemoryAuditStore::new()));
        let bus: Arc<InMemoryEventBus<EventEnvelope<LifecycleEvent>>> = Arc::new(InMemoryEventBus::new());
        let events = bus.subscribe();

        let engine = StageTransitionEngine::new(
            store.clone(),
            audit.clone(),
            ScanDedupeManager::new(kv.clone()),
            bus,
        );
        Harness {
            engine,
            store,
            kv,
            audit,
            events,
        }
    }

    fn seed(h: &Harness, loop_type: LoopType) -> Card {
        let tenant_id = TenantId::new();
        let kanban_loop = KanbanLoop {
            id: LoopId::new(),
            tenant_id,
            loop_type,
            is_active: true,
        };
        let card = Card::new(tenant_id, kanban_loop.id, Utc::now());
        h.store.upsert_loop(kanban_loop);
        h.store.upsert_card(card.clone());
        card
    }

    fn scan(card: &Card, key: Option<&str>) -> ScanRequest {
        ScanRequest {
            card_id: card.id,
            tenant_id: Some(card.tenant_id),
            actor: None,
            location: Some("dock-3".to_string()),
            idempotency_key: key.map(str::to_string),
        }
    }

    fn request(card: &Card, to: Stage, method: TransitionMethod, metadata: serde_json::Value) -> TransitionRequest {
        TransitionRequest {
            card_id: card.id,
            tenant_id: card.tenant_id,
            to_stage: to,
            user_id: None,
            method,
            notes: None,
            metadata,
        }
    }

    fn actor(role: Role) -> Actor {
        Actor {
            user_id: UserId::new(),
            roles: vec![role],
        }
    }

    #[tokio::test]
    async fn scan_triggers_and_routes_procurement_to_order_queue() {
        let h = harness();
        let card = seed(&h, LoopType::Procurement);

        let result = h.engine.trigger_card_by_scan(scan(&card, None)).await.unwrap();
        let ScanResult::Triggered(outcome) = result else {
            panic!("expected Triggered, got {result:?}");
        };
        assert_eq!(outcome.queue, "Order Queue");
        assert_eq!(outcome.stage, Stage::Triggered);
        assert_eq!(outcome.cycle_number, 1);

        let history = h.engine.history(card.tenant_id, card.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].method, TransitionMethod::QrScan);
        assert_eq!(history[0].metadata["location"], "dock-3");

        let event = h.events.try_recv().unwrap();
        assert_eq!(event.event_type(), "card.transition");

        let audit = h.audit.entries(card.tenant_id).await.unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].action, "card.transition");
        assert_eq!(audit[0].entity_id.as_deref(), Some(card.id.to_string().as_str()));
    }

    #[tokio::test]
    async fn queue_follows_loop_type() {
        for (loop_type, queue) in [
            (LoopType::Production, "Production Queue"),
            (LoopType::Transfer, "Transfer Queue"),
        ] {
            let h = harness();
            let card = seed(&h, loop_type);
            match h.engine.trigger_card_by_scan(scan(&card, None)).await.unwrap() {
                ScanResult::Triggered(outcome) => assert_eq!(outcome.queue, queue),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn repeated_scan_with_same_key_replays() {
        let h = harness();
        let card = seed(&h, LoopType::Procurement);

        let first = h.engine.trigger_card_by_scan(scan(&card, Some("scan-1"))).await.unwrap();
        let second = h.engine.trigger_card_by_scan(scan(&card, Some("scan-1"))).await.unwrap();

        let (ScanResult::Triggered(a), ScanResult::Replayed(b)) = (first, second) else {
            panic!("expected Triggered then Replayed");
        };
        assert_eq!(a, b);
        assert_eq!(h.engine.history(card.tenant_id, card.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn scanning_a_triggered_card_fails() {
        let h = harness();
        let card = seed(&h, LoopType::Procurement);
        h.engine.trigger_card_by_scan(scan(&card, None)).await.unwrap();

        let err = h.engine.trigger_card_by_scan(scan(&card, Some("fresh"))).await.unwrap_err();
        assert!(matches!(
            err,
            TransitionError::Lifecycle(LifecycleError::CardAlreadyTriggered { .. })
        ));
        assert_eq!(err.class(), ErrorClass::PreconditionFailed);

        // The failed attempt released its key for retry.
        assert!(matches!(
            h.engine.trigger_card_by_scan(scan(&card, Some("fresh"))).await,
            Err(TransitionError::Lifecycle(LifecycleError::CardAlreadyTriggered { .. }))
        ));
    }

    #[tokio::test]
    async fn other_tenants_see_not_found() {
        let h = harness();
        let card = seed(&h, LoopType::Procurement);

        let mut req = scan(&card, None);
        req.tenant_id = Some(TenantId::new());
        let err = h.engine.trigger_card_by_scan(req).await.unwrap_err();
        assert_eq!(err, TransitionError::CardNotFound(card.id));
        assert_eq!(err.class(), ErrorClass::NotFound);
    }

    #[tokio::test]
    async fn dedupe_outage_fails_open_by_default() {
        let h = harness();
        let card = seed(&h, LoopType::Procurement);
        h.kv.set_unavailable(true);

        let result = h.engine.trigger_card_by_scan(scan(&card, Some("k"))).await.unwrap();
        assert!(matches!(result, ScanResult::Triggered(_)));
    }

    #[tokio::test]
    async fn dedupe_outage_fails_closed_when_configured() {
        let h = harness();
        let card = seed(&h, LoopType::Procurement);
        let engine = h.engine.with_dedupe_fail_open(false);
        h.kv.set_unavailable(true);

        let err = engine.trigger_card_by_scan(scan(&card, Some("k"))).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::TransientInfrastructure);
        assert!(h.store.list_transitions(card.tenant_id, card.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn full_cycle_increments_completed_cycles_and_clears_links() {
        let h = harness();
        let card = seed(&h, LoopType::Procurement);
        let po = json!({ "purchaseOrderId": "po-17" });

        let steps = [
            (Stage::Triggered, TransitionMethod::QrScan, json!({})),
            (Stage::Ordered, TransitionMethod::Manual, po.clone()),
            (Stage::InTransit, TransitionMethod::System, json!({})),
            (Stage::Received, TransitionMethod::QrScan, json!({})),
            (Stage::Restocked, TransitionMethod::QrScan, json!({})),
        ];
        for (to, method, metadata) in steps {
            let out = h.engine.transition_card(request(&card, to, method, metadata)).await.unwrap();
            assert_eq!(out.card.completed_cycles, 0);
            assert_eq!(out.transition.cycle_number, 1);
        }
        let stored = h.store.find_card(card.id).await.unwrap().unwrap();
        assert_eq!(stored.linked_orders.purchase_order_id.as_deref(), Some("po-17"));

        let out = h
            .engine
            .transition_card(request(&card, Stage::Created, TransitionMethod::Manual, json!({})))
            .await
            .unwrap();
        assert_eq!(out.transition.cycle_number, 1);
        assert_eq!(out.card.completed_cycles, 1);
        assert!(out.card.linked_orders.is_empty());

        let audit = h.audit.entries(card.tenant_id).await.unwrap();
        assert_eq!(audit.len(), 6);
        assert!(crate::audit::verify_chain(&audit).is_ok());
    }

    #[tokio::test]
    async fn inactive_and_invalid_transitions_are_rejected() {
        let h = harness();
        let card = seed(&h, LoopType::Procurement);

        let err = h
            .engine
            .transition_card(request(&card, Stage::Received, TransitionMethod::Manual, json!({})))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransitionError::Lifecycle(LifecycleError::InvalidTransition { .. })
        ));

        let mut inactive = card.clone();
        inactive.is_active = false;
        h.store.upsert_card(inactive);
        let err = h
            .engine
            .transition_card(request(&card, Stage::Triggered, TransitionMethod::Manual, json!({})))
            .await
            .unwrap_err();
        assert_eq!(err, TransitionError::Lifecycle(LifecycleError::CardInactive(card.id)));
    }

    #[tokio::test]
    async fn authorized_path_checks_role_method_and_linkage() {
        let h = harness();
        let card = seed(&h, LoopType::Production);
        h.engine
            .trigger_card_by_scan(scan(&card, None))
            .await
            .unwrap();

        let operator = actor(Role::WAREHOUSE_OPERATOR);
        let err = h
            .engine
            .authorized_transition(&operator, request(&card, Stage::Ordered, TransitionMethod::Manual, json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Unauthorized);

        let manager = actor(Role::PRODUCTION_MANAGER);
        let err = h
            .engine
            .authorized_transition(&manager, request(&card, Stage::Ordered, TransitionMethod::QrScan, json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Unauthorized);

        let err = h
            .engine
            .authorized_transition(&manager, request(&card, Stage::Ordered, TransitionMethod::Manual, json!({})))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransitionError::Lifecycle(LifecycleError::MissingLinkage { .. })
        ));

        let out = h
            .engine
            .authorized_transition(
                &manager,
                request(&card, Stage::Ordered, TransitionMethod::Manual, json!({ "workOrderId": "wo-3" })),
            )
            .await
            .unwrap();
        assert_eq!(out.card.linked_orders.work_order_id.as_deref(), Some("wo-3"));
        assert_eq!(out.transition.transitioned_by_user_id, Some(manager.user_id));
    }

    #[tokio::test]
    async fn admin_bypasses_pair_rules_but_not_linkage() {
        let h = harness();
        let card = seed(&h, LoopType::Transfer);
        h.engine.trigger_card_by_scan(scan(&card, None)).await.unwrap();

        let admin = actor(Role::TENANT_ADMIN);
        let err = h
            .engine
            .authorized_transition(&admin, request(&card, Stage::Ordered, TransitionMethod::QrScan, json!({})))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransitionError::Lifecycle(LifecycleError::MissingLinkage { .. })
        ));
    }

    #[tokio::test]
    async fn stale_plan_surfaces_as_concurrent_transition() {
        let h = harness();
        let card = seed(&h, LoopType::Procurement);
        let kanban_loop = h.store.find_loop(card.tenant_id, card.loop_id).await.unwrap().unwrap();

        // Plan against the stale snapshot, then let another writer move the card first.
        let stale = plan_transition(&card, kanban_loop.loop_type, Stage::Triggered, &json!({}), Utc::now()).unwrap();
        h.engine.trigger_card_by_scan(scan(&card, None)).await.unwrap();

        let err = h
            .engine
            .commit(&card, stale, None, TransitionMethod::Manual, None, json!({}))
            .await
            .unwrap_err();
        assert_eq!(err, TransitionError::ConcurrentTransition(card.id));
        assert_eq!(err.class(), ErrorClass::Conflict);
    }

    #[tokio::test]
    async fn publish_failure_does_not_fail_the_transition() {
        struct Broken;
        impl EventPublisher for Broken {
            fn publish(
                &self,
                _envelope: EventEnvelope<LifecycleEvent>,
            ) -> Result<(), crate::event_bus::PublishError> {
                Err(crate::event_bus::PublishError("down".to_string()))
            }
        }

        let store = Arc::new(InMemoryLifecycleStore::new());
        let engine = StageTransitionEngine::new(
            store.clone(),
            AuditChain::new(Arc::new(InMemoryAuditStore::new())),
            ScanDedupeManager::new(Arc::new(InMemoryKeyValueStore::new())),
            Arc::new(Broken),
        );
        let tenant_id = TenantId::new();
        let kanban_loop = KanbanLoop {
            id: LoopId::new(),
            tenant_id,
            loop_type: LoopType::Procurement,
            is_active: true,
        };
        let card = Card::new(tenant_id, kanban_loop.id, Utc::now());
        store.upsert_loop(kanban_loop);
        store.upsert_card(card.clone());

        let result = engine.trigger_card_by_scan(scan(&card, None)).await.unwrap();
        assert!(matches!(result, ScanResult::Triggered(_)));
    }
}
