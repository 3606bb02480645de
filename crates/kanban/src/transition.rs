//! Transition planning: the pure part of moving a card.
//!
//! A [`TransitionPlan`] is everything a store needs to commit a transition atomically:
//! the history record to insert and the card mutation to apply.

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use loopforge_core::{CardId, ErrorClass, TenantId, UserId};

use crate::authorization::TransitionDenied;
use crate::card::{Card, StageTransition};
use crate::linkage::{OrderKind, OrderLink, extract_link, required_linkage};
use crate::stage::{LoopType, Stage, TransitionMethod, is_valid_transition};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("card {0} is inactive")]
    CardInactive(CardId),

    #[error("invalid transition {from} -> {to}")]
    InvalidTransition { from: Stage, to: Stage },

    #[error("card {card_id} already triggered (current stage {stage})")]
    CardAlreadyTriggered { card_id: CardId, stage: Stage },

    #[error("card does not belong to the requesting tenant")]
    TenantMismatch,

    #[error("transition requires a linked {kind} ({key} in metadata)", key = .kind.metadata_key())]
    MissingLinkage { kind: OrderKind },

    #[error(transparent)]
    Unauthorized(#[from] TransitionDenied),
}

impl LifecycleError {
    pub fn class(&self) -> ErrorClass {
        match self {
            // Cross-tenant probes look exactly like a missing card.
            LifecycleError::TenantMismatch => ErrorClass::NotFound,
            LifecycleError::Unauthorized(_) => ErrorClass::Unauthorized,
            LifecycleError::CardInactive(_)
            | LifecycleError::InvalidTransition { .. }
            | LifecycleError::CardAlreadyTriggered { .. }
            | LifecycleError::MissingLinkage { .. } => ErrorClass::PreconditionFailed,
        }
    }
}

/// A validated, not-yet-committed transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionPlan {
    pub card_id: CardId,
    pub from: Stage,
    pub to: Stage,
    /// Cycle the transition belongs to (`completed_cycles + 1` before the move).
    pub cycle_number: u64,
    pub entered_at: DateTime<Utc>,
    /// Only `restocked -> created` completes a cycle.
    pub completes_cycle: bool,
    /// Order reference to persist onto the card, if the metadata supplied one.
    pub link: Option<OrderLink>,
}

impl TransitionPlan {
    /// Mutate `card` to reflect the committed transition.
    pub fn apply(&self, card: &mut Card) {
        card.current_stage = self.to;
        card.current_stage_entered_at = self.entered_at;
        if self.completes_cycle {
            card.completed_cycles += 1;
            card.linked_orders = Default::default();
        }
        if let Some(link) = &self.link {
            card.linked_orders.set(link);
        }
    }

    /// The immutable history record for this transition.
    pub fn record(
        &self,
        card: &Card,
        user_id: Option<UserId>,
        method: TransitionMethod,
        notes: Option<String>,
        metadata: serde_json::Value,
    ) -> StageTransition {
        StageTransition {
            id: Uuid::now_v7(),
            tenant_id: card.tenant_id,
            card_id: card.id,
            loop_id: card.loop_id,
            cycle_number: self.cycle_number,
            from_stage: self.from,
            to_stage: self.to,
            transitioned_at: self.entered_at,
            transitioned_by_user_id: user_id,
            method,
            notes,
            metadata,
        }
    }
}

/// Validate and plan moving `card` to `to`.
///
/// Checks activity and matrix validity. When the pair takes an order link and the metadata
/// carries one for the loop's order kind, the plan persists it; a missing link is not an
/// error here (see [`require_linkage`]).
pub fn plan_transition(
    card: &Card,
    loop_type: LoopType,
    to: Stage,
    metadata: &serde_json::Value,
    now: DateTime<Utc>,
) -> Result<TransitionPlan, LifecycleError> {
    if !card.is_active {
        return Err(LifecycleError::CardInactive(card.id));
    }

    let from = card.current_stage;
    if !is_valid_transition(from, to) {
        return Err(LifecycleError::InvalidTransition { from, to });
    }

    let link = required_linkage(from, to, loop_type).and_then(|kind| extract_link(kind, metadata));

    Ok(TransitionPlan {
        card_id: card.id,
        from,
        to,
        cycle_number: card.current_cycle(),
        entered_at: now,
        completes_cycle: from == Stage::Restocked && to == Stage::Created,
        link,
    })
}

/// Fail with `MissingLinkage` when the pair requires an order link the metadata lacks.
pub fn require_linkage(
    from: Stage,
    to: Stage,
    loop_type: LoopType,
    metadata: &serde_json::Value,
) -> Result<(), LifecycleError> {
    match required_linkage(from, to, loop_type) {
        Some(kind) if extract_link(kind, metadata).is_none() => {
            Err(LifecycleError::MissingLinkage { kind })
        }
        _ => Ok(()),
    }
}

/// Preconditions of a QR scan, checked in order: tenant match (when supplied), activity,
/// and the card sitting in `created`.
pub fn plan_scan_trigger(
    card: &Card,
    tenant_id: Option<TenantId>,
    loop_type: LoopType,
    now: DateTime<Utc>,
) -> Result<TransitionPlan, LifecycleError> {
    if tenant_id.is_some_and(|t| t != card.tenant_id) {
        return Err(LifecycleError::TenantMismatch);
    }
    if !card.is_active {
        return Err(LifecycleError::CardInactive(card.id));
    }
    if card.current_stage != Stage::Created {
        return Err(LifecycleError::CardAlreadyTriggered {
            card_id: card.id,
            stage: card.current_stage,
        });
    }

    plan_transition(card, loop_type, Stage::Triggered, &serde_json::Value::Null, now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use loopforge_core::LoopId;
    use proptest::prelude::*;
    use serde_json::json;

    fn card() -> Card {
        Card::new(TenantId::new(), LoopId::new(), Utc::now())
    }

    fn walk(card: &mut Card, loop_type: LoopType, stages: &[Stage], metadata: &serde_json::Value) {
        for to in stages {
            let plan = plan_transition(card, loop_type, *to, metadata, Utc::now()).unwrap();
            plan.apply(card);
        }
    }

    #[test]
    fn ordering_persists_supplied_link() {
        let mut card = card();
        walk(
            &mut card,
            LoopType::Procurement,
            &[Stage::Triggered, Stage::Ordered],
            &json!({ "purchaseOrderId": "po-7" }),
        );
        assert_eq!(card.linked_orders.purchase_order_id.as_deref(), Some("po-7"));
    }

    #[test]
    fn restock_to_created_completes_cycle_and_clears_links() {
        let mut card = card();
        let meta = json!({ "workOrderId": "wo-1" });
        walk(
            &mut card,
            LoopType::Production,
            &[Stage::Triggered, Stage::Ordered, Stage::Received, Stage::Restocked],
            &meta,
        );
        assert_eq!(card.completed_cycles, 0);
        assert_eq!(card.linked_orders.work_order_id.as_deref(), Some("wo-1"));

        let plan = plan_transition(&card, LoopType::Production, Stage::Created, &meta, Utc::now())
            .unwrap();
        assert_eq!(plan.cycle_number, 1);
        assert!(plan.completes_cycle);
        plan.apply(&mut card);

        assert_eq!(card.completed_cycles, 1);
        assert!(card.linked_orders.is_empty());
        assert_eq!(card.current_cycle(), 2);
    }

    #[test]
    fn inactive_and_off_matrix_are_rejected() {
        let mut c = card();
        assert_eq!(
            plan_transition(&c, LoopType::Procurement, Stage::Ordered, &json!({}), Utc::now()),
            Err(LifecycleError::InvalidTransition {
                from: Stage::Created,
                to: Stage::Ordered
            })
        );

        c.is_active = false;
        assert_eq!(
            plan_transition(&c, LoopType::Procurement, Stage::Triggered, &json!({}), Utc::now()),
            Err(LifecycleError::CardInactive(c.id))
        );
    }

    #[test]
    fn linkage_required_for_ordering_only() {
        assert_eq!(
            require_linkage(Stage::Triggered, Stage::Ordered, LoopType::Transfer, &json!({})),
            Err(LifecycleError::MissingLinkage {
                kind: OrderKind::TransferOrder
            })
        );
        // A purchase order does not satisfy a transfer loop.
        assert!(
            require_linkage(
                Stage::Triggered,
                Stage::Ordered,
                LoopType::Transfer,
                &json!({ "purchaseOrderId": "po-1" })
            )
            .is_err()
        );
        assert_eq!(
            require_linkage(Stage::Received, Stage::Restocked, LoopType::Transfer, &json!({})),
            Ok(())
        );
    }

    #[test]
    fn scan_preconditions() {
        let mut c = card();
        assert_eq!(
            plan_scan_trigger(&c, Some(TenantId::new()), LoopType::Procurement, Utc::now()),
            Err(LifecycleError::TenantMismatch)
        );

        let plan =
            plan_scan_trigger(&c, Some(c.tenant_id), LoopType::Procurement, Utc::now()).unwrap();
        plan.apply(&mut c);

        assert_eq!(
            plan_scan_trigger(&c, None, LoopType::Procurement, Utc::now()),
            Err(LifecycleError::CardAlreadyTriggered {
                card_id: c.id,
                stage: Stage::Triggered
            })
        );
    }

    fn any_stage() -> impl Strategy<Value = Stage> {
        prop::sample::select(Stage::ALL.to_vec())
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: whatever targets are requested, every committed pair is in the matrix,
        /// and completed cycles only grow, by one, on restocked -> created.
        #[test]
        fn committed_transitions_respect_matrix_and_cycles(
            targets in prop::collection::vec(any_stage(), 1..60)
        ) {
            let mut card = card();
            let meta = json!({ "purchaseOrderId": "po-1" });

            for to in targets {
                let before = card.clone();
                match plan_transition(&card, LoopType::Procurement, to, &meta, Utc::now()) {
                    Ok(plan) => {
                        prop_assert!(is_valid_transition(before.current_stage, to));
                        prop_assert_eq!(plan.cycle_number, before.completed_cycles + 1);
                        plan.apply(&mut card);

                        let is_restock = before.current_stage == Stage::Restocked && to == Stage::Created;
                        let expected = before.completed_cycles + u64::from(is_restock);
                        prop_assert_eq!(card.completed_cycles, expected);
                    }
                    Err(_) => {
                        prop_assert!(!is_valid_transition(before.current_stage, to));
                        prop_assert_eq!(&card, &before);
                    }
                }
            }
        }
    }
}
