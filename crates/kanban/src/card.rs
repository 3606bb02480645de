use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use loopforge_core::{CardId, LoopId, TenantId, UserId};

use crate::linkage::{OrderKind, OrderLink};
use crate::stage::{LoopType, Stage, TransitionMethod};

/// Downstream orders a card is currently linked to (at most one per kind).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkedOrders {
    pub purchase_order_id: Option<String>,
    pub work_order_id: Option<String>,
    pub transfer_order_id: Option<String>,
}

impl LinkedOrders {
    pub fn get(&self, kind: OrderKind) -> Option<&str> {
        match kind {
            OrderKind::PurchaseOrder => self.purchase_order_id.as_deref(),
            OrderKind::WorkOrder => self.work_order_id.as_deref(),
            OrderKind::TransferOrder => self.transfer_order_id.as_deref(),
        }
    }

    pub fn set(&mut self, link: &OrderLink) {
        let slot = match link.kind {
            OrderKind::PurchaseOrder => &mut self.purchase_order_id,
            OrderKind::WorkOrder => &mut self.work_order_id,
            OrderKind::TransferOrder => &mut self.transfer_order_id,
        };
        *slot = Some(link.order_id.clone());
    }

    pub fn is_empty(&self) -> bool {
        self.purchase_order_id.is_none()
            && self.work_order_id.is_none()
            && self.transfer_order_id.is_none()
    }
}

/// A physical replenishment signal cycling through a loop.
///
/// Mutated only by the stage transition engine; activation is managed elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Card {
    pub id: CardId,
    pub tenant_id: TenantId,
    pub loop_id: LoopId,
    pub current_stage: Stage,
    pub current_stage_entered_at: DateTime<Utc>,
    pub completed_cycles: u64,
    pub is_active: bool,
    pub linked_orders: LinkedOrders,
}

impl Card {
    /// A fresh, active card at the start of its first cycle.
    pub fn new(tenant_id: TenantId, loop_id: LoopId, now: DateTime<Utc>) -> Self {
        Self {
            id: CardId::new(),
            tenant_id,
            loop_id,
            current_stage: Stage::Created,
            current_stage_entered_at: now,
            completed_cycles: 0,
            is_active: true,
            linked_orders: LinkedOrders::default(),
        }
    }

    /// Cycle the card is currently in (1-based).
    pub fn current_cycle(&self) -> u64 {
        self.completed_cycles + 1
    }
}

/// Read-only view of the loop a card belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KanbanLoop {
    pub id: LoopId,
    pub tenant_id: TenantId,
    pub loop_type: LoopType,
    pub is_active: bool,
}

/// Immutable record of one stage change. Created once, never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageTransition {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub card_id: CardId,
    pub loop_id: LoopId,
    pub cycle_number: u64,
    pub from_stage: Stage,
    pub to_stage: Stage,
    pub transitioned_at: DateTime<Utc>,
    pub transitioned_by_user_id: Option<UserId>,
    pub method: TransitionMethod,
    pub notes: Option<String>,
    pub metadata: serde_json::Value,
}
