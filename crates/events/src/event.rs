use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use loopforge_core::{CardId, LoopId, TenantId, UserId};

/// A domain-agnostic event.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - **versioned** (schema evolution)
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name/type identifier (e.g. "card.transition").
    fn event_type(&self) -> &'static str;

    /// Schema version for this event type.
    fn version(&self) -> u32;

    /// When the event occurred (business time).
    fn occurred_at(&self) -> DateTime<Utc>;

    /// Tenant the event belongs to (bus partitioning key).
    fn tenant_id(&self) -> TenantId;
}

/// Event: a card moved between lifecycle stages.
///
/// Stages and methods travel as their wire names so consumers do not need the
/// kanban domain crate to decode the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardTransitioned {
    pub tenant_id: TenantId,
    pub card_id: CardId,
    pub loop_id: LoopId,
    pub from_stage: String,
    pub to_stage: String,
    pub method: String,
    pub cycle_number: u64,
    pub transitioned_by: Option<UserId>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: a downstream order was created by an automation action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreated {
    pub tenant_id: TenantId,
    pub order_type: String,
    pub order_id: String,
    pub card_id: Option<CardId>,
    pub supplier_id: Option<String>,
    pub total_amount: Option<f64>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: a downstream order changed status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderStatusChanged {
    pub tenant_id: TenantId,
    pub order_type: String,
    pub order_id: String,
    pub from_status: Option<String>,
    pub to_status: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductionAction {
    Hold,
    Resume,
    Expedite,
    Split,
}

/// Event: a production control signal was raised for a work order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductionSignal {
    pub tenant_id: TenantId,
    pub action: ProductionAction,
    pub work_order_id: String,
    pub card_id: Option<CardId>,
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    CardTransitioned(CardTransitioned),
    OrderCreated(OrderCreated),
    OrderStatusChanged(OrderStatusChanged),
    Production(ProductionSignal),
}

impl Event for LifecycleEvent {
    fn event_type(&self) -> &'static str {
        match self {
            LifecycleEvent::CardTransitioned(_) => "card.transition",
            LifecycleEvent::OrderCreated(_) => "order.created",
            LifecycleEvent::OrderStatusChanged(_) => "order.status_changed",
            LifecycleEvent::Production(p) => match p.action {
                ProductionAction::Hold => "production.hold",
                ProductionAction::Resume => "production.resume",
                ProductionAction::Expedite => "production.expedite",
                ProductionAction::Split => "production.split",
            },
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            LifecycleEvent::CardTransitioned(e) => e.occurred_at,
            LifecycleEvent::OrderCreated(e) => e.occurred_at,
            LifecycleEvent::OrderStatusChanged(e) => e.occurred_at,
            LifecycleEvent::Production(e) => e.occurred_at,
        }
    }

    fn tenant_id(&self) -> TenantId {
        match self {
            LifecycleEvent::CardTransitioned(e) => e.tenant_id,
            LifecycleEvent::OrderCreated(e) => e.tenant_id,
            LifecycleEvent::OrderStatusChanged(e) => e.tenant_id,
            LifecycleEvent::Production(e) => e.tenant_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn production_signals_use_action_specific_types() {
        let signal = |action| {
            LifecycleEvent::Production(ProductionSignal {
                tenant_id: TenantId::new(),
                action,
                work_order_id: "wo-1".to_string(),
                card_id: None,
                reason: None,
                occurred_at: Utc::now(),
            })
        };

        assert_eq!(signal(ProductionAction::Hold).event_type(), "production.hold");
        assert_eq!(signal(ProductionAction::Resume).event_type(), "production.resume");
        assert_eq!(signal(ProductionAction::Expedite).event_type(), "production.expedite");
        assert_eq!(signal(ProductionAction::Split).event_type(), "production.split");
    }

    #[test]
    fn card_transition_payload_is_camel_case() {
        let event = CardTransitioned {
            tenant_id: TenantId::new(),
            card_id: CardId::new(),
            loop_id: LoopId::new(),
            from_stage: "created".to_string(),
            to_stage: "triggered".to_string(),
            method: "qr_scan".to_string(),
            cycle_number: 1,
            transitioned_by: None,
            occurred_at: Utc::now(),
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["fromStage"], "created");
        assert_eq!(json["cycleNumber"], 1);
    }
}
