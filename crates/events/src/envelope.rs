use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use loopforge_core::TenantId;

use crate::event::Event;

/// Envelope for a lifecycle event, carrying tenant + routing metadata.
///
/// This is the unit that travels over the bus.
///
/// Notes:
/// - **Multi-tenancy** is enforced here via `tenant_id`; transports partition on it.
/// - `event_type` is duplicated out of the payload so subscribers can filter cheaply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope<E> {
    event_id: Uuid,
    tenant_id: TenantId,
    event_type: String,
    version: u32,
    occurred_at: DateTime<Utc>,
    payload: E,
}

impl<E> EventEnvelope<E> {
    pub fn new(
        event_id: Uuid,
        tenant_id: TenantId,
        event_type: impl Into<String>,
        version: u32,
        occurred_at: DateTime<Utc>,
        payload: E,
    ) -> Self {
        Self {
            event_id,
            tenant_id,
            event_type: event_type.into(),
            version,
            occurred_at,
            payload,
        }
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }
}

impl<E: Event> EventEnvelope<E> {
    /// Wrap an event, deriving metadata from the event itself and minting a fresh id.
    pub fn wrap(event: E) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            tenant_id: event.tenant_id(),
            event_type: event.event_type().to_string(),
            version: event.version(),
            occurred_at: event.occurred_at(),
            payload: event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{LifecycleEvent, OrderStatusChanged};

    #[test]
    fn wrap_copies_tenant_and_type_from_event() {
        let tenant_id = TenantId::new();
        let event = LifecycleEvent::OrderStatusChanged(OrderStatusChanged {
            tenant_id,
            order_type: "purchase_order".to_string(),
            order_id: "po-42".to_string(),
            from_status: Some("draft".to_string()),
            to_status: "sent".to_string(),
            occurred_at: Utc::now(),
        });

        let envelope = EventEnvelope::wrap(event);
        assert_eq!(envelope.tenant_id(), tenant_id);
        assert_eq!(envelope.event_type(), "order.status_changed");
        assert_eq!(envelope.version(), 1);
    }
}
