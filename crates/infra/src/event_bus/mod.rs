//! Infrastructure event bus implementations and the publishing seam.
//!
//! The core bus abstraction lives in `loopforge-events` as pure mechanics.
//! This module provides the object-safe [`EventPublisher`] the services publish through,
//! and a Redis pub/sub transport behind the `redis` feature.

use std::sync::Arc;

use loopforge_events::{EventBus, EventEnvelope, LifecycleEvent};

#[cfg(feature = "redis")]
pub mod redis_pubsub;

#[cfg(feature = "redis")]
pub use redis_pubsub::{RedisBusError, RedisPubSubEventBus};

/// Publish failure, flattened to a message. Producers only log it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("event publish failed: {0}")]
pub struct PublishError(pub String);

/// Object-safe view of a lifecycle event bus.
///
/// Lets services hold `Arc<dyn EventPublisher>` regardless of the transport's error type.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, envelope: EventEnvelope<LifecycleEvent>) -> Result<(), PublishError>;
}

impl<B> EventPublisher for B
where
    B: EventBus<EventEnvelope<LifecycleEvent>>,
{
    fn publish(&self, envelope: EventEnvelope<LifecycleEvent>) -> Result<(), PublishError> {
        EventBus::publish(self, envelope).map_err(|e| PublishError(e.to_string()))
    }
}

/// Wrap `event` and publish it, logging (never propagating) a failure.
pub fn publish_lifecycle_event(publisher: &Arc<dyn EventPublisher>, event: LifecycleEvent) {
    let envelope = EventEnvelope::wrap(event);
    let event_type = envelope.event_type().to_string();
    let tenant_id = envelope.tenant_id();

    if let Err(err) = publisher.publish(envelope) {
        tracing::warn!(
            tenant_id = %tenant_id,
            event_type = %event_type,
            error = %err,
            "event publish failed; state change stands"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use loopforge_core::TenantId;
    use loopforge_events::{InMemoryEventBus, OrderStatusChanged};

    struct Broken;

    impl EventPublisher for Broken {
        fn publish(&self, _envelope: EventEnvelope<LifecycleEvent>) -> Result<(), PublishError> {
            Err(PublishError("broker down".to_string()))
        }
    }

    fn status_changed(tenant_id: TenantId) -> LifecycleEvent {
        LifecycleEvent::OrderStatusChanged(OrderStatusChanged {
            tenant_id,
            order_type: "work_order".to_string(),
            order_id: "wo-9".to_string(),
            from_status: None,
            to_status: "released".to_string(),
            occurred_at: Utc::now(),
        })
    }

    #[test]
    fn in_memory_bus_is_a_publisher() {
        let bus: Arc<InMemoryEventBus<EventEnvelope<LifecycleEvent>>> =
            Arc::new(InMemoryEventBus::new());
        let sub = bus.subscribe();
        let publisher: Arc<dyn EventPublisher> = bus.clone();

        let tenant = TenantId::new();
        publish_lifecycle_event(&publisher, status_changed(tenant));

        let received = sub.try_recv().unwrap();
        assert_eq!(received.tenant_id(), tenant);
        assert_eq!(received.event_type(), "order.status_changed");
    }

    #[test]
    fn publish_failure_is_swallowed() {
        let publisher: Arc<dyn EventPublisher> = Arc::new(Broken);
        publish_lifecycle_event(&publisher, status_changed(TenantId::new()));
    }
}
