//! Lifecycle domain events and the pub/sub mechanics that distribute them.
//!
//! Publication is fire-and-forget with at-least-one-attempt semantics: producers log
//! publish failures and never roll back the state change that emitted the event.

pub mod bus;
pub mod envelope;
pub mod event;
pub mod in_memory_bus;
pub mod tenant;

pub use bus::{EventBus, Subscription};
pub use envelope::EventEnvelope;
pub use event::{
    CardTransitioned, Event, LifecycleEvent, OrderCreated, OrderStatusChanged, ProductionAction,
    ProductionSignal,
};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use tenant::{TenantScoped, tenant_channel};
