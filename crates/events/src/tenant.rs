use loopforge_core::TenantId;

use crate::EventEnvelope;

/// Helper trait for tenant-scoped messages.
///
/// Subscribers use it to drop messages for other tenants, and transports use it to pick
/// the per-tenant channel a message is published on.
pub trait TenantScoped {
    fn tenant_id(&self) -> TenantId;
}

impl<E> TenantScoped for EventEnvelope<E> {
    fn tenant_id(&self) -> TenantId {
        EventEnvelope::tenant_id(self)
    }
}

/// Channel name a tenant's events are published on: `<prefix>:<tenant_id>`.
pub fn tenant_channel(prefix: &str, tenant_id: TenantId) -> String {
    format!("{prefix}:{tenant_id}")
}
