use loopforge_auth::Role;
use loopforge_core::{TenantId, UserId};
use loopforge_infra::Actor;

/// Tenant context for a request.
///
/// This is immutable and must be present for all domain routes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TenantContext {
    tenant_id: TenantId,
}

impl TenantContext {
    pub fn new(tenant_id: TenantId) -> Self {
        Self { tenant_id }
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}

/// Principal context for a request (authenticated user + roles).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrincipalContext {
    user_id: UserId,
    roles: Vec<Role>,
}

impl PrincipalContext {
    pub fn new(user_id: UserId, roles: Vec<Role>) -> Self {
        Self { user_id, roles }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn roles(&self) -> &[Role] {
        &self.roles
    }

    /// The acting user as the lifecycle engine sees it.
    pub fn actor(&self) -> Actor {
        Actor {
            user_id: self.user_id,
            roles: self.roles.clone(),
        }
    }
}
