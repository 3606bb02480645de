use std::borrow::Cow;

use serde::{Deserialize, Serialize};

/// Role identifier used for RBAC.
///
/// Roles are opaque strings on the wire; the well-known ones used by the card lifecycle
/// rules are exposed as constants.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Role(Cow<'static, str>);

impl Role {
    /// Bypasses every transition authorization check within its tenant.
    pub const TENANT_ADMIN: Role = Role(Cow::Borrowed("tenant_admin"));
    pub const INVENTORY_MANAGER: Role = Role(Cow::Borrowed("inventory_manager"));
    pub const PROCUREMENT_MANAGER: Role = Role(Cow::Borrowed("procurement_manager"));
    pub const RECEIVING_MANAGER: Role = Role(Cow::Borrowed("receiving_manager"));
    pub const PRODUCTION_MANAGER: Role = Role(Cow::Borrowed("production_manager"));
    pub const WAREHOUSE_OPERATOR: Role = Role(Cow::Borrowed("warehouse_operator"));

    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_tenant_admin(&self) -> bool {
        self.as_str() == Self::TENANT_ADMIN.as_str()
    }
}

impl core::fmt::Display for Role {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}
