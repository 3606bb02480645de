//! Who may move a card between two stages, on which loops, and how.

use serde::Serialize;
use thiserror::Error;

use loopforge_auth::Role;

use crate::stage::{LoopType, Stage, TransitionMethod};

/// Authorization rule for one `(from, to)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionRule {
    pub from: Stage,
    pub to: Stage,
    pub allowed_roles: &'static [&'static str],
    pub allowed_loop_types: &'static [LoopType],
    pub allowed_methods: &'static [TransitionMethod],
}

const ALL_LOOPS: &[LoopType] = &[LoopType::Procurement, LoopType::Production, LoopType::Transfer];
const SHIPPED_LOOPS: &[LoopType] = &[LoopType::Procurement, LoopType::Transfer];
const ANY_METHOD: &[TransitionMethod] = &[
    TransitionMethod::QrScan,
    TransitionMethod::Manual,
    TransitionMethod::System,
];
const OFFICE_METHODS: &[TransitionMethod] = &[TransitionMethod::Manual, TransitionMethod::System];

static RULES: &[TransitionRule] = &[
    TransitionRule {
        from: Stage::Created,
        to: Stage::Triggered,
        allowed_roles: &[
            "inventory_manager",
            "procurement_manager",
            "production_manager",
            "receiving_manager",
            "warehouse_operator",
        ],
        allowed_loop_types: ALL_LOOPS,
        allowed_methods: ANY_METHOD,
    },
    TransitionRule {
        from: Stage::Triggered,
        to: Stage::Ordered,
        allowed_roles: &["procurement_manager", "inventory_manager", "production_manager"],
        allowed_loop_types: ALL_LOOPS,
        allowed_methods: OFFICE_METHODS,
    },
    TransitionRule {
        from: Stage::Ordered,
        to: Stage::InTransit,
        allowed_roles: &["procurement_manager", "inventory_manager", "receiving_manager"],
        allowed_loop_types: SHIPPED_LOOPS,
        allowed_methods: OFFICE_METHODS,
    },
    TransitionRule {
        from: Stage::Ordered,
        to: Stage::Received,
        allowed_roles: &[
            "receiving_manager",
            "inventory_manager",
            "production_manager",
            "warehouse_operator",
        ],
        allowed_loop_types: ALL_LOOPS,
        allowed_methods: ANY_METHOD,
    },
    TransitionRule {
        from: Stage::InTransit,
        to: Stage::Received,
        allowed_roles: &["receiving_manager", "inventory_manager", "warehouse_operator"],
        allowed_loop_types: SHIPPED_LOOPS,
        allowed_methods: ANY_METHOD,
    },
    TransitionRule {
        from: Stage::Received,
        to: Stage::Restocked,
        allowed_roles: &["warehouse_operator", "inventory_manager", "receiving_manager"],
        allowed_loop_types: ALL_LOOPS,
        allowed_methods: ANY_METHOD,
    },
    TransitionRule {
        from: Stage::Restocked,
        to: Stage::Created,
        allowed_roles: &["inventory_manager", "warehouse_operator"],
        allowed_loop_types: ALL_LOOPS,
        allowed_methods: ANY_METHOD,
    },
];

/// The rule governing `(from, to)`, if one exists.
pub fn rule_for(from: Stage, to: Stage) -> Option<&'static TransitionRule> {
    RULES.iter().find(|r| r.from == from && r.to == to)
}

#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum TransitionDenied {
    #[error("no authorization rule for {from} -> {to}")]
    NoRule { from: Stage, to: Stage },

    #[error("none of the actor's roles may move {from} -> {to}")]
    RoleNotAllowed { from: Stage, to: Stage },

    #[error("{loop_type} loops may not move {from} -> {to}")]
    LoopTypeNotAllowed { from: Stage, to: Stage, loop_type: LoopType },

    #[error("method {method} may not move {from} -> {to}")]
    MethodNotAllowed { from: Stage, to: Stage, method: TransitionMethod },
}

/// Check the actor's roles, the loop type and the initiation method against the pair's rule.
///
/// `tenant_admin` bypasses all three checks. A pair without a rule is denied.
pub fn authorize_transition(
    roles: &[Role],
    loop_type: LoopType,
    method: TransitionMethod,
    from: Stage,
    to: Stage,
) -> Result<(), TransitionDenied> {
    if roles.iter().any(Role::is_tenant_admin) {
        return Ok(());
    }

    let rule = rule_for(from, to).ok_or(TransitionDenied::NoRule { from, to })?;

    if !roles.iter().any(|r| rule.allowed_roles.contains(&r.as_str())) {
        return Err(TransitionDenied::RoleNotAllowed { from, to });
    }
    if !rule.allowed_loop_types.contains(&loop_type) {
        return Err(TransitionDenied::LoopTypeNotAllowed { from, to, loop_type });
    }
    if !rule.allowed_methods.contains(&method) {
        return Err(TransitionDenied::MethodNotAllowed { from, to, method });
    }

    Ok(())
}
