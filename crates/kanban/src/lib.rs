//! Kanban card lifecycle domain.
//!
//! Pure, deterministic rules for moving a card around its replenishment loop: the fixed
//! stage matrix, per-pair authorization, order linkage, downstream queue routing and the
//! transition plan a store commits atomically. No IO, no HTTP, no storage.

pub mod authorization;
pub mod card;
pub mod linkage;
pub mod routing;
pub mod stage;
pub mod transition;

pub use authorization::{TransitionDenied, TransitionRule, authorize_transition, rule_for};
pub use card::{Card, KanbanLoop, LinkedOrders, StageTransition};
pub use linkage::{OrderKind, OrderLink, extract_link, required_linkage};
pub use routing::queue_for_loop;
pub use stage::{LoopType, Stage, TransitionMethod, is_valid_transition};
pub use transition::{
    LifecycleError, TransitionPlan, plan_scan_trigger, plan_transition, require_linkage,
};
