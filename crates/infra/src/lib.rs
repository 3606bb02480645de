//! Infrastructure layer: stores, the audit chain, claims, guardrails, the transition
//! engine and the automation orchestrator.
//!
//! Pure decisions live in `loopforge-kanban` and `loopforge-automation`; this crate adds
//! IO, concurrency and failure handling around them.

pub mod audit;
pub mod config;
pub mod dedupe;
pub mod event_bus;
pub mod guardrails;
pub mod orchestrator;
pub mod review_queue;
pub mod store;
pub mod transition;

pub use audit::{AuditChain, AuditError, ChainError, ChainReport, compute_hash, verify_chain};
pub use config::{AutomationConfig, ConfigError};
pub use dedupe::{ClaimResult, ClaimStatus, DedupeError, ScanDedupeManager};
pub use event_bus::{EventPublisher, PublishError};
pub use guardrails::{GuardrailEngine, GuardrailError};
pub use orchestrator::{
    ActionAdapter, ActionError, ActionRequest, AutomationOrchestrator, AutomationOutcome,
    AutomationRequest, OrchestratorError,
};
pub use review_queue::{InMemoryReviewQueue, ReviewItem, ReviewQueue};
pub use transition::{
    Actor, ScanOutcome, ScanRequest, ScanResult, StageTransitionEngine, TransitionError,
    TransitionOutcome, TransitionRequest,
};
