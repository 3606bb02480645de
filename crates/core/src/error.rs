//! Domain error model and the workspace-wide error taxonomy.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type used across the pure domain crates.
pub type DomainResult<T> = Result<T, DomainError>;

/// Coarse classification shared by every error type in the workspace.
///
/// The class decides propagation: `NotFound`, `PreconditionFailed` and `Unauthorized`
/// are terminal and user-facing; `GuardrailViolation` is terminal for the attempt but
/// may be resubmitted; `TransientInfrastructure` is retried according to the owning
/// rule's fallback policy; `Conflict` short-circuits to a previous result.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    NotFound,
    PreconditionFailed,
    Unauthorized,
    GuardrailViolation,
    TransientInfrastructure,
    Conflict,
}

impl ErrorClass {
    /// Only infrastructure failures are worth an automatic retry.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::TransientInfrastructure)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::NotFound => "not_found",
            ErrorClass::PreconditionFailed => "precondition_failed",
            ErrorClass::Unauthorized => "unauthorized",
            ErrorClass::GuardrailViolation => "guardrail_violation",
            ErrorClass::TransientInfrastructure => "transient_infrastructure",
            ErrorClass::Conflict => "conflict",
        }
    }
}

impl core::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Domain-level error.
///
/// Keep this focused on deterministic, business/domain failures (validation,
/// invariants, conflicts). Infrastructure concerns belong elsewhere.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A domain invariant was violated.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A requested resource was not found (domain-level).
    #[error("not found")]
    NotFound,

    /// A conflict occurred (e.g. stale stage / optimistic concurrency).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Authorization failure at the domain boundary.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn not_found() -> Self {
        Self::NotFound
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            DomainError::Validation(_)
            | DomainError::InvariantViolation(_)
            | DomainError::InvalidId(_) => ErrorClass::PreconditionFailed,
            DomainError::NotFound => ErrorClass::NotFound,
            DomainError::Conflict(_) => ErrorClass::Conflict,
            DomainError::Unauthorized(_) => ErrorClass::Unauthorized,
        }
    }
}
