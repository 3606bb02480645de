//! Storage seams and their implementations.
//!
//! - [`KeyValueStore`]: atomic set-if-absent / counters with TTL (dedupe claims, guardrails)
//! - [`LifecycleStore`]: cards, loops and the transition history
//! - [`AuditStore`]: the per-tenant hash-chained audit log
//!
//! Each seam has an in-memory implementation (tests/dev) and a persistent one
//! (Postgres via sqlx, Redis behind the `redis` feature).

use thiserror::Error;

use loopforge_core::ErrorClass;

pub mod audit;
pub mod kv;
pub mod lifecycle;
pub mod postgres;
#[cfg(feature = "redis")]
pub mod redis_kv;

pub use audit::{AuditEntry, AuditSession, AuditStore, InMemoryAuditStore, NewAuditEntry};
pub use kv::{CounterIncrement, InMemoryKeyValueStore, KeyValueStore};
pub use lifecycle::{InMemoryLifecycleStore, LifecycleStore};
pub use postgres::{PostgresAuditStore, PostgresLifecycleStore};
#[cfg(feature = "redis")]
pub use redis_kv::RedisKeyValueStore;

/// Infrastructure storage error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Backing store unreachable or failed mid-operation.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A guarded write lost a race (stale stage, duplicate sequence number).
    #[error("write conflict: {0}")]
    Conflict(String),

    /// A persisted record could not be decoded.
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn class(&self) -> ErrorClass {
        match self {
            StoreError::Conflict(_) => ErrorClass::Conflict,
            StoreError::Unavailable(_) | StoreError::Corrupt(_) => {
                ErrorClass::TransientInfrastructure
            }
        }
    }
}
