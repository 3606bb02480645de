//! `loopforge-core`: shared identifiers and the error taxonomy.
//!
//! This crate contains **pure** primitives (no infrastructure concerns). Every other
//! crate in the workspace builds on these types.

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult, ErrorClass};
pub use id::{CardId, LoopId, TenantId, UserId};
