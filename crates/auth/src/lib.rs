//! `loopforge-auth`: pure authentication boundary.
//!
//! This crate is decoupled from HTTP and storage: it knows the role vocabulary, the claim
//! set LoopForge expects, and how to verify an HS256 bearer token.

pub mod claims;
pub mod jwt;
pub mod roles;

pub use claims::{JwtClaims, TokenError, validate_claims};
pub use jwt::{Hs256JwtValidator, JwtValidator};
pub use roles::Role;
