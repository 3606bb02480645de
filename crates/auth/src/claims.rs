use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use loopforge_core::{ErrorClass, TenantId, UserId};

use crate::Role;

/// JWT claims model.
///
/// `iat`/`exp` are seconds since the Unix epoch (RFC 7519 NumericDate), so tokens minted
/// by any standard library decode here unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwtClaims {
    /// Subject / acting user.
    pub sub: UserId,

    /// Tenant context for the token.
    pub tenant_id: TenantId,

    /// Roles granted within the tenant context.
    pub roles: Vec<Role>,

    /// Issued-at (epoch seconds).
    pub iat: i64,

    /// Expiration (epoch seconds).
    pub exp: i64,
}

impl JwtClaims {
    pub fn has_role(&self, role: &Role) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("token has expired")]
    Expired,

    #[error("token not yet valid (iat is in the future)")]
    NotYetValid,

    #[error("invalid token time window (exp <= iat)")]
    InvalidTimeWindow,

    #[error("token signature is invalid")]
    BadSignature,

    #[error("malformed token: {0}")]
    Malformed(String),
}

impl TokenError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::Unauthorized
    }
}

/// Deterministically validate the claim time window against `now`.
pub fn validate_claims(claims: &JwtClaims, now: DateTime<Utc>) -> Result<(), TokenError> {
    let now = now.timestamp();
    if claims.exp <= claims.iat {
        return Err(TokenError::InvalidTimeWindow);
    }
    if now < claims.iat {
        return Err(TokenError::NotYetValid);
    }
    if now >= claims.exp {
        return Err(TokenError::Expired);
    }
    Ok(())
}
