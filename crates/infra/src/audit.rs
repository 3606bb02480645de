//! Tamper-evident, per-tenant hash-chained audit log.
//!
//! Each entry's `hash_chain` is SHA-256 over its own identifying fields plus the previous
//! entry's hash. Writers serialize per tenant through an [`AuditSession`], so sequence
//! numbers are gap-free under concurrency.

use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::instrument;
use uuid::Uuid;

use loopforge_core::{ErrorClass, TenantId};

use crate::store::{AuditEntry, AuditStore, NewAuditEntry, StoreError};

/// Frozen hash serialization. Bump only together with a chain migration.
pub const AUDIT_CHAIN_FORMAT_VERSION: u32 = 1;

/// `previous_hash` of a tenant's first entry.
pub const GENESIS_HASH: &str = "GENESIS";

/// `2024-01-01T00:00:00.000Z`
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Stored timestamps carry millisecond precision so the hash can be recomputed from rows.
pub fn truncate_to_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.trunc_subsecs(3)
}

/// SHA-256 hex over the pipe-joined fields, in this exact order.
pub fn compute_hash(
    tenant_id: TenantId,
    sequence_number: u64,
    action: &str,
    entity_type: &str,
    entity_id: Option<&str>,
    timestamp: DateTime<Utc>,
    previous_hash: Option<&str>,
) -> String {
    let material = [
        tenant_id.to_string(),
        sequence_number.to_string(),
        action.to_string(),
        entity_type.to_string(),
        entity_id.unwrap_or_default().to_string(),
        format_timestamp(timestamp),
        previous_hash.unwrap_or(GENESIS_HASH).to_string(),
    ]
    .join("|");

    hex::encode(Sha256::digest(material.as_bytes()))
}

/// Recompute the hash of a stored entry.
pub fn hash_entry(entry: &AuditEntry) -> String {
    compute_hash(
        entry.tenant_id,
        entry.sequence_number,
        &entry.action,
        &entry.entity_type,
        entry.entity_id.as_deref(),
        entry.timestamp,
        Some(&entry.previous_hash),
    )
}

/// Errors in hash chain verification.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChainError {
    #[error("broken link at #{sequence}: expected previous hash '{expected}', got '{actual}'")]
    BrokenLink {
        sequence: u64,
        expected: String,
        actual: String,
    },

    #[error("hash mismatch at #{sequence}: computed '{expected}', stored '{actual}'")]
    InvalidHash {
        sequence: u64,
        expected: String,
        actual: String,
    },

    #[error("sequence gap: expected #{expected}, got #{actual}")]
    InvalidSequence { expected: u64, actual: u64 },
}

/// Verify a tenant's chain, ascending by sequence number.
///
/// The chain must start at #1 anchored on [`GENESIS_HASH`], link each entry to its
/// predecessor, and every stored hash must match its recomputation.
pub fn verify_chain(entries: &[AuditEntry]) -> Result<(), ChainError> {
    let mut prev_hash = GENESIS_HASH.to_string();
    let mut expected_sequence = 1;

    for entry in entries {
        if entry.sequence_number != expected_sequence {
            return Err(ChainError::InvalidSequence {
                expected: expected_sequence,
                actual: entry.sequence_number,
            });
        }

        if entry.previous_hash != prev_hash {
            return Err(ChainError::BrokenLink {
                sequence: entry.sequence_number,
                expected: prev_hash,
                actual: entry.previous_hash.clone(),
            });
        }

        let calculated = hash_entry(entry);
        if entry.hash_chain != calculated {
            return Err(ChainError::InvalidHash {
                sequence: entry.sequence_number,
                expected: calculated,
                actual: entry.hash_chain.clone(),
            });
        }

        prev_hash = entry.hash_chain.clone();
        expected_sequence += 1;
    }

    Ok(())
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuditError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AuditError {
    pub fn class(&self) -> ErrorClass {
        match self {
            AuditError::Store(e) => e.class(),
        }
    }
}

/// Result of verifying one tenant's chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainReport {
    pub tenant_id: TenantId,
    pub format_version: u32,
    pub entries: usize,
    pub head_hash: Option<String>,
    pub valid: bool,
    pub error: Option<ChainError>,
}

/// Chains and persists audit entries through an [`AuditStore`].
#[derive(Clone)]
pub struct AuditChain {
    store: Arc<dyn AuditStore>,
}

impl AuditChain {
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self { store }
    }

    fn chain(entry: NewAuditEntry, sequence_number: u64, previous_hash: Option<String>) -> AuditEntry {
        let timestamp = truncate_to_millis(Utc::now());
        let hash_chain = compute_hash(
            entry.tenant_id,
            sequence_number,
            &entry.action,
            &entry.entity_type,
            entry.entity_id.as_deref(),
            timestamp,
            previous_hash.as_deref(),
        );

        AuditEntry {
            id: Uuid::now_v7(),
            tenant_id: entry.tenant_id,
            sequence_number,
            action: entry.action,
            entity_type: entry.entity_type,
            entity_id: entry.entity_id,
            previous_state: entry.previous_state,
            new_state: entry.new_state,
            metadata: entry.metadata,
            user_id: entry.user_id,
            timestamp,
            previous_hash: previous_hash.unwrap_or_else(|| GENESIS_HASH.to_string()),
            hash_chain,
        }
    }

    /// Append one entry under the tenant's lock.
    #[instrument(skip(self, entry), fields(tenant_id = %entry.tenant_id, action = %entry.action), err)]
    pub async fn write_entry(&self, entry: NewAuditEntry) -> Result<AuditEntry, AuditError> {
        let mut session = self.store.begin(entry.tenant_id).await?;

        let latest = session.latest().await?;
        let (sequence, previous_hash) = match latest {
            Some(prev) => (prev.sequence_number + 1, Some(prev.hash_chain)),
            None => (1, None),
        };

        let chained = Self::chain(entry, sequence, previous_hash);
        session.insert(&chained).await?;
        session.commit().await?;

        Ok(chained)
    }

    /// Append a batch for one tenant: one lock, one latest read, chained in memory.
    ///
    /// Entries whose `tenant_id` differs from `tenant_id` are rejected before anything is
    /// written.
    #[instrument(skip(self, entries), fields(tenant_id = %tenant_id, count = entries.len()), err)]
    pub async fn write_entries(
        &self,
        tenant_id: TenantId,
        entries: Vec<NewAuditEntry>,
    ) -> Result<Vec<AuditEntry>, AuditError> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        if entries.iter().any(|e| e.tenant_id != tenant_id) {
            return Err(StoreError::Conflict("batch spans multiple tenants".to_string()).into());
        }

        let mut session = self.store.begin(tenant_id).await?;
        let latest = session.latest().await?;
        let (mut sequence, mut previous_hash) = match latest {
            Some(prev) => (prev.sequence_number + 1, Some(prev.hash_chain)),
            None => (1, None),
        };

        let mut written = Vec::with_capacity(entries.len());
        for entry in entries {
            let chained = Self::chain(entry, sequence, previous_hash.take());
            session.insert(&chained).await?;
            previous_hash = Some(chained.hash_chain.clone());
            sequence += 1;
            written.push(chained);
        }
        session.commit().await?;

        Ok(written)
    }

    pub async fn entries(&self, tenant_id: TenantId) -> Result<Vec<AuditEntry>, AuditError> {
        Ok(self.store.list(tenant_id).await?)
    }

    /// Load and verify the tenant's full chain.
    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    pub async fn verify_tenant(&self, tenant_id: TenantId) -> Result<ChainReport, AuditError> {
        let entries = self.store.list(tenant_id).await?;
        let result = verify_chain(&entries);
        if let Err(err) = &result {
            tracing::error!(tenant_id = %tenant_id, error = %err, "audit chain verification failed");
        }

        Ok(ChainReport {
            tenant_id,
            format_version: AUDIT_CHAIN_FORMAT_VERSION,
            entries: entries.len(),
            head_hash: entries.last().map(|e| e.hash_chain.clone()),
            valid: result.is_ok(),
            error: result.err(),
        })
    }
}
