//! At-most-once claims for scan and automation attempts.
//!
//! Per key: absent -> pending -> completed(result) | failed(reason), all TTL-bounded.
//! A pending claim left behind by a crashed writer blocks that key until its TTL lapses.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::instrument;

use loopforge_core::{ErrorClass, TenantId};

use crate::store::{KeyValueStore, StoreError};

pub const DEFAULT_DEDUPE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DedupeError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("corrupt dedupe record under {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

impl DedupeError {
    pub fn class(&self) -> ErrorClass {
        match self {
            DedupeError::Store(e) => e.class(),
            DedupeError::Corrupt { .. } => ErrorClass::TransientInfrastructure,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimStatus {
    Pending,
    Completed,
    Failed,
}

/// Stored claim record (JSON under `dedupe:{card}:{key}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClaimRecord {
    status: ClaimStatus,
    tenant_id: TenantId,
    updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

/// Outcome of [`ScanDedupeManager::check_and_claim`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimResult {
    pub allowed: bool,
    pub was_replay: bool,
    pub existing_status: Option<ClaimStatus>,
    pub cached_result: Option<serde_json::Value>,
}

impl ClaimResult {
    fn won() -> Self {
        Self {
            allowed: true,
            was_replay: false,
            existing_status: None,
            cached_result: None,
        }
    }
}

#[derive(Clone)]
pub struct ScanDedupeManager {
    store: Arc<dyn KeyValueStore>,
    ttl: Duration,
}

impl ScanDedupeManager {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self::with_ttl(store, DEFAULT_DEDUPE_TTL)
    }

    pub fn with_ttl(store: Arc<dyn KeyValueStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn key(card_id: &str, idempotency_key: &str) -> String {
        format!("dedupe:{card_id}:{idempotency_key}")
    }

    fn encode(key: &str, record: &ClaimRecord) -> Result<String, DedupeError> {
        serde_json::to_string(record).map_err(|e| DedupeError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    /// Try to win the claim for `(card_id, idempotency_key)`.
    ///
    /// A `failed` record is re-claimed in place: the overwrite is not conditional, so two
    /// retries racing on a failed key may both proceed.
    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    pub async fn check_and_claim(
        &self,
        card_id: &str,
        idempotency_key: &str,
        tenant_id: TenantId,
    ) -> Result<ClaimResult, DedupeError> {
        let key = Self::key(card_id, idempotency_key);
        let pending = ClaimRecord {
            status: ClaimStatus::Pending,
            tenant_id,
            updated_at: Utc::now(),
            result: None,
            reason: None,
        };
        let encoded = Self::encode(&key, &pending)?;

        if self.store.set_if_absent(&key, &encoded, self.ttl).await? {
            return Ok(ClaimResult::won());
        }

        let Some(raw) = self.store.get(&key).await? else {
            // Expired between the two calls; one more conditional attempt.
            return if self.store.set_if_absent(&key, &encoded, self.ttl).await? {
                Ok(ClaimResult::won())
            } else {
                Ok(ClaimResult {
                    allowed: false,
                    was_replay: false,
                    existing_status: Some(ClaimStatus::Pending),
                    cached_result: None,
                })
            };
        };

        let existing: ClaimRecord = serde_json::from_str(&raw).map_err(|e| DedupeError::Corrupt {
            key: key.clone(),
            reason: e.to_string(),
        })?;

        match existing.status {
            ClaimStatus::Completed => Ok(ClaimResult {
                allowed: false,
                was_replay: true,
                existing_status: Some(ClaimStatus::Completed),
                cached_result: existing.result,
            }),
            ClaimStatus::Pending => Ok(ClaimResult {
                allowed: false,
                was_replay: false,
                existing_status: Some(ClaimStatus::Pending),
                cached_result: None,
            }),
            ClaimStatus::Failed => {
                self.store.set(&key, &encoded, self.ttl).await?;
                Ok(ClaimResult::won())
            }
        }
    }

    /// Record success and cache `result` for replays; refreshes the TTL.
    #[instrument(skip(self, result), fields(tenant_id = %tenant_id), err)]
    pub async fn mark_completed(
        &self,
        card_id: &str,
        idempotency_key: &str,
        tenant_id: TenantId,
        result: serde_json::Value,
    ) -> Result<(), DedupeError> {
        let key = Self::key(card_id, idempotency_key);
        let record = ClaimRecord {
            status: ClaimStatus::Completed,
            tenant_id,
            updated_at: Utc::now(),
            result: Some(result),
            reason: None,
        };
        self.store.set(&key, &Self::encode(&key, &record)?, self.ttl).await?;
        Ok(())
    }

    /// Record failure; the next claim on this key is allowed immediately.
    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    pub async fn mark_failed(
        &self,
        card_id: &str,
        idempotency_key: &str,
        tenant_id: TenantId,
        reason: &str,
    ) -> Result<(), DedupeError> {
        let key = Self::key(card_id, idempotency_key);
        let record = ClaimRecord {
            status: ClaimStatus::Failed,
            tenant_id,
            updated_at: Utc::now(),
            result: None,
            reason: Some(reason.to_string()),
        };
        self.store.set(&key, &Self::encode(&key, &record)?, self.ttl).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryKeyValueStore;
    use serde_json::json;

    fn manager() -> (ScanDedupeManager, Arc<InMemoryKeyValueStore>) {
        let store = Arc::new(InMemoryKeyValueStore::new());
        (ScanDedupeManager::new(store.clone()), store)
    }

    #[tokio::test]
    async fn second_claim_before_completion_is_refused() {
        let (dedupe, _) = manager();
        let tenant = TenantId::new();

        let first = dedupe.check_and_claim("card-1", "k1", tenant).await.unwrap();
        assert!(first.allowed);

        let second = dedupe.check_and_claim("card-1", "k1", tenant).await.unwrap();
        assert!(!second.allowed);
        assert!(!second.was_replay);
        assert_eq!(second.existing_status, Some(ClaimStatus::Pending));
    }

    #[tokio::test]
    async fn completed_claims_replay_cached_result() {
        let (dedupe, _) = manager();
        let tenant = TenantId::new();

        dedupe.check_and_claim("card-1", "k1", tenant).await.unwrap();
        dedupe
            .mark_completed("card-1", "k1", tenant, json!({ "queue": "Order Queue" }))
            .await
            .unwrap();

        for _ in 0..2 {
            let replay = dedupe.check_and_claim("card-1", "k1", tenant).await.unwrap();
            assert!(!replay.allowed);
            assert!(replay.was_replay);
            assert_eq!(replay.cached_result, Some(json!({ "queue": "Order Queue" })));
        }
    }

    #[tokio::test]
    async fn failed_claims_permit_retry() {
        let (dedupe, _) = manager();
        let tenant = TenantId::new();

        dedupe.check_and_claim("card-1", "k1", tenant).await.unwrap();
        dedupe.mark_failed("card-1", "k1", tenant, "supplier api down").await.unwrap();

        let retry = dedupe.check_and_claim("card-1", "k1", tenant).await.unwrap();
        assert!(retry.allowed);

        // The retry is pending again.
        let third = dedupe.check_and_claim("card-1", "k1", tenant).await.unwrap();
        assert_eq!(third.existing_status, Some(ClaimStatus::Pending));
    }

    #[tokio::test]
    async fn keys_are_scoped_per_card() {
        let (dedupe, _) = manager();
        let tenant = TenantId::new();

        assert!(dedupe.check_and_claim("card-1", "k1", tenant).await.unwrap().allowed);
        assert!(dedupe.check_and_claim("card-2", "k1", tenant).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn expired_pending_claim_can_be_won_again() {
        let store = Arc::new(InMemoryKeyValueStore::new());
        let dedupe = ScanDedupeManager::with_ttl(store, Duration::from_millis(20));
        let tenant = TenantId::new();

        assert!(dedupe.check_and_claim("card-1", "k1", tenant).await.unwrap().allowed);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(dedupe.check_and_claim("card-1", "k1", tenant).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn outage_is_surfaced_to_the_caller() {
        let (dedupe, store) = manager();
        store.set_unavailable(true);

        let err = dedupe
            .check_and_claim("card-1", "k1", TenantId::new())
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::TransientInfrastructure);
    }
}
