//! Append-only audit entry persistence with per-tenant write sessions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use loopforge_core::{TenantId, UserId};

use super::StoreError;

/// A persisted, chained audit record.
///
/// `user_id` is stored alongside but is not part of the hash contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub sequence_number: u64,
    pub action: String,
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub previous_state: Option<serde_json::Value>,
    pub new_state: Option<serde_json::Value>,
    pub metadata: serde_json::Value,
    pub user_id: Option<UserId>,
    pub timestamp: DateTime<Utc>,
    pub previous_hash: String,
    pub hash_chain: String,
}

/// An audit record before sequencing and hashing.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAuditEntry {
    pub tenant_id: TenantId,
    pub action: String,
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub previous_state: Option<serde_json::Value>,
    pub new_state: Option<serde_json::Value>,
    pub metadata: serde_json::Value,
    pub user_id: Option<UserId>,
}

impl NewAuditEntry {
    pub fn new(tenant_id: TenantId, action: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self {
            tenant_id,
            action: action.into(),
            entity_type: entity_type.into(),
            entity_id: None,
            previous_state: None,
            new_state: None,
            metadata: serde_json::Value::Object(Default::default()),
            user_id: None,
        }
    }

    pub fn entity_id(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn previous_state(mut self, state: serde_json::Value) -> Self {
        self.previous_state = Some(state);
        self
    }

    pub fn new_state(mut self, state: serde_json::Value) -> Self {
        self.new_state = Some(state);
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn user_id(mut self, user_id: Option<UserId>) -> Self {
        self.user_id = user_id;
        self
    }
}

/// A write session holding the tenant's exclusive audit lock.
///
/// Dropping a session without `commit` discards its inserts and releases the lock.
#[async_trait]
pub trait AuditSession: Send {
    /// Highest-sequence entry for the session's tenant.
    async fn latest(&mut self) -> Result<Option<AuditEntry>, StoreError>;

    async fn insert(&mut self, entry: &AuditEntry) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Open a session, blocking until the tenant's lock is acquired.
    async fn begin(&self, tenant_id: TenantId) -> Result<Box<dyn AuditSession>, StoreError>;

    /// Full chain for a tenant, ascending by sequence number.
    async fn list(&self, tenant_id: TenantId) -> Result<Vec<AuditEntry>, StoreError>;
}

#[async_trait]
impl<S> AuditStore for Arc<S>
where
    S: AuditStore + ?Sized,
{
    async fn begin(&self, tenant_id: TenantId) -> Result<Box<dyn AuditSession>, StoreError> {
        (**self).begin(tenant_id).await
    }

    async fn list(&self, tenant_id: TenantId) -> Result<Vec<AuditEntry>, StoreError> {
        (**self).list(tenant_id).await
    }
}

type Chains = Arc<Mutex<HashMap<TenantId, Vec<AuditEntry>>>>;

/// In-memory audit store for tests/dev.
///
/// Per-tenant `tokio::sync::Mutex` stands in for the advisory lock.
#[derive(Debug, Default)]
pub struct InMemoryAuditStore {
    chains: Chains,
    locks: Mutex<HashMap<TenantId, Arc<tokio::sync::Mutex<()>>>>,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tenant_lock(&self, tenant_id: TenantId) -> Result<Arc<tokio::sync::Mutex<()>>, StoreError> {
        let mut locks = self.locks.lock().map_err(|_| poisoned())?;
        Ok(locks.entry(tenant_id).or_default().clone())
    }

    /// Overwrite a stored entry in place. Only useful to simulate tampering.
    pub fn replace_entry(&self, entry: AuditEntry) -> Result<(), StoreError> {
        let mut chains = self.chains.lock().map_err(|_| poisoned())?;
        let chain = chains
            .get_mut(&entry.tenant_id)
            .ok_or_else(|| StoreError::Conflict("no chain for tenant".to_string()))?;
        let slot = chain
            .iter_mut()
            .find(|e| e.sequence_number == entry.sequence_number)
            .ok_or_else(|| StoreError::Conflict(format!("no entry #{}", entry.sequence_number)))?;
        *slot = entry;
        Ok(())
    }
}

fn poisoned() -> StoreError {
    StoreError::Unavailable("in-memory audit store lock poisoned".to_string())
}

struct InMemoryAuditSession {
    tenant_id: TenantId,
    chains: Chains,
    pending: Vec<AuditEntry>,
    _guard: OwnedMutexGuard<()>,
}

#[async_trait]
impl AuditSession for InMemoryAuditSession {
    async fn latest(&mut self) -> Result<Option<AuditEntry>, StoreError> {
        if let Some(last) = self.pending.last() {
            return Ok(Some(last.clone()));
        }
        let chains = self.chains.lock().map_err(|_| poisoned())?;
        Ok(chains
            .get(&self.tenant_id)
            .and_then(|chain| chain.last())
            .cloned())
    }

    async fn insert(&mut self, entry: &AuditEntry) -> Result<(), StoreError> {
        if entry.tenant_id != self.tenant_id {
            return Err(StoreError::Conflict("entry belongs to another tenant".to_string()));
        }
        self.pending.push(entry.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        let mut chains = this.chains.lock().map_err(|_| poisoned())?;
        let chain = chains.entry(this.tenant_id).or_default();

        let mut expected = chain.last().map(|e| e.sequence_number).unwrap_or(0) + 1;
        for entry in &this.pending {
            if entry.sequence_number != expected {
                return Err(StoreError::Conflict(format!(
                    "audit sequence {} already taken or out of order (expected {expected})",
                    entry.sequence_number
                )));
            }
            expected += 1;
        }

        chain.extend(this.pending);
        Ok(())
    }
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn begin(&self, tenant_id: TenantId) -> Result<Box<dyn AuditSession>, StoreError> {
        let lock = self.tenant_lock(tenant_id)?;
        let guard = lock.lock_owned().await;
        Ok(Box::new(InMemoryAuditSession {
            tenant_id,
            chains: self.chains.clone(),
            pending: Vec::new(),
            _guard: guard,
        }))
    }

    async fn list(&self, tenant_id: TenantId) -> Result<Vec<AuditEntry>, StoreError> {
        let chains = self.chains.lock().map_err(|_| poisoned())?;
        Ok(chains.get(&tenant_id).cloned().unwrap_or_default())
    }
}
