//! Holding area for automation actions that exhausted their retries.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use loopforge_automation::ActionType;
use loopforge_core::{TenantId, UserId};

use crate::store::StoreError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewItem {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub rule_id: String,
    pub action_type: ActionType,
    pub entity_id: String,
    pub idempotency_key: String,
    pub attempts: u32,
    pub last_error: String,
    pub context: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<UserId>,
}

#[async_trait]
pub trait ReviewQueue: Send + Sync {
    async fn enqueue(&self, item: ReviewItem) -> Result<(), StoreError>;

    /// Items for a tenant, oldest first.
    async fn list(&self, tenant_id: TenantId, include_resolved: bool) -> Result<Vec<ReviewItem>, StoreError>;

    /// Mark an item resolved. `None` when the tenant has no such item.
    async fn resolve(
        &self,
        tenant_id: TenantId,
        item_id: Uuid,
        resolved_by: Option<UserId>,
    ) -> Result<Option<ReviewItem>, StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryReviewQueue {
    items: RwLock<HashMap<Uuid, ReviewItem>>,
}

impl InMemoryReviewQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> StoreError {
    StoreError::Unavailable("in-memory review queue lock poisoned".to_string())
}

#[async_trait]
impl ReviewQueue for InMemoryReviewQueue {
    async fn enqueue(&self, item: ReviewItem) -> Result<(), StoreError> {
        let mut items = self.items.write().map_err(|_| poisoned())?;
        if items.contains_key(&item.id) {
            return Err(StoreError::Conflict(format!("review item {} already queued", item.id)));
        }
        items.insert(item.id, item);
        Ok(())
    }

    async fn list(&self, tenant_id: TenantId, include_resolved: bool) -> Result<Vec<ReviewItem>, StoreError> {
        let items = self.items.read().map_err(|_| poisoned())?;
        let mut out: Vec<ReviewItem> = items
            .values()
            .filter(|i| i.tenant_id == tenant_id)
            .filter(|i| include_resolved || i.resolved_at.is_none())
            .cloned()
            .collect();
        out.sort_by_key(|i| (i.enqueued_at, i.id));
        Ok(out)
    }

    async fn resolve(
        &self,
        tenant_id: TenantId,
        item_id: Uuid,
        resolved_by: Option<UserId>,
    ) -> Result<Option<ReviewItem>, StoreError> {
        let mut items = self.items.write().map_err(|_| poisoned())?;
        let Some(item) = items.get_mut(&item_id).filter(|i| i.tenant_id == tenant_id) else {
            return Ok(None);
        };
        if item.resolved_at.is_none() {
            item.resolved_at = Some(Utc::now());
            item.resolved_by = resolved_by;
        }
        Ok(Some(item.clone()))
    }
}
