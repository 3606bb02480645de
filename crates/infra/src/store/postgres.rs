//! Postgres-backed lifecycle and audit stores.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (other) | any | `Unavailable` |
//! | PoolClosed / Io / other | N/A | `Unavailable` |
//!
//! Every query carries `tenant_id` in its predicate.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;
use uuid::Uuid;

use loopforge_core::{CardId, LoopId, TenantId, UserId};
use loopforge_kanban::{Card, KanbanLoop, LinkedOrders, OrderKind, StageTransition, TransitionPlan};

use super::StoreError;
use super::audit::{AuditEntry, AuditSession, AuditStore};
use super::lifecycle::LifecycleStore;

pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Conflict(msg),
                _ => StoreError::Unavailable(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Unavailable(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Corrupt(format!("decode error in {}: {}", operation, err))
        }
        _ => StoreError::Unavailable(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn parse_column<T>(row: &PgRow, column: &str) -> Result<T, StoreError>
where
    T: core::str::FromStr,
    T::Err: core::fmt::Display,
{
    let raw: String = row
        .try_get(column)
        .map_err(|e| map_sqlx_error("decode", e))?;
    raw.parse::<T>()
        .map_err(|e| StoreError::Corrupt(format!("{column}: {e}")))
}

fn to_u64(value: i64, column: &str) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Corrupt(format!("{column} is negative")))
}

fn to_i64(value: u64, column: &str) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::Corrupt(format!("{column} overflows BIGINT")))
}

const CARD_COLUMNS: &str = "id, tenant_id, loop_id, current_stage, current_stage_entered_at, \
     completed_cycles, is_active, linked_purchase_order_id, linked_work_order_id, \
     linked_transfer_order_id";

fn card_from_row(row: &PgRow) -> Result<Card, StoreError> {
    let get = |e| map_sqlx_error("card_from_row", e);
    Ok(Card {
        id: CardId::from_uuid(row.try_get("id").map_err(get)?),
        tenant_id: TenantId::from_uuid(row.try_get("tenant_id").map_err(get)?),
        loop_id: LoopId::from_uuid(row.try_get("loop_id").map_err(get)?),
        current_stage: parse_column(row, "current_stage")?,
        current_stage_entered_at: row.try_get("current_stage_entered_at").map_err(get)?,
        completed_cycles: to_u64(row.try_get("completed_cycles").map_err(get)?, "completed_cycles")?,
        is_active: row.try_get("is_active").map_err(get)?,
        linked_orders: LinkedOrders {
            purchase_order_id: row.try_get("linked_purchase_order_id").map_err(get)?,
            work_order_id: row.try_get("linked_work_order_id").map_err(get)?,
            transfer_order_id: row.try_get("linked_transfer_order_id").map_err(get)?,
        },
    })
}

fn transition_from_row(row: &PgRow) -> Result<StageTransition, StoreError> {
    let get = |e| map_sqlx_error("transition_from_row", e);
    let user: Option<Uuid> = row.try_get("transitioned_by_user_id").map_err(get)?;
    Ok(StageTransition {
        id: row.try_get("id").map_err(get)?,
        tenant_id: TenantId::from_uuid(row.try_get("tenant_id").map_err(get)?),
        card_id: CardId::from_uuid(row.try_get("card_id").map_err(get)?),
        loop_id: LoopId::from_uuid(row.try_get("loop_id").map_err(get)?),
        cycle_number: to_u64(row.try_get("cycle_number").map_err(get)?, "cycle_number")?,
        from_stage: parse_column(row, "from_stage")?,
        to_stage: parse_column(row, "to_stage")?,
        transitioned_at: row.try_get("transitioned_at").map_err(get)?,
        transitioned_by_user_id: user.map(UserId::from_uuid),
        method: parse_column(row, "method")?,
        notes: row.try_get("notes").map_err(get)?,
        metadata: row.try_get("metadata").map_err(get)?,
    })
}

/// Postgres-backed card lifecycle store.
#[derive(Debug, Clone)]
pub struct PostgresLifecycleStore {
    pool: Arc<PgPool>,
}

impl PostgresLifecycleStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl LifecycleStore for PostgresLifecycleStore {
    #[instrument(skip(self), fields(card_id = %card_id), err)]
    async fn find_card(&self, card_id: CardId) -> Result<Option<Card>, StoreError> {
        let row = sqlx::query(&format!("SELECT {CARD_COLUMNS} FROM kanban_cards WHERE id = $1"))
            .bind(card_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_card", e))?;
        row.as_ref().map(card_from_row).transpose()
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, loop_id = %loop_id), err)]
    async fn find_loop(&self, tenant_id: TenantId, loop_id: LoopId) -> Result<Option<KanbanLoop>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, tenant_id, loop_type, is_active
            FROM kanban_loops
            WHERE tenant_id = $1 AND id = $2
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(loop_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_loop", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let get = |e| map_sqlx_error("find_loop", e);
        Ok(Some(KanbanLoop {
            id: LoopId::from_uuid(row.try_get("id").map_err(get)?),
            tenant_id: TenantId::from_uuid(row.try_get("tenant_id").map_err(get)?),
            loop_type: parse_column(&row, "loop_type")?,
            is_active: row.try_get("is_active").map_err(get)?,
        }))
    }

    #[instrument(
        skip(self, plan, transition),
        fields(
            tenant_id = %transition.tenant_id,
            card_id = %plan.card_id,
            from = %plan.from,
            to = %plan.to
        ),
        err
    )]
    async fn commit_transition(
        &self,
        plan: &TransitionPlan,
        transition: &StageTransition,
    ) -> Result<Card, StoreError> {
        let link_for = |kind: OrderKind| {
            plan.link
                .as_ref()
                .filter(|l| l.kind == kind)
                .map(|l| l.order_id.clone())
        };

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        // Optimistic guard: the card must still be in `plan.from`.
        let row = sqlx::query(&format!(
            r#"
            UPDATE kanban_cards SET
                current_stage = $3,
                current_stage_entered_at = $4,
                completed_cycles = completed_cycles + CASE WHEN $5 THEN 1 ELSE 0 END,
                linked_purchase_order_id =
                    CASE WHEN $5 THEN NULL ELSE COALESCE($6, linked_purchase_order_id) END,
                linked_work_order_id =
                    CASE WHEN $5 THEN NULL ELSE COALESCE($7, linked_work_order_id) END,
                linked_transfer_order_id =
                    CASE WHEN $5 THEN NULL ELSE COALESCE($8, linked_transfer_order_id) END,
                updated_at = now()
            WHERE id = $1 AND tenant_id = $2 AND current_stage = $9
            RETURNING {CARD_COLUMNS}
            "#
        ))
        .bind(plan.card_id.as_uuid())
        .bind(transition.tenant_id.as_uuid())
        .bind(plan.to.as_str())
        .bind(plan.entered_at)
        .bind(plan.completes_cycle)
        .bind(link_for(OrderKind::PurchaseOrder))
        .bind(link_for(OrderKind::WorkOrder))
        .bind(link_for(OrderKind::TransferOrder))
        .bind(plan.from.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("update_card", e))?;

        let Some(row) = row else {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(StoreError::Conflict(format!(
                "card {} is no longer in stage {}",
                plan.card_id, plan.from
            )));
        };
        let card = card_from_row(&row)?;

        sqlx::query(
            r#"
            INSERT INTO card_stage_transitions (
                id, tenant_id, card_id, loop_id, cycle_number, from_stage, to_stage,
                transitioned_at, transitioned_by_user_id, method, notes, metadata
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(transition.id)
        .bind(transition.tenant_id.as_uuid())
        .bind(transition.card_id.as_uuid())
        .bind(transition.loop_id.as_uuid())
        .bind(to_i64(transition.cycle_number, "cycle_number")?)
        .bind(transition.from_stage.as_str())
        .bind(transition.to_stage.as_str())
        .bind(transition.transitioned_at)
        .bind(transition.transitioned_by_user_id.map(Uuid::from))
        .bind(transition.method.as_str())
        .bind(transition.notes.as_deref())
        .bind(&transition.metadata)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_transition", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;

        Ok(card)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, card_id = %card_id), err)]
    async fn list_transitions(
        &self,
        tenant_id: TenantId,
        card_id: CardId,
    ) -> Result<Vec<StageTransition>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, tenant_id, card_id, loop_id, cycle_number, from_stage, to_stage,
                   transitioned_at, transitioned_by_user_id, method, notes, metadata
            FROM card_stage_transitions
            WHERE tenant_id = $1 AND card_id = $2
            ORDER BY transitioned_at ASC, id ASC
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(card_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_transitions", e))?;

        rows.iter().map(transition_from_row).collect()
    }
}

const AUDIT_COLUMNS: &str = "id, tenant_id, sequence_number, action, entity_type, entity_id, \
     previous_state, new_state, metadata, user_id, timestamp, previous_hash, hash_chain";

fn audit_from_row(row: &PgRow) -> Result<AuditEntry, StoreError> {
    let get = |e| map_sqlx_error("audit_from_row", e);
    let user: Option<Uuid> = row.try_get("user_id").map_err(get)?;
    let timestamp: DateTime<Utc> = row.try_get("timestamp").map_err(get)?;
    Ok(AuditEntry {
        id: row.try_get("id").map_err(get)?,
        tenant_id: TenantId::from_uuid(row.try_get("tenant_id").map_err(get)?),
        sequence_number: to_u64(row.try_get("sequence_number").map_err(get)?, "sequence_number")?,
        action: row.try_get("action").map_err(get)?,
        entity_type: row.try_get("entity_type").map_err(get)?,
        entity_id: row.try_get("entity_id").map_err(get)?,
        previous_state: row.try_get("previous_state").map_err(get)?,
        new_state: row.try_get("new_state").map_err(get)?,
        metadata: row.try_get("metadata").map_err(get)?,
        user_id: user.map(UserId::from_uuid),
        timestamp,
        previous_hash: row.try_get("previous_hash").map_err(get)?,
        hash_chain: row.try_get("hash_chain").map_err(get)?,
    })
}

/// Advisory lock key for a tenant's audit chain.
fn tenant_lock_key(tenant_id: TenantId) -> i64 {
    let (hi, lo) = tenant_id.as_uuid().as_u64_pair();
    (hi ^ lo) as i64
}

/// Postgres-backed audit store; sessions serialize on `pg_advisory_xact_lock`.
#[derive(Debug, Clone)]
pub struct PostgresAuditStore {
    pool: Arc<PgPool>,
}

impl PostgresAuditStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

struct PostgresAuditSession {
    tenant_id: TenantId,
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl AuditSession for PostgresAuditSession {
    async fn latest(&mut self) -> Result<Option<AuditEntry>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {AUDIT_COLUMNS} FROM audit_log WHERE tenant_id = $1 \
             ORDER BY sequence_number DESC LIMIT 1"
        ))
        .bind(self.tenant_id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("audit_latest", e))?;
        row.as_ref().map(audit_from_row).transpose()
    }

    async fn insert(&mut self, entry: &AuditEntry) -> Result<(), StoreError> {
        sqlx::query(&format!(
            "INSERT INTO audit_log ({AUDIT_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"
        ))
        .bind(entry.id)
        .bind(entry.tenant_id.as_uuid())
        .bind(to_i64(entry.sequence_number, "sequence_number")?)
        .bind(&entry.action)
        .bind(&entry.entity_type)
        .bind(entry.entity_id.as_deref())
        .bind(entry.previous_state.as_ref())
        .bind(entry.new_state.as_ref())
        .bind(&entry.metadata)
        .bind(entry.user_id.map(Uuid::from))
        .bind(entry.timestamp)
        .bind(&entry.previous_hash)
        .bind(&entry.hash_chain)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("audit_insert", e))?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("audit_commit", e))
    }
}

#[async_trait]
impl AuditStore for PostgresAuditStore {
    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn begin(&self, tenant_id: TenantId) -> Result<Box<dyn AuditSession>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(tenant_lock_key(tenant_id))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("advisory_lock", e))?;

        Ok(Box::new(PostgresAuditSession { tenant_id, tx }))
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn list(&self, tenant_id: TenantId) -> Result<Vec<AuditEntry>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {AUDIT_COLUMNS} FROM audit_log WHERE tenant_id = $1 ORDER BY sequence_number ASC"
        ))
        .bind(tenant_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("audit_list", e))?;

        rows.iter().map(audit_from_row).collect()
    }
}
