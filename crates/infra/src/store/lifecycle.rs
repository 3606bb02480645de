//! Card/loop persistence and the transition history.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use loopforge_core::{CardId, LoopId, TenantId};
use loopforge_kanban::{Card, KanbanLoop, StageTransition, TransitionPlan};

use super::StoreError;

#[async_trait]
pub trait LifecycleStore: Send + Sync {
    async fn find_card(&self, card_id: CardId) -> Result<Option<Card>, StoreError>;

    async fn find_loop(&self, tenant_id: TenantId, loop_id: LoopId) -> Result<Option<KanbanLoop>, StoreError>;

    /// Atomically insert `transition` and apply `plan` to the card.
    ///
    /// The card update is guarded by `current_stage = plan.from`; a lost race fails with
    /// [`StoreError::Conflict`] and writes nothing. Returns the updated card.
    async fn commit_transition(
        &self,
        plan: &TransitionPlan,
        transition: &StageTransition,
    ) -> Result<Card, StoreError>;

    /// Transition history for a card, oldest first.
    async fn list_transitions(
        &self,
        tenant_id: TenantId,
        card_id: CardId,
    ) -> Result<Vec<StageTransition>, StoreError>;
}

#[async_trait]
impl<S> LifecycleStore for Arc<S>
where
    S: LifecycleStore + ?Sized,
{
    async fn find_card(&self, card_id: CardId) -> Result<Option<Card>, StoreError> {
        (**self).find_card(card_id).await
    }

    async fn find_loop(&self, tenant_id: TenantId, loop_id: LoopId) -> Result<Option<KanbanLoop>, StoreError> {
        (**self).find_loop(tenant_id, loop_id).await
    }

    async fn commit_transition(
        &self,
        plan: &TransitionPlan,
        transition: &StageTransition,
    ) -> Result<Card, StoreError> {
        (**self).commit_transition(plan, transition).await
    }

    async fn list_transitions(
        &self,
        tenant_id: TenantId,
        card_id: CardId,
    ) -> Result<Vec<StageTransition>, StoreError> {
        (**self).list_transitions(tenant_id, card_id).await
    }
}

#[derive(Debug, Default)]
struct Tables {
    cards: HashMap<CardId, Card>,
    loops: HashMap<LoopId, KanbanLoop>,
    transitions: Vec<StageTransition>,
}

/// In-memory lifecycle store for tests/dev.
///
/// A single write lock makes each commit atomic.
#[derive(Debug, Default)]
pub struct InMemoryLifecycleStore {
    inner: RwLock<Tables>,
}

impl InMemoryLifecycleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed or replace a loop (loops are managed outside this subsystem).
    pub fn upsert_loop(&self, kanban_loop: KanbanLoop) {
        if let Ok(mut t) = self.inner.write() {
            t.loops.insert(kanban_loop.id, kanban_loop);
        }
    }

    /// Seed or replace a card. Also how external deactivation is modelled.
    pub fn upsert_card(&self, card: Card) {
        if let Ok(mut t) = self.inner.write() {
            t.cards.insert(card.id, card);
        }
    }

    fn poisoned() -> StoreError {
        StoreError::Unavailable("in-memory lifecycle store lock poisoned".to_string())
    }
}

#[async_trait]
impl LifecycleStore for InMemoryLifecycleStore {
    async fn find_card(&self, card_id: CardId) -> Result<Option<Card>, StoreError> {
        let t = self.inner.read().map_err(|_| Self::poisoned())?;
        Ok(t.cards.get(&card_id).cloned())
    }

    async fn find_loop(&self, tenant_id: TenantId, loop_id: LoopId) -> Result<Option<KanbanLoop>, StoreError> {
        let t = self.inner.read().map_err(|_| Self::poisoned())?;
        Ok(t.loops
            .get(&loop_id)
            .filter(|l| l.tenant_id == tenant_id)
            .cloned())
    }

    async fn commit_transition(
        &self,
        plan: &TransitionPlan,
        transition: &StageTransition,
    ) -> Result<Card, StoreError> {
        let mut t = self.inner.write().map_err(|_| Self::poisoned())?;

        let card = t
            .cards
            .get_mut(&plan.card_id)
            .filter(|c| c.tenant_id == transition.tenant_id)
            .ok_or_else(|| StoreError::Conflict(format!("card {} disappeared", plan.card_id)))?;

        if card.current_stage != plan.from {
            return Err(StoreError::Conflict(format!(
                "card {} moved to {} before {} -> {} committed",
                plan.card_id, card.current_stage, plan.from, plan.to
            )));
        }

        plan.apply(card);
        let updated = card.clone();
        t.transitions.push(transition.clone());

        Ok(updated)
    }

    async fn list_transitions(
        &self,
        tenant_id: TenantId,
        card_id: CardId,
    ) -> Result<Vec<StageTransition>, StoreError> {
        let t = self.inner.read().map_err(|_| Self::poisoned())?;
        let mut out: Vec<StageTransition> = t
            .transitions
            .iter()
            .filter(|tr| tr.tenant_id == tenant_id && tr.card_id == card_id)
            .cloned()
            .collect();
        out.sort_by_key(|tr| tr.transitioned_at);
        Ok(out)
    }
}
