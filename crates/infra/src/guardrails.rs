//! Guardrail enforcement against TTL-bucketed tenant counters.
//!
//! Checks read counters and defer to the pure policy in `loopforge-automation`; the
//! `record_*` calls bump counters after the guarded action is accepted. Check and record
//! are two separate steps, so concurrent actions can overshoot a limit slightly.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::instrument;

use loopforge_automation::{
    FinancialCounters, GuardrailCheckResult, GuardrailPolicy, OrderGuardrailInput,
    OutboundCounters, OutboundGuardrailInput, evaluate_financial, evaluate_outbound,
    recipient_domain,
};
use loopforge_core::{ErrorClass, TenantId};

use crate::store::{CounterIncrement, KeyValueStore, StoreError};

const DAY_BUCKET_TTL: Duration = Duration::from_secs(25 * 60 * 60);
const HOUR_BUCKET_TTL: Duration = Duration::from_secs(2 * 60 * 60);
const DUPLICATE_WINDOW: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GuardrailError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl GuardrailError {
    pub fn class(&self) -> ErrorClass {
        match self {
            GuardrailError::Store(e) => e.class(),
        }
    }
}

fn day_bucket(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d").to_string()
}

fn hour_bucket(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%dT%H").to_string()
}

fn supplier_orders_key(tenant: TenantId, supplier: &str, now: DateTime<Utc>) -> String {
    format!("guardrail:{tenant}:supplier:{supplier}:orders:{}", day_bucket(now))
}

fn order_value_key(tenant: TenantId, now: DateTime<Utc>) -> String {
    format!("guardrail:{tenant}:order_value:{}", day_bucket(now))
}

fn tenant_actions_key(tenant: TenantId, now: DateTime<Utc>) -> String {
    format!("guardrail:{tenant}:actions:{}", hour_bucket(now))
}

fn recipient_key(tenant: TenantId, recipient: &str, now: DateTime<Utc>) -> String {
    format!("guardrail:{tenant}:email:{recipient}:{}", hour_bucket(now))
}

fn duplicate_key(tenant: TenantId, order_id: &str, recipient: &str) -> String {
    format!("guardrail:{tenant}:email_dup:{order_id}:{recipient}")
}

fn normalize_recipient(recipient: &str) -> String {
    recipient.trim().to_ascii_lowercase()
}

pub struct GuardrailEngine {
    store: Arc<dyn KeyValueStore>,
    default_policy: GuardrailPolicy,
    overrides: RwLock<HashMap<TenantId, GuardrailPolicy>>,
}

impl GuardrailEngine {
    pub fn new(store: Arc<dyn KeyValueStore>, default_policy: GuardrailPolicy) -> Self {
        Self {
            store,
            default_policy,
            overrides: RwLock::new(HashMap::new()),
        }
    }

    /// Replace a tenant's policy (tenant-configurable guardrails).
    ///
    /// Overrides live in this process only; they are not persisted or shared between replicas.
    pub fn set_tenant_policy(&self, tenant_id: TenantId, policy: GuardrailPolicy) {
        // A map insert cannot leave the table half-written, so a poisoned lock is still usable.
        self.overrides
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(tenant_id, policy);
    }

    pub fn policy_for(&self, tenant_id: TenantId) -> GuardrailPolicy {
        self.overrides
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&tenant_id)
            .cloned()
            .unwrap_or_else(|| self.default_policy.clone())
    }

    pub async fn check_financial(
        &self,
        tenant_id: TenantId,
        input: &OrderGuardrailInput,
    ) -> Result<GuardrailCheckResult, GuardrailError> {
        self.check_financial_at(tenant_id, input, Utc::now()).await
    }

    #[instrument(skip(self, input), fields(tenant_id = %tenant_id), err)]
    pub async fn check_financial_at(
        &self,
        tenant_id: TenantId,
        input: &OrderGuardrailInput,
        now: DateTime<Utc>,
    ) -> Result<GuardrailCheckResult, GuardrailError> {
        let policy = self.policy_for(tenant_id);

        let supplier_orders_today = match input.supplier_id.as_deref() {
            Some(supplier) => {
                self.store
                    .get_counter(&supplier_orders_key(tenant_id, supplier, now))
                    .await?
            }
            None => 0.0,
        };
        let counters = FinancialCounters {
            supplier_orders_today,
            tenant_order_value_today: self.store.get_counter(&order_value_key(tenant_id, now)).await?,
            tenant_actions_this_hour: self.store.get_counter(&tenant_actions_key(tenant_id, now)).await?,
        };

        let result = evaluate_financial(&policy, input, counters);
        if !result.passed {
            tracing::info!(
                tenant_id = %tenant_id,
                violations = result.violations.len(),
                "financial guardrails blocked action"
            );
        }
        Ok(result)
    }

    pub async fn check_outbound(
        &self,
        tenant_id: TenantId,
        input: &OutboundGuardrailInput,
    ) -> Result<GuardrailCheckResult, GuardrailError> {
        self.check_outbound_at(tenant_id, input, Utc::now()).await
    }

    #[instrument(skip(self, input), fields(tenant_id = %tenant_id), err)]
    pub async fn check_outbound_at(
        &self,
        tenant_id: TenantId,
        input: &OutboundGuardrailInput,
        now: DateTime<Utc>,
    ) -> Result<GuardrailCheckResult, GuardrailError> {
        let policy = self.policy_for(tenant_id);

        // Invalid syntax short-circuits before any counter read.
        if recipient_domain(&input.recipient).is_none() {
            return Ok(evaluate_outbound(&policy, input, OutboundCounters::default()));
        }

        let recipient = normalize_recipient(&input.recipient);
        let duplicate_sent = match input.order_id.as_deref() {
            Some(order_id) => self
                .store
                .get(&duplicate_key(tenant_id, order_id, &recipient))
                .await?
                .is_some(),
            None => false,
        };
        let counters = OutboundCounters {
            duplicate_sent,
            recipient_sent_this_hour: self
                .store
                .get_counter(&recipient_key(tenant_id, &recipient, now))
                .await?,
            tenant_actions_this_hour: self.store.get_counter(&tenant_actions_key(tenant_id, now)).await?,
        };

        let result = evaluate_outbound(&policy, input, counters);
        if !result.passed {
            tracing::info!(
                tenant_id = %tenant_id,
                violations = result.violations.len(),
                "outbound guardrails blocked action"
            );
        }
        Ok(result)
    }

    pub async fn record_order_created(
        &self,
        tenant_id: TenantId,
        input: &OrderGuardrailInput,
    ) -> Result<(), GuardrailError> {
        self.record_order_created_at(tenant_id, input, Utc::now()).await
    }

    /// Bump supplier/day, value/day and tenant/hour counters in one batch.
    #[instrument(skip(self, input), fields(tenant_id = %tenant_id), err)]
    pub async fn record_order_created_at(
        &self,
        tenant_id: TenantId,
        input: &OrderGuardrailInput,
        now: DateTime<Utc>,
    ) -> Result<(), GuardrailError> {
        let mut increments = vec![
            CounterIncrement::new(order_value_key(tenant_id, now), input.total_amount, DAY_BUCKET_TTL),
            CounterIncrement::new(tenant_actions_key(tenant_id, now), 1.0, HOUR_BUCKET_TTL),
        ];
        if let Some(supplier) = input.supplier_id.as_deref() {
            increments.push(CounterIncrement::new(
                supplier_orders_key(tenant_id, supplier, now),
                1.0,
                DAY_BUCKET_TTL,
            ));
        }

        self.store.increment_batch(&increments).await?;
        Ok(())
    }

    pub async fn record_email_sent(
        &self,
        tenant_id: TenantId,
        input: &OutboundGuardrailInput,
    ) -> Result<(), GuardrailError> {
        self.record_email_sent_at(tenant_id, input, Utc::now()).await
    }

    /// Bump recipient/hour and tenant/hour counters and set the duplicate marker.
    #[instrument(skip(self, input), fields(tenant_id = %tenant_id), err)]
    pub async fn record_email_sent_at(
        &self,
        tenant_id: TenantId,
        input: &OutboundGuardrailInput,
        now: DateTime<Utc>,
    ) -> Result<(), GuardrailError> {
        let recipient = normalize_recipient(&input.recipient);
        self.store
            .increment_batch(&[
                CounterIncrement::new(recipient_key(tenant_id, &recipient, now), 1.0, HOUR_BUCKET_TTL),
                CounterIncrement::new(tenant_actions_key(tenant_id, now), 1.0, HOUR_BUCKET_TTL),
            ])
            .await?;

        if let Some(order_id) = input.order_id.as_deref() {
            self.store
                .set(&duplicate_key(tenant_id, order_id, &recipient), "1", DUPLICATE_WINDOW)
                .await?;
        }
        Ok(())
    }

    /// Count a non-order, non-email action against the tenant's hourly cap.
    pub async fn record_action(&self, tenant_id: TenantId) -> Result<(), GuardrailError> {
        let now = Utc::now();
        self.store
            .increment_batch(&[CounterIncrement::new(
                tenant_actions_key(tenant_id, now),
                1.0,
                HOUR_BUCKET_TTL,
            )])
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryKeyValueStore;
    use chrono::TimeZone;
    use loopforge_automation::guardrail::{
        DUPLICATE_EMAIL, EMAIL_ADDRESS_INVALID, EMAIL_DOMAIN_NOT_ALLOWED,
        MAX_EMAILS_PER_RECIPIENT_PER_HOUR, MAX_ORDERS_PER_SUPPLIER_PER_DAY,
    };

    fn engine(policy: GuardrailPolicy) -> (GuardrailEngine, Arc<InMemoryKeyValueStore>) {
        let store = Arc::new(InMemoryKeyValueStore::new());
        (GuardrailEngine::new(store.clone(), policy), store)
    }

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 10, 15, 0).unwrap()
    }

    fn order(supplier: &str, amount: f64) -> OrderGuardrailInput {
        OrderGuardrailInput {
            supplier_id: Some(supplier.to_string()),
            total_amount: amount,
            is_expedited: false,
        }
    }

    fn email(recipient: &str, order_id: Option<&str>) -> OutboundGuardrailInput {
        OutboundGuardrailInput {
            recipient: recipient.to_string(),
            order_id: order_id.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn fifth_order_for_supplier_hits_daily_limit() {
        let (engine, _) = engine(GuardrailPolicy::default());
        let tenant = TenantId::new();

        for _ in 0..5 {
            let check = engine.check_financial_at(tenant, &order("s-1", 100.0), at()).await.unwrap();
            assert!(check.passed);
            engine.record_order_created_at(tenant, &order("s-1", 100.0), at()).await.unwrap();
        }

        let check = engine.check_financial_at(tenant, &order("s-1", 100.0), at()).await.unwrap();
        assert!(!check.passed);
        let v = check
            .violations
            .iter()
            .find(|v| v.guardrail_id == MAX_ORDERS_PER_SUPPLIER_PER_DAY)
            .unwrap();
        assert_eq!(v.current_value, 5.0);
        assert_eq!(v.threshold, 5.0);

        // Other suppliers and the next day are unaffected.
        assert!(engine.check_financial_at(tenant, &order("s-2", 100.0), at()).await.unwrap().passed);
        let tomorrow = at() + chrono::Duration::days(1);
        assert!(engine.check_financial_at(tenant, &order("s-1", 100.0), tomorrow).await.unwrap().passed);
    }

    #[tokio::test]
    async fn counters_are_tenant_scoped() {
        let (engine, _) = engine(GuardrailPolicy::default());
        let a = TenantId::new();
        for _ in 0..5 {
            engine.record_order_created_at(a, &order("s-1", 10.0), at()).await.unwrap();
        }
        assert!(engine.check_financial_at(TenantId::new(), &order("s-1", 10.0), at()).await.unwrap().passed);
    }

    #[tokio::test]
    async fn empty_allow_list_blocks_all_outbound() {
        let (engine, _) = engine(GuardrailPolicy::default());
        let tenant = TenantId::new();

        for recipient in ["buyer@acme.com", "ops@supplier.io", "x@y.org"] {
            let check = engine.check_outbound_at(tenant, &email(recipient, None), at()).await.unwrap();
            assert!(!check.passed);
            assert!(check.violations.iter().any(|v| v.guardrail_id == EMAIL_DOMAIN_NOT_ALLOWED));
        }
    }

    #[tokio::test]
    async fn invalid_address_short_circuits_without_store_access() {
        let (engine, store) = engine(GuardrailPolicy::default());
        store.set_unavailable(true);

        let check = engine
            .check_outbound_at(TenantId::new(), &email("not-an-address", Some("po-1")), at())
            .await
            .unwrap();
        assert_eq!(check.violations.len(), 1);
        assert_eq!(check.violations[0].guardrail_id, EMAIL_ADDRESS_INVALID);
    }

    #[tokio::test]
    async fn duplicate_and_per_recipient_limits() {
        let (engine, _) = engine(GuardrailPolicy {
            allowed_email_domains: vec!["supplier.io".to_string()],
            ..GuardrailPolicy::default()
        });
        let tenant = TenantId::new();
        let first = email("Orders@Supplier.io", Some("po-1"));

        assert!(engine.check_outbound_at(tenant, &first, at()).await.unwrap().passed);
        engine.record_email_sent_at(tenant, &first, at()).await.unwrap();

        let again = engine
            .check_outbound_at(tenant, &email("orders@supplier.io", Some("po-1")), at())
            .await
            .unwrap();
        assert!(again.violations.iter().any(|v| v.guardrail_id == DUPLICATE_EMAIL));

        for order_id in ["po-2", "po-3"] {
            engine
                .record_email_sent_at(tenant, &email("orders@supplier.io", Some(order_id)), at())
                .await
                .unwrap();
        }
        let capped = engine
            .check_outbound_at(tenant, &email("orders@supplier.io", Some("po-4")), at())
            .await
            .unwrap();
        assert!(capped.violations.iter().any(|v| v.guardrail_id == MAX_EMAILS_PER_RECIPIENT_PER_HOUR));
    }

    #[tokio::test]
    async fn tenant_override_replaces_default_policy() {
        let (engine, _) = engine(GuardrailPolicy::default());
        let tenant = TenantId::new();
        engine.set_tenant_policy(
            tenant,
            GuardrailPolicy {
                max_auto_approve_amount: 50.0,
                ..GuardrailPolicy::default()
            },
        );

        assert!(!engine.check_financial_at(tenant, &order("s-1", 100.0), at()).await.unwrap().passed);
        assert!(engine.check_financial_at(TenantId::new(), &order("s-1", 100.0), at()).await.unwrap().passed);
    }

    #[test]
    fn overrides_survive_a_poisoned_lock() {
        let (engine, _) = engine(GuardrailPolicy::default());
        let engine = Arc::new(engine);
        let writer = engine.clone();
        let _ = std::thread::spawn(move || {
            let _guard = writer.overrides.write().unwrap();
            panic!("writer died holding the lock");
        })
        .join();
        assert!(engine.overrides.is_poisoned());

        let tenant = TenantId::new();
        let policy = GuardrailPolicy {
            max_orders_per_supplier_per_day: 1,
            ..GuardrailPolicy::default()
        };
        engine.set_tenant_policy(tenant, policy.clone());
        assert_eq!(engine.policy_for(tenant), policy);
        assert_eq!(engine.policy_for(TenantId::new()), GuardrailPolicy::default());
    }

    #[tokio::test]
    async fn counter_outage_is_an_error() {
        let (engine, store) = engine(GuardrailPolicy::default());
        store.set_unavailable(true);
        let err = engine
            .check_financial_at(TenantId::new(), &order("s-1", 1.0), at())
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::TransientInfrastructure);
    }
}
