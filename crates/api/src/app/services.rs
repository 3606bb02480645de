use std::sync::Arc;

use thiserror::Error;

use loopforge_events::{EventEnvelope, InMemoryEventBus, LifecycleEvent};
use loopforge_infra::{
    AuditChain, AutomationConfig, ConfigError, EventPublisher, GuardrailEngine, ScanDedupeManager,
    StageTransitionEngine,
    store::{
        InMemoryAuditStore, InMemoryKeyValueStore, InMemoryLifecycleStore, KeyValueStore,
        LifecycleStore, PostgresAuditStore, PostgresLifecycleStore, StoreError,
    },
};
use sqlx::PgPool;

#[cfg(feature = "redis")]
use loopforge_infra::{event_bus::RedisPubSubEventBus, store::RedisKeyValueStore};

#[derive(Debug, Error)]
pub enum ServicesError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("database connection failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error("event bus setup failed: {0}")]
    Bus(String),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Backend {
    InMemory,
    Postgres,
    Redis,
}

/// Where each class of state lives.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BackendPlan {
    /// Cards, loops, transition history and the audit chain.
    pub records: Backend,
    /// Dedupe claims, guardrail counters and the event bus.
    pub coordination: Backend,
}

/// Pick backends for `config`. Postgres is always compiled in; Redis only with the `redis` feature.
pub fn plan_backends(config: &AutomationConfig) -> BackendPlan {
    if !config.use_persistent_stores {
        return BackendPlan {
            records: Backend::InMemory,
            coordination: Backend::InMemory,
        };
    }
    BackendPlan {
        records: Backend::Postgres,
        coordination: if cfg!(feature = "redis") {
            Backend::Redis
        } else {
            Backend::InMemory
        },
    }
}

/// Everything the handlers need, shared behind one `Arc`.
pub struct AppServices {
    pub lifecycle: StageTransitionEngine,
    pub guardrails: Arc<GuardrailEngine>,
    pub audit: AuditChain,
}

impl AppServices {
    /// In-memory stores and bus. The lifecycle store is passed in so callers can seed
    /// loops and cards (loops and cards are managed outside this service).
    pub fn in_memory(config: &AutomationConfig, lifecycle: Arc<InMemoryLifecycleStore>) -> Self {
        let kv: Arc<dyn KeyValueStore> = Arc::new(InMemoryKeyValueStore::new());
        let audit = AuditChain::new(Arc::new(InMemoryAuditStore::new()));
        let bus: Arc<InMemoryEventBus<EventEnvelope<LifecycleEvent>>> =
            Arc::new(InMemoryEventBus::new());

        Self::assemble(config, lifecycle, kv, audit, bus)
    }

    fn assemble(
        config: &AutomationConfig,
        lifecycle: Arc<dyn LifecycleStore>,
        kv: Arc<dyn KeyValueStore>,
        audit: AuditChain,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        let dedupe = ScanDedupeManager::with_ttl(kv.clone(), config.dedupe_ttl());
        let engine = StageTransitionEngine::new(lifecycle, audit.clone(), dedupe, publisher)
            .with_dedupe_fail_open(config.dedupe_fail_open);
        let guardrails = Arc::new(GuardrailEngine::new(kv, config.guardrails.clone()));

        Self {
            lifecycle: engine,
            guardrails,
            audit,
        }
    }
}

/// Wire services from configuration.
///
/// `USE_PERSISTENT_STORES=true` selects Postgres for records. Dedupe claims, counters and
/// the bus go to Redis when the `redis` feature is on and stay process-local otherwise.
pub async fn build_services(config: &AutomationConfig) -> Result<AppServices, ServicesError> {
    let plan = plan_backends(config);
    if plan.records == Backend::InMemory {
        tracing::info!("using in-memory stores");
        return Ok(AppServices::in_memory(
            config,
            Arc::new(InMemoryLifecycleStore::new()),
        ));
    }

    let database_url = config
        .database_url
        .as_deref()
        .ok_or(ConfigError::Missing("DATABASE_URL"))?;
    let pool = PgPool::connect(database_url).await?;
    let (kv, publisher) = coordination(config).await?;

    tracing::info!(coordination = ?plan.coordination, "using persistent stores");

    Ok(AppServices::assemble(
        config,
        Arc::new(PostgresLifecycleStore::new(pool.clone())),
        kv,
        AuditChain::new(Arc::new(PostgresAuditStore::new(pool))),
        publisher,
    ))
}

#[cfg(feature = "redis")]
async fn coordination(
    config: &AutomationConfig,
) -> Result<(Arc<dyn KeyValueStore>, Arc<dyn EventPublisher>), ServicesError> {
    let kv: Arc<dyn KeyValueStore> = Arc::new(RedisKeyValueStore::connect(&config.redis_url).await?);
    let bus: Arc<dyn EventPublisher> = Arc::new(
        RedisPubSubEventBus::new(&config.redis_url, config.event_channel_prefix.clone())
            .map_err(|e| ServicesError::Bus(e.to_string()))?,
    );
    tracing::info!(redis_url = %config.redis_url, "using redis for dedupe, counters and events");
    Ok((kv, bus))
}

#[cfg(not(feature = "redis"))]
async fn coordination(
    _config: &AutomationConfig,
) -> Result<(Arc<dyn KeyValueStore>, Arc<dyn EventPublisher>), ServicesError> {
    tracing::warn!(
        "built without the `redis` feature; dedupe claims, guardrail counters and events are per-process"
    );
    let kv: Arc<dyn KeyValueStore> = Arc::new(InMemoryKeyValueStore::new());
    let bus: Arc<dyn EventPublisher> =
        Arc::new(InMemoryEventBus::<EventEnvelope<LifecycleEvent>>::new());
    Ok((kv, bus))
}
