//! Redis-backed key/value store (feature `redis`).

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tracing::instrument;

use super::StoreError;
use super::kv::{CounterIncrement, KeyValueStore};

fn map_redis_error(operation: &str, err: redis::RedisError) -> StoreError {
    StoreError::Unavailable(format!("redis {operation}: {err}"))
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Shared across instances: `SET NX PX` for claims, `INCRBYFLOAT` + `PEXPIRE` for counters.
#[derive(Clone)]
pub struct RedisKeyValueStore {
    conn: MultiplexedConnection,
}

impl RedisKeyValueStore {
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url).map_err(|e| map_redis_error("open", e))?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| map_redis_error("connect", e))?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl KeyValueStore for RedisKeyValueStore {
    #[instrument(skip(self, value), err)]
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("set_nx", e))?;
        Ok(reply.is_some())
    }

    #[instrument(skip(self), err)]
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("get", e))
    }

    #[instrument(skip(self, value), err)]
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| map_redis_error("set", e))
    }

    #[instrument(skip(self), err)]
    async fn get_counter(&self, key: &str) -> Result<f64, StoreError> {
        match self.get(key).await? {
            None => Ok(0.0),
            Some(raw) => raw
                .parse::<f64>()
                .map_err(|e| StoreError::Corrupt(format!("counter '{key}': {e}"))),
        }
    }

    #[instrument(skip(self, increments), fields(count = increments.len()), err)]
    async fn increment_batch(&self, increments: &[CounterIncrement]) -> Result<(), StoreError> {
        if increments.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        for inc in increments {
            pipe.cmd("INCRBYFLOAT").arg(&inc.key).arg(inc.by).ignore();
            pipe.cmd("PEXPIRE").arg(&inc.key).arg(ttl_millis(inc.ttl)).ignore();
        }

        let mut conn = self.conn.clone();
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| map_redis_error("increment_batch", e))
    }
}
