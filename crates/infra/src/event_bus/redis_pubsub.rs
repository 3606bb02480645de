//! Redis pub/sub-backed event bus (optional).
//!
//! Note: Redis pub/sub is not durable (messages can be dropped if subscribers
//! are offline). The lifecycle store and the audit chain remain the source of truth.
//!
//! Each envelope is published on its tenant's channel (`<prefix>:<tenant_id>`);
//! subscriptions pattern-match `<prefix>:*`.

use std::sync::mpsc;
use std::thread;

use redis::Commands;
use serde::Serialize;
use serde::de::DeserializeOwned;

use loopforge_events::{EventBus, EventEnvelope, Subscription, tenant_channel};

#[derive(Debug, thiserror::Error)]
pub enum RedisBusError {
    #[error("redis error: {0}")]
    Redis(String),
    #[error("serialize error: {0}")]
    Serialize(String),
}

/// Redis pub/sub bus for JSON event envelopes.
#[derive(Debug, Clone)]
pub struct RedisPubSubEventBus {
    client: redis::Client,
    prefix: String,
}

impl RedisPubSubEventBus {
    pub fn new(redis_url: impl AsRef<str>, prefix: impl Into<String>) -> Result<Self, RedisBusError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| RedisBusError::Redis(e.to_string()))?;
        Ok(Self {
            client,
            prefix: prefix.into(),
        })
    }
}

impl<E> EventBus<EventEnvelope<E>> for RedisPubSubEventBus
where
    E: Serialize + DeserializeOwned + Send + 'static,
{
    type Error = RedisBusError;

    fn publish(&self, message: EventEnvelope<E>) -> Result<(), Self::Error> {
        let channel = tenant_channel(&self.prefix, message.tenant_id());
        let payload = serde_json::to_string(&message)
            .map_err(|e| RedisBusError::Serialize(e.to_string()))?;

        let mut conn = self
            .client
            .get_connection()
            .map_err(|e| RedisBusError::Redis(e.to_string()))?;

        let _: i64 = conn
            .publish(channel, payload)
            .map_err(|e| RedisBusError::Redis(e.to_string()))?;

        Ok(())
    }

    fn subscribe(&self) -> Subscription<EventEnvelope<E>> {
        let (tx, rx) = mpsc::channel();

        let client = self.client.clone();
        let pattern = format!("{}:*", self.prefix);

        // Background thread that receives pub/sub messages and forwards them.
        thread::spawn(move || {
            let mut conn = match client.get_connection() {
                Ok(c) => c,
                Err(err) => {
                    tracing::warn!(error = %err, "redis subscription connect failed");
                    return;
                }
            };

            let mut pubsub = conn.as_pubsub();
            if let Err(err) = pubsub.psubscribe(&pattern) {
                tracing::warn!(error = %err, pattern = %pattern, "redis psubscribe failed");
                return;
            }

            loop {
                let msg = match pubsub.get_message() {
                    Ok(m) => m,
                    Err(_) => return,
                };

                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(_) => continue,
                };

                let envelope: EventEnvelope<E> = match serde_json::from_str(&payload) {
                    Ok(e) => e,
                    Err(err) => {
                        tracing::debug!(error = %err, "dropping undecodable envelope");
                        continue;
                    }
                };

                if tx.send(envelope).is_err() {
                    return;
                }
            }
        });

        Subscription::new(rx)
    }
}
