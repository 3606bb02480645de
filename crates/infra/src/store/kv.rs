//! Key/value + counter store used for dedupe claims and guardrail counters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::StoreError;

/// One counter bump in a batched increment.
#[derive(Debug, Clone, PartialEq)]
pub struct CounterIncrement {
    pub key: String,
    pub by: f64,
    /// Expiry (re)applied to the counter with every increment.
    pub ttl: Duration,
}

impl CounterIncrement {
    pub fn new(key: impl Into<String>, by: f64, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            by,
            ttl,
        }
    }
}

/// Shared key/value store with atomic conditional set and TTL-bounded counters.
///
/// Every call is a suspension point and may fail with [`StoreError::Unavailable`].
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Atomically write `value` if `key` is absent. `true` when this call won.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Unconditional write, replacing value and TTL.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Current counter value; absent counters read as zero.
    async fn get_counter(&self, key: &str) -> Result<f64, StoreError>;

    /// Apply all increments in one round trip (pipelined where the backend allows).
    async fn increment_batch(&self, increments: &[CounterIncrement]) -> Result<(), StoreError>;
}

#[async_trait]
impl<S> KeyValueStore for Arc<S>
where
    S: KeyValueStore + ?Sized,
{
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        (**self).set_if_absent(key, value, ttl).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        (**self).set(key, value, ttl).await
    }

    async fn get_counter(&self, key: &str) -> Result<f64, StoreError> {
        (**self).get_counter(key).await
    }

    async fn increment_batch(&self, increments: &[CounterIncrement]) -> Result<(), StoreError> {
        (**self).increment_batch(increments).await
    }
}

#[derive(Debug, Clone)]
struct Slot {
    value: String,
    /// `None` when the TTL runs past what `Instant` can represent.
    expires_at: Option<Instant>,
}

impl Slot {
    fn new(value: String, now: Instant, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: now.checked_add(ttl),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

const DEFAULT_PURGE_EVERY: u64 = 256;

/// In-memory key/value store for tests/dev.
///
/// Dead keys are ignored on read; every `purge_every`-th write also sweeps them out.
#[derive(Debug)]
pub struct InMemoryKeyValueStore {
    inner: Mutex<HashMap<String, Slot>>,
    unavailable: AtomicBool,
    writes: AtomicU64,
    purge_every: u64,
}

impl Default for InMemoryKeyValueStore {
    fn default() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            unavailable: AtomicBool::new(false),
            writes: AtomicU64::new(0),
            purge_every: DEFAULT_PURGE_EVERY,
        }
    }
}

impl InMemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_purge_every(mut self, writes: u64) -> Self {
        self.purge_every = writes.max(1);
        self
    }

    /// Simulate an outage: every subsequent call fails with `Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Entries held, expired ones included until the next sweep.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Slot>>, StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store marked unavailable".to_string()));
        }
        self.inner
            .lock()
            .map_err(|_| StoreError::Unavailable("in-memory store lock poisoned".to_string()))
    }

    fn after_write(&self, map: &mut HashMap<String, Slot>, now: Instant) {
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % self.purge_every == 0 {
            map.retain(|_, slot| slot.is_live(now));
        }
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut map = self.lock()?;
        if map.get(key).is_some_and(|slot| slot.is_live(now)) {
            return Ok(false);
        }
        map.insert(key.to_string(), Slot::new(value.to_string(), now, ttl));
        self.after_write(&mut map, now);
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = Instant::now();
        let map = self.lock()?;
        Ok(map
            .get(key)
            .filter(|slot| slot.is_live(now))
            .map(|slot| slot.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let now = Instant::now();
        let mut map = self.lock()?;
        map.insert(key.to_string(), Slot::new(value.to_string(), now, ttl));
        self.after_write(&mut map, now);
        Ok(())
    }

    async fn get_counter(&self, key: &str) -> Result<f64, StoreError> {
        match self.get(key).await? {
            None => Ok(0.0),
            Some(raw) => raw
                .parse::<f64>()
                .map_err(|e| StoreError::Corrupt(format!("counter '{key}': {e}"))),
        }
    }

    async fn increment_batch(&self, increments: &[CounterIncrement]) -> Result<(), StoreError> {
        let now = Instant::now();
        let mut map = self.lock()?;
        for inc in increments {
            let current = match map.get(&inc.key).filter(|slot| slot.is_live(now)) {
                Some(slot) => slot
                    .value
                    .parse::<f64>()
                    .map_err(|e| StoreError::Corrupt(format!("counter '{}': {e}", inc.key)))?,
                None => 0.0,
            };
            map.insert(inc.key.clone(), Slot::new((current + inc.by).to_string(), now, inc.ttl));
        }
        self.after_write(&mut map, now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_if_absent_has_one_winner() {
        let store = InMemoryKeyValueStore::new();
        let ttl = Duration::from_secs(60);
        assert!(store.set_if_absent("k", "a", ttl).await.unwrap());
        assert!(!store.set_if_absent("k", "b", ttl).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn expired_keys_are_absent() {
        let store = InMemoryKeyValueStore::new();
        store.set("k", "v", Duration::from_millis(5)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.set_if_absent("k", "w", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn counters_accumulate_in_batches() {
        let store = InMemoryKeyValueStore::new();
        let ttl = Duration::from_secs(60);
        store
            .increment_batch(&[
                CounterIncrement::new("orders", 1.0, ttl),
                CounterIncrement::new("value", 250.5, ttl),
            ])
            .await
            .unwrap();
        store
            .increment_batch(&[CounterIncrement::new("orders", 1.0, ttl)])
            .await
            .unwrap();

        assert_eq!(store.get_counter("orders").await.unwrap(), 2.0);
        assert_eq!(store.get_counter("value").await.unwrap(), 250.5);
        assert_eq!(store.get_counter("missing").await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn expired_entries_are_swept_on_write() {
        let store = InMemoryKeyValueStore::new().with_purge_every(4);
        for key in ["a", "b", "c"] {
            store.set(key, "v", Duration::from_millis(5)).await.unwrap();
        }
        assert_eq!(store.len(), 3);
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Fourth write triggers the sweep.
        store.set("live", "v", Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("live").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn huge_ttls_never_expire() {
        let store = InMemoryKeyValueStore::new();
        store.set("k", "v", Duration::MAX).await.unwrap();
        assert!(!store.set_if_absent("k", "w", Duration::MAX).await.unwrap());
        store
            .increment_batch(&[CounterIncrement::new("n", 1.0, Duration::MAX)])
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(store.get_counter("n").await.unwrap(), 1.0);
    }

    #[tokio::test]
    async fn outage_surfaces_as_unavailable() {
        let store = InMemoryKeyValueStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.get("k").await,
            Err(StoreError::Unavailable(_))
        ));
    }
}
