use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

use herald_core::DeliveryId;

use super::{IdempotencyKey, IdempotencyRecord, IdempotencyStore};
use crate::chrono_duration;
use crate::error::StoreError;

#[derive(Debug, Clone, Copy)]
struct Entry {
    record: IdempotencyRecord,
    expires_at: DateTime<Utc>,
}

/// In-memory idempotency store for tests/dev.
///
/// Expired entries are treated as absent and overwritten on the next insert;
/// `purge_expired` reclaims the ones never written again.
#[derive(Debug, Default)]
pub struct InMemoryIdempotencyStore {
    entries: Mutex<HashMap<IdempotencyKey, Entry>>,
    unavailable: AtomicBool,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Simulate an outage: every call fails with `Unavailable` until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<IdempotencyKey, Entry>>, StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("idempotency store offline"));
        }
        self.entries.lock().map_err(|_| StoreError::poisoned())
    }
}

#[async_trait::async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn insert_if_absent(
        &self,
        key: &IdempotencyKey,
        owner: DeliveryId,
        ttl: Duration,
    ) -> Result<IdempotencyRecord, StoreError> {
        let mut entries = self.lock()?;
        let now = Utc::now();

        if let Some(existing) = entries.get(key) {
            if existing.expires_at > now {
                return Ok(existing.record);
            }
        }

        let record = IdempotencyRecord {
            owner,
            seen_at: now,
        };
        entries.insert(
            key.clone(),
            Entry {
                record,
                expires_at: now + chrono_duration(ttl),
            },
        );
        Ok(record)
    }

    async fn get(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>, StoreError> {
        let entries = self.lock()?;
        let now = Utc::now();
        Ok(entries
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.record))
    }

    async fn purge_expired(&self) -> Result<usize, StoreError> {
        let mut entries = self.lock()?;
        let now = Utc::now();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        Ok(before - entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_core::{CorrelationId, EventId};

    fn key() -> IdempotencyKey {
        IdempotencyKey::new(EventId::new("evt-1").unwrap(), CorrelationId::new("corr-1").unwrap())
    }

    #[tokio::test]
    async fn first_insert_wins() {
        let store = InMemoryIdempotencyStore::new();
        let a = DeliveryId::new();
        let b = DeliveryId::new();

        let first = store.insert_if_absent(&key(), a, Duration::from_secs(60)).await.unwrap();
        let second = store.insert_if_absent(&key(), b, Duration::from_secs(60)).await.unwrap();
        assert_eq!(first.owner, a);
        assert_eq!(second, first);
    }

    #[tokio::test]
    async fn expired_records_are_replaced() {
        let store = InMemoryIdempotencyStore::new();
        let a = DeliveryId::new();
        let b = DeliveryId::new();

        store.insert_if_absent(&key(), a, Duration::ZERO).await.unwrap();
        assert_eq!(store.get(&key()).await.unwrap(), None);

        let record = store.insert_if_absent(&key(), b, Duration::from_secs(60)).await.unwrap();
        assert_eq!(record.owner, b);
        assert_eq!(store.purge_expired().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn purge_drops_only_expired_records() {
        let store = InMemoryIdempotencyStore::new();
        for i in 0..5 {
            let key = IdempotencyKey::new(
                EventId::new(format!("old-{i}")).unwrap(),
                CorrelationId::new("corr-1").unwrap(),
            );
            store.insert_if_absent(&key, DeliveryId::new(), Duration::from_millis(1)).await.unwrap();
        }
        store.insert_if_absent(&key(), DeliveryId::new(), Duration::from_secs(60)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(store.purge_expired().await.unwrap(), 5);
        assert_eq!(store.len(), 1);
        assert!(store.get(&key()).await.unwrap().is_some());

        store.set_unavailable(true);
        assert!(store.purge_expired().await.unwrap_err().is_unavailable());
    }
}
