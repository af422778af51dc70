//! Duplicate suppression keyed by `(event_id, correlation_id)`.
//!
//! A record remembers which delivery created it. A retry of that delivery is
//! not a duplicate; any other delivery carrying the same key is. Records are
//! never updated, only created and expired.

mod in_memory;
#[cfg(feature = "redis")]
mod redis_store;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use herald_core::{CorrelationId, DeliveryId, EventId};
use herald_events::Event;

use crate::error::StoreError;

pub use in_memory::InMemoryIdempotencyStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisIdempotencyStore;

/// Default lifetime of an idempotency record: 24 hours.
pub const DEFAULT_DEDUP_TTL_MS: u64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey {
    pub event_id: EventId,
    pub correlation_id: CorrelationId,
}

impl IdempotencyKey {
    pub fn new(event_id: EventId, correlation_id: CorrelationId) -> Self {
        Self {
            event_id,
            correlation_id,
        }
    }

    pub fn for_event(event: &Event) -> Self {
        Self::new(event.id().clone(), event.correlation_id().clone())
    }
}

impl core::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.event_id, self.correlation_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub owner: DeliveryId,
    pub seen_at: DateTime<Utc>,
}

/// Key-value backend for the guard.
#[async_trait::async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Atomically create a record for `key` owned by `owner` unless a live one
    /// exists. Returns whichever record is live afterwards.
    async fn insert_if_absent(
        &self,
        key: &IdempotencyKey,
        owner: DeliveryId,
        ttl: Duration,
    ) -> Result<IdempotencyRecord, StoreError>;

    async fn get(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>, StoreError>;

    /// Drop expired records; returns how many were removed. Backends with
    /// native expiry keep the default.
    async fn purge_expired(&self) -> Result<usize, StoreError> {
        Ok(0)
    }
}

#[async_trait::async_trait]
impl<S> IdempotencyStore for Arc<S>
where
    S: IdempotencyStore + ?Sized,
{
    async fn insert_if_absent(
        &self,
        key: &IdempotencyKey,
        owner: DeliveryId,
        ttl: Duration,
    ) -> Result<IdempotencyRecord, StoreError> {
        (**self).insert_if_absent(key, owner, ttl).await
    }

    async fn get(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>, StoreError> {
        (**self).get(key).await
    }

    async fn purge_expired(&self) -> Result<usize, StoreError> {
        (**self).purge_expired().await
    }
}

/// What to do when the guard cannot answer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupFailurePolicy {
    /// Skip the event without marking it and hand it back to pending.
    #[default]
    FailClosed,
    /// Process the event without marking it.
    FailOpen,
}

/// The guard could not tell whether the key was seen.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("idempotency state unknown for {key}: {source}")]
pub struct UnknownDedupState {
    pub key: String,
    #[source]
    pub source: StoreError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupDecision {
    /// First delivery of this key, or a retry of the delivery that owns it.
    Fresh,
    /// Another delivery already owns this key.
    Duplicate { owner: DeliveryId },
}

/// Seen/mark API over an [`IdempotencyStore`].
///
/// Safe to share between any number of processor workers: the only write is
/// the store's atomic insert.
#[derive(Clone)]
pub struct IdempotencyGuard {
    store: Arc<dyn IdempotencyStore>,
    ttl: Duration,
}

impl core::fmt::Debug for IdempotencyGuard {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IdempotencyGuard")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn IdempotencyStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Whether a live record exists. Store failures are reported as unknown,
    /// never as `false`.
    pub async fn seen(
        &self,
        event_id: &EventId,
        correlation_id: &CorrelationId,
    ) -> Result<bool, UnknownDedupState> {
        let key = IdempotencyKey::new(event_id.clone(), correlation_id.clone());
        self.store
            .get(&key)
            .await
            .map(|record| record.is_some())
            .map_err(|source| unknown(&key, source))
    }

    /// Record the key for `owner`. Marking an already-marked key is a no-op.
    pub async fn mark(
        &self,
        event_id: &EventId,
        correlation_id: &CorrelationId,
        owner: DeliveryId,
    ) -> Result<(), UnknownDedupState> {
        let key = IdempotencyKey::new(event_id.clone(), correlation_id.clone());
        self.store
            .insert_if_absent(&key, owner, self.ttl)
            .await
            .map(|_| ())
            .map_err(|source| unknown(&key, source))
    }

    /// Compare-and-set used by the processor: marks the key for `delivery_id`
    /// if unclaimed and reports whether this delivery may proceed.
    pub async fn check_and_mark(
        &self,
        event: &Event,
        delivery_id: DeliveryId,
    ) -> Result<DedupDecision, UnknownDedupState> {
        let key = IdempotencyKey::for_event(event);
        let record = self
            .store
            .insert_if_absent(&key, delivery_id, self.ttl)
            .await
            .map_err(|source| unknown(&key, source))?;

        if record.owner == delivery_id {
            Ok(DedupDecision::Fresh)
        } else {
            debug!(key = %key, owner = %record.owner, delivery_id = %delivery_id, "duplicate delivery");
            Ok(DedupDecision::Duplicate {
                owner: record.owner,
            })
        }
    }
}

fn unknown(key: &IdempotencyKey, source: StoreError) -> UnknownDedupState {
    UnknownDedupState {
        key: key.to_string(),
        source,
    }
}
