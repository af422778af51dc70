//! Redis-backed idempotency store (`SET key value NX PX ttl`).
//!
//! Keys are `herald:idem:{len(event_id)}:{event_id}:{correlation_id}`; the
//! length prefix keeps ids containing `:` from colliding.

use std::time::Duration;

use chrono::Utc;
use redis::aio::ConnectionManager;
use tracing::instrument;

use herald_core::DeliveryId;

use super::{IdempotencyKey, IdempotencyRecord, IdempotencyStore};
use crate::error::StoreError;

const KEY_PREFIX: &str = "herald:idem";

/// Attempts made when a record expires between `SET NX` and `GET`.
const MAX_INSERT_ROUNDS: usize = 3;

#[derive(Clone)]
pub struct RedisIdempotencyStore {
    conn: ConnectionManager,
}

impl core::fmt::Debug for RedisIdempotencyStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisIdempotencyStore").finish_non_exhaustive()
    }
}

impl RedisIdempotencyStore {
    /// Connect to `redis_url` (e.g. `redis://localhost:6379`).
    pub async fn connect(redis_url: impl AsRef<str>) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(map_redis_error)?;
        let conn = ConnectionManager::new(client).await.map_err(map_redis_error)?;
        Ok(Self { conn })
    }

    fn redis_key(key: &IdempotencyKey) -> String {
        let event_id = key.event_id.as_str();
        format!(
            "{KEY_PREFIX}:{}:{}:{}",
            event_id.len(),
            event_id,
            key.correlation_id
        )
    }
}

#[async_trait::async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    #[instrument(skip(self), fields(key = %key), err)]
    async fn insert_if_absent(
        &self,
        key: &IdempotencyKey,
        owner: DeliveryId,
        ttl: Duration,
    ) -> Result<IdempotencyRecord, StoreError> {
        let redis_key = Self::redis_key(key);
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let mut conn = self.conn.clone();

        for _ in 0..MAX_INSERT_ROUNDS {
            let record = IdempotencyRecord {
                owner,
                seen_at: Utc::now(),
            };
            let value = serde_json::to_string(&record)?;

            let created: Option<String> = redis::cmd("SET")
                .arg(&redis_key)
                .arg(&value)
                .arg("NX")
                .arg("PX")
                .arg(ttl_ms)
                .query_async(&mut conn)
                .await
                .map_err(map_redis_error)?;
            if created.is_some() {
                return Ok(record);
            }

            let existing: Option<String> = redis::cmd("GET")
                .arg(&redis_key)
                .query_async(&mut conn)
                .await
                .map_err(map_redis_error)?;
            if let Some(raw) = existing {
                return Ok(serde_json::from_str(&raw)?);
            }
        }

        Err(StoreError::Conflict(format!(
            "record for {key} kept expiring during insert"
        )))
    }

    #[instrument(skip(self), fields(key = %key), err)]
    async fn get(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(Self::redis_key(key))
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        raw.map(|raw| serde_json::from_str(&raw).map_err(StoreError::from))
            .transpose()
    }
}

fn map_redis_error(err: redis::RedisError) -> StoreError {
    match err.kind() {
        redis::ErrorKind::TypeError => StoreError::Serialization(format!("redis type error: {err}")),
        _ => StoreError::unavailable(format!("redis error: {err}")),
    }
}
