//! Postgres-backed staging store.
//!
//! Claiming uses `FOR UPDATE SKIP LOCKED`, so any number of pipeline
//! instances can poll the same table without handing a row to two owners.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::{instrument, warn};

use herald_core::{DeliveryId, WorkerId};
use herald_events::Event;

use super::{Claim, ClaimToken, ClaimedEvent, StagingStats, StagingStore, stale, undecodable_event};
use crate::error::{StoreError, map_sqlx_error};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS herald_staging (
    delivery_id UUID PRIMARY KEY,
    event_id TEXT NOT NULL,
    event JSONB NOT NULL,
    not_before TIMESTAMPTZ NOT NULL DEFAULT now(),
    claimed_by TEXT NULL,
    claimed_at TIMESTAMPTZ NULL,
    claim_token UUID NULL,
    seq BIGSERIAL NOT NULL
);
ALTER TABLE herald_staging ADD COLUMN IF NOT EXISTS claim_token UUID NULL;
CREATE INDEX IF NOT EXISTS herald_staging_claimable
    ON herald_staging (seq) WHERE claimed_by IS NULL;
CREATE INDEX IF NOT EXISTS herald_staging_claimed_by
    ON herald_staging (claimed_by) WHERE claimed_by IS NOT NULL;
"#;

/// Postgres staging table.
#[derive(Debug, Clone)]
pub struct PostgresStagingStore {
    pool: Arc<PgPool>,
}

impl PostgresStagingStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the staging table and indexes if they do not exist.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }
}

fn claim_columns(claims: &[Claim]) -> (Vec<uuid::Uuid>, Vec<uuid::Uuid>) {
    claims
        .iter()
        .map(|c| (*c.delivery_id.as_uuid(), *c.token.as_uuid()))
        .unzip()
}

#[async_trait::async_trait]
impl StagingStore for PostgresStagingStore {
    #[instrument(skip(self, event), fields(event_id = %event.id()), err)]
    async fn publish(&self, event: Event) -> Result<DeliveryId, StoreError> {
        let delivery_id = DeliveryId::new();
        sqlx::query(
            r#"
            INSERT INTO herald_staging (delivery_id, event_id, event)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(delivery_id.as_uuid())
        .bind(event.id().as_str())
        .bind(Json(&event))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("publish", e))?;
        Ok(delivery_id)
    }

    #[instrument(skip(self), fields(owner = %owner), err)]
    async fn claim(&self, owner: &WorkerId, max_n: usize) -> Result<Vec<ClaimedEvent>, StoreError> {
        if max_n == 0 {
            return Ok(Vec::new());
        }
        let limit = i64::try_from(max_n).unwrap_or(i64::MAX);

        let rows = sqlx::query(
            r#"
            UPDATE herald_staging s
            SET claimed_by = $1, claimed_at = now(), claim_token = gen_random_uuid()
            FROM (
                SELECT delivery_id FROM herald_staging
                WHERE claimed_by IS NULL AND not_before <= now()
                ORDER BY seq
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            ) due
            WHERE s.delivery_id = due.delivery_id
            RETURNING s.delivery_id, s.event_id, s.event, s.claimed_at, s.claim_token, s.seq
            "#,
        )
        .bind(owner.as_str())
        .bind(limit)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim", e))?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in rows {
            let delivery_id: uuid::Uuid = row
                .try_get("delivery_id")
                .map_err(|e| map_sqlx_error("claim", e))?;
            let seq: i64 = row.try_get("seq").map_err(|e| map_sqlx_error("claim", e))?;
            let claimed_at: DateTime<Utc> = row
                .try_get("claimed_at")
                .map_err(|e| map_sqlx_error("claim", e))?;
            let token: uuid::Uuid = row
                .try_get("claim_token")
                .map_err(|e| map_sqlx_error("claim", e))?;
            let claim = Claim::new(DeliveryId::from_uuid(delivery_id), ClaimToken::from_uuid(token));

            // An undecodable row is handed out as a placeholder so the
            // processor dead-letters it instead of it being reclaimed forever.
            let (event, malformed) = match row.try_get::<Json<Event>, _>("event") {
                Ok(Json(event)) => (event, None),
                Err(err) => {
                    warn!(delivery_id = %delivery_id, error = %err, "staged row does not decode as an event");
                    let event_id: String = row.try_get("event_id").unwrap_or_default();
                    let raw = row
                        .try_get::<Json<serde_json::Value>, _>("event")
                        .map(|Json(raw)| raw)
                        .unwrap_or(serde_json::Value::Null);
                    let detail = err.to_string();
                    (undecodable_event(&event_id, raw, &detail)?, Some(detail))
                }
            };
            claimed.push((
                seq,
                ClaimedEvent {
                    claim,
                    event,
                    claimed_at,
                    malformed,
                },
            ));
        }

        claimed.sort_by_key(|(seq, _)| *seq);
        Ok(claimed.into_iter().map(|(_, c)| c).collect())
    }

    #[instrument(skip(self), fields(delivery_id = %claim.delivery_id), err)]
    async fn ack(&self, claim: Claim) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            WITH target AS (
                SELECT delivery_id, claim_token FROM herald_staging WHERE delivery_id = $1
            ), removed AS (
                DELETE FROM herald_staging s
                USING target
                WHERE s.delivery_id = target.delivery_id AND target.claim_token = $2
                RETURNING s.delivery_id
            )
            SELECT
                (SELECT count(*) FROM target) AS present,
                (SELECT count(*) FROM removed) AS removed
            "#,
        )
        .bind(claim.delivery_id.as_uuid())
        .bind(claim.token.as_uuid())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("ack", e))?;

        let present: i64 = result.try_get("present").map_err(|e| map_sqlx_error("ack", e))?;
        let removed: i64 = result.try_get("removed").map_err(|e| map_sqlx_error("ack", e))?;
        if present > 0 && removed == 0 {
            return Err(stale(claim));
        }
        Ok(())
    }

    #[instrument(skip(self, event), fields(delivery_id = %claim.delivery_id, attempt = event.attempt()), err)]
    async fn reinsert(&self, claim: Claim, event: Event, not_before: DateTime<Utc>) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE herald_staging
            SET event = $3,
                not_before = $4,
                claimed_by = NULL,
                claimed_at = NULL,
                claim_token = NULL,
                seq = nextval(pg_get_serial_sequence('herald_staging', 'seq'))
            WHERE delivery_id = $1 AND claim_token = $2
            "#,
        )
        .bind(claim.delivery_id.as_uuid())
        .bind(claim.token.as_uuid())
        .bind(Json(&event))
        .bind(not_before)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reinsert", e))?;
        if result.rows_affected() == 0 {
            return Err(stale(claim));
        }
        Ok(())
    }

    #[instrument(skip(self, claims), fields(count = claims.len()), err)]
    async fn release(&self, claims: &[Claim]) -> Result<usize, StoreError> {
        if claims.is_empty() {
            return Ok(0);
        }
        let (ids, tokens) = claim_columns(claims);
        let result = sqlx::query(
            r#"
            UPDATE herald_staging s
            SET claimed_by = NULL, claimed_at = NULL, claim_token = NULL
            FROM UNNEST($1::uuid[], $2::uuid[]) AS c(delivery_id, claim_token)
            WHERE s.delivery_id = c.delivery_id AND s.claim_token = c.claim_token
            "#,
        )
        .bind(&ids)
        .bind(&tokens)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("release", e))?;
        Ok(result.rows_affected() as usize)
    }

    #[instrument(skip(self, claims), fields(count = claims.len()), err)]
    async fn renew(&self, claims: &[Claim]) -> Result<usize, StoreError> {
        if claims.is_empty() {
            return Ok(0);
        }
        let (ids, tokens) = claim_columns(claims);
        let result = sqlx::query(
            r#"
            UPDATE herald_staging s
            SET claimed_at = now()
            FROM UNNEST($1::uuid[], $2::uuid[]) AS c(delivery_id, claim_token)
            WHERE s.delivery_id = c.delivery_id AND s.claim_token = c.claim_token
            "#,
        )
        .bind(&ids)
        .bind(&tokens)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("renew", e))?;
        Ok(result.rows_affected() as usize)
    }

    #[instrument(skip(self), fields(owner = %owner), err)]
    async fn release_owned(&self, owner: &WorkerId) -> Result<usize, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE herald_staging
            SET claimed_by = NULL, claimed_at = NULL, claim_token = NULL
            WHERE claimed_by = $1
            "#,
        )
        .bind(owner.as_str())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("release_owned", e))?;
        Ok(result.rows_affected() as usize)
    }

    #[instrument(skip(self), err)]
    async fn release_expired(&self, lease: Duration) -> Result<usize, StoreError> {
        let lease_ms = i64::try_from(lease.as_millis()).unwrap_or(i64::MAX);
        let result = sqlx::query(
            r#"
            UPDATE herald_staging
            SET claimed_by = NULL, claimed_at = NULL, claim_token = NULL
            WHERE claimed_by IS NOT NULL
              AND claimed_at <= now() - ($1::bigint * interval '1 millisecond')
            "#,
        )
        .bind(lease_ms)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("release_expired", e))?;
        Ok(result.rows_affected() as usize)
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<StagingStats, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                count(*) FILTER (WHERE claimed_by IS NULL AND not_before <= now()) AS pending,
                count(*) FILTER (WHERE claimed_by IS NULL AND not_before > now()) AS scheduled,
                count(*) FILTER (WHERE claimed_by IS NOT NULL) AS claimed
            FROM herald_staging
            "#,
        )
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let count = |column: &str| -> Result<usize, StoreError> {
            let value: i64 = row.try_get(column).map_err(|e| map_sqlx_error("stats", e))?;
            Ok(value.max(0) as usize)
        };

        Ok(StagingStats {
            pending: count("pending")?,
            scheduled: count("scheduled")?,
            claimed: count("claimed")?,
        })
    }
}
