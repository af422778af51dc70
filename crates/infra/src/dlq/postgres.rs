//! Postgres-backed dead-letter store.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::instrument;

use herald_core::EventId;

use super::{DlqFilter, DlqReasonKind, DlqRecord, DlqStats, DlqStore};
use crate::error::{StoreError, map_sqlx_error};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS herald_dlq (
    event_id TEXT PRIMARY KEY,
    reason_code TEXT NOT NULL,
    failed_at TIMESTAMPTZ NOT NULL,
    record JSONB NOT NULL
);
CREATE INDEX IF NOT EXISTS herald_dlq_reason_failed_at
    ON herald_dlq (reason_code, failed_at);
"#;

#[derive(Debug, Clone)]
pub struct PostgresDlqStore {
    pool: Arc<PgPool>,
}

impl PostgresDlqStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the dead-letter table if it does not exist.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }
}

fn decode_record(row: &sqlx::postgres::PgRow, operation: &str) -> Result<DlqRecord, StoreError> {
    let Json(record): Json<DlqRecord> = row
        .try_get("record")
        .map_err(|e| map_sqlx_error(operation, e))?;
    Ok(record)
}

#[async_trait::async_trait]
impl DlqStore for PostgresDlqStore {
    #[instrument(skip(self, record), fields(event_id = %record.event_id, reason = record.reason.code()), err)]
    async fn insert(&self, record: DlqRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO herald_dlq (event_id, reason_code, failed_at, record)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (event_id) DO UPDATE
            SET reason_code = EXCLUDED.reason_code,
                failed_at = EXCLUDED.failed_at,
                record = EXCLUDED.record
            "#,
        )
        .bind(record.event_id.as_str())
        .bind(record.reason.code())
        .bind(record.failed_at)
        .bind(Json(&record))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("dlq_insert", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(event_id = %event_id), err)]
    async fn get(&self, event_id: &EventId) -> Result<Option<DlqRecord>, StoreError> {
        let row = sqlx::query("SELECT record FROM herald_dlq WHERE event_id = $1")
            .bind(event_id.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("dlq_get", e))?;
        row.map(|row| decode_record(&row, "dlq_get")).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list(&self, filter: &DlqFilter) -> Result<Vec<DlqRecord>, StoreError> {
        let limit = i64::try_from(filter.effective_limit()).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            r#"
            SELECT record FROM herald_dlq
            WHERE ($1::text IS NULL OR reason_code = $1)
              AND ($2::timestamptz IS NULL OR failed_at >= $2)
              AND ($3::timestamptz IS NULL OR failed_at <= $3)
            ORDER BY failed_at ASC, event_id ASC
            LIMIT $4
            "#,
        )
        .bind(filter.reason.map(|kind| kind.as_str()))
        .bind(filter.since)
        .bind(filter.until)
        .bind(limit)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("dlq_list", e))?;

        rows.iter().map(|row| decode_record(row, "dlq_list")).collect()
    }

    #[instrument(skip(self), fields(event_id = %event_id), err)]
    async fn take(&self, event_id: &EventId) -> Result<Option<DlqRecord>, StoreError> {
        let row = sqlx::query("DELETE FROM herald_dlq WHERE event_id = $1 RETURNING record")
            .bind(event_id.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("dlq_take", e))?;
        row.map(|row| decode_record(&row, "dlq_take")).transpose()
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<DlqStats, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT reason_code, count(*) AS total, min(failed_at) AS oldest
            FROM herald_dlq
            GROUP BY reason_code
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("dlq_stats", e))?;

        let mut stats = DlqStats::default();
        for row in rows {
            let code: String = row
                .try_get("reason_code")
                .map_err(|e| map_sqlx_error("dlq_stats", e))?;
            let total: i64 = row.try_get("total").map_err(|e| map_sqlx_error("dlq_stats", e))?;
            let oldest: Option<DateTime<Utc>> = row
                .try_get("oldest")
                .map_err(|e| map_sqlx_error("dlq_stats", e))?;

            let kind: DlqReasonKind = code
                .parse()
                .map_err(|e: herald_core::CoreError| StoreError::Serialization(e.to_string()))?;
            let total = total.max(0) as usize;
            stats.total += total;
            stats.by_reason.insert(kind, total);
            stats.oldest_failed_at = match (stats.oldest_failed_at, oldest) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
        }
        Ok(stats)
    }
}
