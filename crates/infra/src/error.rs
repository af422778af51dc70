//! Store error model shared by the staging, idempotency and dead-letter adapters.

use thiserror::Error;

/// Failure of one of the three shared stores.
///
/// `Unavailable` is the infrastructure case: callers fail closed (pause
/// claiming, release events back to pending) rather than guessing.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }

    /// Lock poisoning in the in-memory adapters surfaces as an outage.
    pub(crate) fn poisoned() -> Self {
        Self::Unavailable("lock poisoned".to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Map SQLx errors onto the shared store taxonomy.
///
/// | SQLx Error | StoreError |
/// |------------|------------|
/// | Database (unique violation `23505`) | `Conflict` |
/// | Decode / ColumnDecode | `Serialization` |
/// | RowNotFound | `NotFound` |
/// | Io, Tls, PoolTimedOut, PoolClosed, other | `Unavailable` |
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Conflict(msg),
                _ => StoreError::Unavailable(msg),
            }
        }
        sqlx::Error::RowNotFound => StoreError::not_found(format!("row not found in {operation}")),
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Serialization(format!("decode error in {operation}: {err}"))
        }
        _ => StoreError::unavailable(format!("sqlx error in {operation}: {err}")),
    }
}
