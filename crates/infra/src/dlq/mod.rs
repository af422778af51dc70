//! Dead-letter storage and the operator lifecycle around it.
//!
//! Records are terminal. Replaying one publishes a *new* event derived from
//! the snapshot and deletes the record; the record itself never re-enters the
//! live pipeline.

mod in_memory;
mod postgres;
pub mod router;
pub mod sweeper;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use herald_core::{CoreError, DeliveryId, EventId};
use herald_events::{AttemptFailure, Event, FailureReason};

use crate::error::StoreError;

pub use in_memory::InMemoryDlqStore;
pub use postgres::PostgresDlqStore;
pub use router::DlqRouter;
pub use sweeper::DlqSweeper;

/// Default and maximum page size for [`DlqFilter::limit`].
pub const DEFAULT_LIST_LIMIT: usize = 100;
pub const MAX_LIST_LIMIT: usize = 1000;

/// Why an event was dead-lettered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", content = "detail", rename_all = "snake_case")]
pub enum DlqReason {
    /// Failed schema validation before reaching any handler.
    InvalidSchema(String),
    /// No downstream handler is registered for the event's lane.
    UnknownHandler,
    /// The retry budget ran out.
    MaxRetriesExceeded,
    /// The downstream handler reported a permanent failure.
    Rejected(String),
}

impl DlqReason {
    pub fn kind(&self) -> DlqReasonKind {
        match self {
            DlqReason::InvalidSchema(_) => DlqReasonKind::InvalidSchema,
            DlqReason::UnknownHandler => DlqReasonKind::UnknownHandler,
            DlqReason::MaxRetriesExceeded => DlqReasonKind::MaxRetriesExceeded,
            DlqReason::Rejected(_) => DlqReasonKind::Rejected,
        }
    }

    pub fn code(&self) -> &'static str {
        self.kind().as_str()
    }
}

impl core::fmt::Display for DlqReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            DlqReason::InvalidSchema(detail) | DlqReason::Rejected(detail) => {
                write!(f, "{}: {detail}", self.code())
            }
            _ => f.write_str(self.code()),
        }
    }
}

/// Reason codes without detail, for filtering and stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlqReasonKind {
    InvalidSchema,
    UnknownHandler,
    MaxRetriesExceeded,
    Rejected,
}

impl DlqReasonKind {
    pub const ALL: [DlqReasonKind; 4] = [
        DlqReasonKind::InvalidSchema,
        DlqReasonKind::UnknownHandler,
        DlqReasonKind::MaxRetriesExceeded,
        DlqReasonKind::Rejected,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DlqReasonKind::InvalidSchema => "invalid_schema",
            DlqReasonKind::UnknownHandler => "unknown_handler",
            DlqReasonKind::MaxRetriesExceeded => "max_retries_exceeded",
            DlqReasonKind::Rejected => "rejected",
        }
    }
}

impl core::str::FromStr for DlqReasonKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| CoreError::validation(format!("unknown dead-letter reason '{s}'")))
    }
}

/// A dead-lettered event with its failure history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqRecord {
    pub event_id: EventId,
    pub event: Event,
    pub reason: DlqReason,
    pub last_failure: Option<FailureReason>,
    pub failed_at: DateTime<Utc>,
    pub attempts: u32,
    #[serde(default)]
    pub history: Vec<AttemptFailure>,
}

impl DlqRecord {
    pub fn new(event: Event, reason: DlqReason, failed_at: DateTime<Utc>) -> Self {
        Self {
            event_id: event.id().clone(),
            last_failure: event.last_failure().map(|f| f.reason.clone()),
            attempts: event.attempt(),
            history: event.failures().to_vec(),
            event,
            reason,
            failed_at,
        }
    }

    /// Whether the failure that exhausted the budget was environmental.
    pub fn is_transient(&self) -> bool {
        self.last_failure
            .as_ref()
            .is_some_and(FailureReason::is_transient)
    }
}

/// Query over dead-letter records. Results are ordered oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DlqFilter {
    pub reason: Option<DlqReasonKind>,
    /// Inclusive lower bound on `failed_at`.
    pub since: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `failed_at`.
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl DlqFilter {
    pub fn reason(reason: DlqReasonKind) -> Self {
        Self {
            reason: Some(reason),
            ..Default::default()
        }
    }

    pub fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT)
    }

    pub fn matches(&self, record: &DlqRecord) -> bool {
        self.reason.is_none_or(|kind| record.reason.kind() == kind)
            && self.since.is_none_or(|since| record.failed_at >= since)
            && self.until.is_none_or(|until| record.failed_at <= until)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DlqStats {
    pub total: usize,
    pub by_reason: BTreeMap<DlqReasonKind, usize>,
    pub oldest_failed_at: Option<DateTime<Utc>>,
}

/// Result of replaying a dead-letter record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplayReceipt {
    pub original_event_id: EventId,
    pub new_event_id: EventId,
    pub delivery_id: DeliveryId,
}

/// Persistent dead-letter storage, keyed by event id.
///
/// Writes are atomic per key. Only [`DlqRouter`] should call this directly.
#[async_trait::async_trait]
pub trait DlqStore: Send + Sync {
    /// Store a record, replacing any earlier record for the same event id.
    async fn insert(&self, record: DlqRecord) -> Result<(), StoreError>;

    async fn get(&self, event_id: &EventId) -> Result<Option<DlqRecord>, StoreError>;

    async fn list(&self, filter: &DlqFilter) -> Result<Vec<DlqRecord>, StoreError>;

    /// Atomically delete and return a record.
    async fn take(&self, event_id: &EventId) -> Result<Option<DlqRecord>, StoreError>;

    async fn stats(&self) -> Result<DlqStats, StoreError>;
}

#[async_trait::async_trait]
impl<S> DlqStore for Arc<S>
where
    S: DlqStore + ?Sized,
{
    async fn insert(&self, record: DlqRecord) -> Result<(), StoreError> {
        (**self).insert(record).await
    }

    async fn get(&self, event_id: &EventId) -> Result<Option<DlqRecord>, StoreError> {
        (**self).get(event_id).await
    }

    async fn list(&self, filter: &DlqFilter) -> Result<Vec<DlqRecord>, StoreError> {
        (**self).list(filter).await
    }

    async fn take(&self, event_id: &EventId) -> Result<Option<DlqRecord>, StoreError> {
        (**self).take(event_id).await
    }

    async fn stats(&self) -> Result<DlqStats, StoreError> {
        (**self).stats().await
    }
}
