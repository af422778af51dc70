//! Durable staging store: the queue the producer polls.
//!
//! Rows move through `pending -> claimed -> {acked | pending (release) |
//! scheduled (reinsert)}`. A scheduled row is invisible to `claim` until its
//! `not_before` passes, which is how retry delays are enforced without any
//! stage sleeping on an event.
//!
//! Every claim carries a fresh [`ClaimToken`]. Settling a row (`ack`,
//! `reinsert`, `release`, `renew`) only succeeds while the row is still held
//! under that token, so a holder whose lease expired and was reclaimed
//! elsewhere cannot overwrite the new holder's state.

mod in_memory;
mod postgres;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use herald_core::{CorrelationId, DeliveryId, EventId, WorkerId};
use herald_events::{Category, Event, EventName, Priority};

use crate::error::StoreError;

pub use in_memory::{InMemoryStagingStore, StagedEntry};
pub use postgres::PostgresStagingStore;

/// Identifies one claim of a row; a reclaim of the same row gets a new token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ClaimToken(Uuid);

impl ClaimToken {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ClaimToken {
    fn default() -> Self {
        Self::new()
    }
}

/// The right to settle one staged row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Claim {
    pub delivery_id: DeliveryId,
    pub token: ClaimToken,
}

impl Claim {
    pub fn new(delivery_id: DeliveryId, token: ClaimToken) -> Self {
        Self { delivery_id, token }
    }
}

/// An event handed to one owner by [`StagingStore::claim`].
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedEvent {
    pub claim: Claim,
    pub event: Event,
    pub claimed_at: DateTime<Utc>,
    /// Set when the stored row could not be decoded; `event` is then a
    /// placeholder carrying the raw row.
    pub malformed: Option<String>,
}

impl ClaimedEvent {
    pub fn delivery_id(&self) -> DeliveryId {
        self.claim.delivery_id
    }
}

/// Name given to placeholder events built for undecodable rows.
pub const UNDECODABLE_EVENT_NAME: &str = "herald.staging.undecodable";

/// Stand-in for a stored row that no longer decodes as an [`Event`].
///
/// Keeps the row's event id when it is still a valid id so the dead-letter
/// record can be found under it; the raw document and decode error go into
/// the payload.
pub(crate) fn undecodable_event(event_id: &str, raw: serde_json::Value, error: &str) -> Result<Event, StoreError> {
    let name = EventName::new(UNDECODABLE_EVENT_NAME).map_err(|e| StoreError::Serialization(e.to_string()))?;
    let id = EventId::new(event_id).unwrap_or_else(|_| EventId::generate());
    let correlation_id = CorrelationId::new(id.as_str()).unwrap_or_else(|_| CorrelationId::generate());
    Ok(Event::new(
        name,
        "herald.staging",
        Category::System,
        Priority::Normal,
        correlation_id,
        serde_json::json!({ "raw": raw, "error": error }),
    )
    .with_id(id))
}

fn stale(claim: Claim) -> StoreError {
    StoreError::conflict(format!("delivery {} is no longer held by this claim", claim.delivery_id))
}

/// Row counts by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StagingStats {
    /// Claimable now.
    pub pending: usize,
    /// Waiting for a retry delay to elapse.
    pub scheduled: usize,
    pub claimed: usize,
}

impl StagingStats {
    pub fn total(&self) -> usize {
        self.pending + self.scheduled + self.claimed
    }
}

/// Staging store contract.
///
/// Every operation is atomic per row. `claim` must never hand the same row to
/// two owners, across processes as well as within one.
#[async_trait::async_trait]
pub trait StagingStore: Send + Sync {
    /// Stage a new event as pending. Each call creates a distinct delivery.
    async fn publish(&self, event: Event) -> Result<DeliveryId, StoreError>;

    /// Claim up to `max_n` pending rows whose `not_before` has passed,
    /// oldest first.
    async fn claim(&self, owner: &WorkerId, max_n: usize) -> Result<Vec<ClaimedEvent>, StoreError>;

    /// Remove a delivered or dead-lettered row. A row that is already gone is
    /// a no-op; a row held under another claim is a `Conflict`.
    async fn ack(&self, claim: Claim) -> Result<(), StoreError>;

    /// Put a claimed row back with an updated event, invisible until
    /// `not_before`. `Conflict` unless the row is still held under `claim`.
    async fn reinsert(&self, claim: Claim, event: Event, not_before: DateTime<Utc>) -> Result<(), StoreError>;

    /// Return claimed rows to pending without touching the event. Claims that
    /// are no longer current are skipped.
    async fn release(&self, claims: &[Claim]) -> Result<usize, StoreError>;

    /// Restart the lease of each still-current claim; returns how many were
    /// renewed.
    async fn renew(&self, claims: &[Claim]) -> Result<usize, StoreError>;

    /// Return every row claimed by `owner` to pending.
    async fn release_owned(&self, owner: &WorkerId) -> Result<usize, StoreError>;

    /// Return rows whose claim is older than `lease` to pending.
    async fn release_expired(&self, lease: Duration) -> Result<usize, StoreError>;

    async fn stats(&self) -> Result<StagingStats, StoreError>;
}

#[async_trait::async_trait]
impl<S> StagingStore for Arc<S>
where
    S: StagingStore + ?Sized,
{
    async fn publish(&self, event: Event) -> Result<DeliveryId, StoreError> {
        (**self).publish(event).await
    }

    async fn claim(&self, owner: &WorkerId, max_n: usize) -> Result<Vec<ClaimedEvent>, StoreError> {
        (**self).claim(owner, max_n).await
    }

    async fn ack(&self, claim: Claim) -> Result<(), StoreError> {
        (**self).ack(claim).await
    }

    async fn reinsert(&self, claim: Claim, event: Event, not_before: DateTime<Utc>) -> Result<(), StoreError> {
        (**self).reinsert(claim, event, not_before).await
    }

    async fn release(&self, claims: &[Claim]) -> Result<usize, StoreError> {
        (**self).release(claims).await
    }

    async fn renew(&self, claims: &[Claim]) -> Result<usize, StoreError> {
        (**self).renew(claims).await
    }

    async fn release_owned(&self, owner: &WorkerId) -> Result<usize, StoreError> {
        (**self).release_owned(owner).await
    }

    async fn release_expired(&self, lease: Duration) -> Result<usize, StoreError> {
        (**self).release_expired(lease).await
    }

    async fn stats(&self) -> Result<StagingStats, StoreError> {
        (**self).stats().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn undecodable_rows_keep_their_event_id() {
        let event = undecodable_event("evt-9", json!({"name": 42}), "invalid type").unwrap();
        assert_eq!(event.id().as_str(), "evt-9");
        assert_eq!(event.name().as_str(), UNDECODABLE_EVENT_NAME);
        assert_eq!(event.category(), Category::System);
        assert_eq!(event.payload(), &json!({"raw": {"name": 42}, "error": "invalid type"}));
    }

    #[test]
    fn undecodable_rows_with_bad_ids_get_a_generated_one() {
        let event = undecodable_event("not a valid id!", serde_json::Value::Null, "eof").unwrap();
        assert_ne!(event.id().as_str(), "not a valid id!");
        assert!(!event.id().as_str().is_empty());
    }
}
