//! The only component that reads or writes dead-letter records.

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};

use herald_core::EventId;
use herald_events::Event;

use super::{DlqFilter, DlqReason, DlqRecord, DlqStats, DlqStore, ReplayReceipt};
use crate::error::StoreError;
use crate::staging::{Claim, StagingStore};
use crate::telemetry::{Signal, Telemetry};

/// Routes terminal failures into the dead-letter store and serves the
/// operator query/replay/delete surface.
#[derive(Clone)]
pub struct DlqRouter {
    store: Arc<dyn DlqStore>,
    staging: Arc<dyn StagingStore>,
    telemetry: Telemetry,
}

impl core::fmt::Debug for DlqRouter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DlqRouter").finish_non_exhaustive()
    }
}

impl DlqRouter {
    pub fn new(store: Arc<dyn DlqStore>, staging: Arc<dyn StagingStore>, telemetry: Telemetry) -> Self {
        Self {
            store,
            staging,
            telemetry,
        }
    }

    /// Persist `event` as dead-lettered and remove its delivery from staging.
    ///
    /// On error nothing was written and the caller still holds the claim.
    pub async fn route(&self, claim: Claim, event: Event, reason: DlqReason) -> Result<(), StoreError> {
        let event_id = event.id().clone();
        let attempts = event.attempt();
        let record = DlqRecord::new(event, reason.clone(), Utc::now());
        self.store.insert(record).await?;

        if let Err(err) = self.staging.ack(claim).await {
            // The record is stored; a redelivery would be dead-lettered again
            // and overwrite it.
            error!(event_id = %event_id, delivery_id = %claim.delivery_id, error = %err, "dead-lettered event still staged");
        }

        warn!(event_id = %event_id, reason = %reason, attempts, "event dead-lettered");
        self.telemetry.emit(Signal::Dlq {
            event_id,
            reason: reason.code().to_string(),
        });
        Ok(())
    }

    pub async fn get(&self, event_id: &EventId) -> Result<Option<DlqRecord>, StoreError> {
        self.store.get(event_id).await
    }

    pub async fn list(&self, filter: &DlqFilter) -> Result<Vec<DlqRecord>, StoreError> {
        self.store.list(filter).await
    }

    pub async fn stats(&self) -> Result<DlqStats, StoreError> {
        self.store.stats().await
    }

    /// Publish a fresh event from the record's snapshot and delete the record.
    ///
    /// The record is taken first so concurrent replays of the same id cannot
    /// both publish; if publishing fails it is put back.
    pub async fn replay(&self, event_id: &EventId) -> Result<ReplayReceipt, StoreError> {
        let record = self
            .store
            .take(event_id)
            .await?
            .ok_or_else(|| StoreError::not_found(format!("dead-letter record {event_id}")))?;

        let fresh = record.event.replayed();
        let new_event_id = fresh.id().clone();

        match self.staging.publish(fresh).await {
            Ok(delivery_id) => {
                info!(
                    event_id = %event_id,
                    new_event_id = %new_event_id,
                    delivery_id = %delivery_id,
                    "dead-letter record replayed"
                );
                Ok(ReplayReceipt {
                    original_event_id: event_id.clone(),
                    new_event_id,
                    delivery_id,
                })
            }
            Err(err) => {
                if let Err(restore_err) = self.store.insert(record).await {
                    error!(event_id = %event_id, error = %restore_err, "failed to restore dead-letter record after failed replay");
                }
                Err(err)
            }
        }
    }

    /// Delete a record without replaying it.
    pub async fn delete(&self, event_id: &EventId) -> Result<DlqRecord, StoreError> {
        let record = self
            .store
            .take(event_id)
            .await?
            .ok_or_else(|| StoreError::not_found(format!("dead-letter record {event_id}")))?;
        info!(event_id = %event_id, reason = record.reason.code(), "dead-letter record deleted");
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dlq::{DlqReasonKind, InMemoryDlqStore};
    use crate::staging::InMemoryStagingStore;
    use crate::telemetry::CollectingSink;
    use herald_core::{CorrelationId, WorkerId};
    use herald_events::{Category, EventName, FailureReason, Priority};
    use serde_json::json;

    struct Fixture {
        staging: Arc<InMemoryStagingStore>,
        store: Arc<InMemoryDlqStore>,
        router: DlqRouter,
    }

    fn fixture(telemetry: Telemetry) -> Fixture {
        let staging = InMemoryStagingStore::arc();
        let store = InMemoryDlqStore::arc();
        let router = DlqRouter::new(store.clone(), staging.clone(), telemetry);
        Fixture {
            staging,
            store,
            router,
        }
    }

    fn event() -> Event {
        Event::new(
            EventName::new("ml.run.started").unwrap(),
            "trainer",
            Category::Domain,
            Priority::High,
            CorrelationId::new("corr-1").unwrap(),
            json!({"run": 1}),
        )
        .with_id(EventId::new("evt-1").unwrap())
    }

    async fn staged(fx: &Fixture) -> (Claim, Event) {
        fx.staging.publish(event()).await.unwrap();
        let claimed = fx
            .staging
            .claim(&WorkerId::new("w1").unwrap(), 1)
            .await
            .unwrap()
            .remove(0);
        (claimed.claim, claimed.event)
    }

    #[tokio::test]
    async fn route_stores_record_and_acks_delivery() {
        let sink = Arc::new(CollectingSink::new());
        let (telemetry, task) = Telemetry::spawn(sink.clone(), 16);
        let fx = fixture(telemetry);
        let (claim, mut event) = staged(&fx).await;
        event.record_failure(FailureReason::Timeout, Utc::now());

        fx.router
            .route(claim, event, DlqReason::MaxRetriesExceeded)
            .await
            .unwrap();

        assert!(fx.staging.is_empty());
        let record = fx.router.get(&EventId::new("evt-1").unwrap()).await.unwrap().unwrap();
        assert_eq!(record.reason, DlqReason::MaxRetriesExceeded);
        assert_eq!(record.history.len(), 1);

        drop(fx);
        task.await.unwrap();
        assert_eq!(
            sink.signals(),
            vec![Signal::Dlq {
                event_id: EventId::new("evt-1").unwrap(),
                reason: "max_retries_exceeded".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn route_failure_leaves_delivery_staged() {
        let fx = fixture(Telemetry::noop());
        let (claim, event) = staged(&fx).await;
        fx.store.set_unavailable(true);

        let err = fx
            .router
            .route(claim, event, DlqReason::UnknownHandler)
            .await
            .unwrap_err();
        assert!(err.is_unavailable());
        assert_eq!(fx.staging.len(), 1);
    }

    #[tokio::test]
    async fn replay_publishes_fresh_event_and_deletes_record() {
        let fx = fixture(Telemetry::noop());
        let (claim, mut event) = staged(&fx).await;
        event.advance_attempt(FailureReason::Timeout, Utc::now());
        fx.router
            .route(claim, event, DlqReason::MaxRetriesExceeded)
            .await
            .unwrap();

        let original = EventId::new("evt-1").unwrap();
        let receipt = fx.router.replay(&original).await.unwrap();
        assert_eq!(receipt.original_event_id, original);
        assert_ne!(receipt.new_event_id, original);
        assert!(fx.router.get(&original).await.unwrap().is_none());

        let staged = fx.staging.get(receipt.delivery_id).unwrap();
        assert_eq!(staged.event.attempt(), 1);
        assert_eq!(staged.event.replay_of(), Some(&original));
        assert_eq!(staged.event.payload(), &json!({"run": 1}));
        assert_eq!(staged.event.correlation_id().as_str(), "corr-1");

        let again = fx.router.replay(&original).await.unwrap_err();
        assert!(matches!(again, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn failed_replay_restores_record() {
        let fx = fixture(Telemetry::noop());
        let (claim, event) = staged(&fx).await;
        fx.router
            .route(claim, event, DlqReason::Rejected("bad payload".into()))
            .await
            .unwrap();

        fx.staging.set_unavailable(true);
        let original = EventId::new("evt-1").unwrap();
        assert!(fx.router.replay(&original).await.is_err());
        fx.staging.set_unavailable(false);

        let records = fx.router.list(&DlqFilter::reason(DlqReasonKind::Rejected)).await.unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn delete_removes_without_publishing() {
        let fx = fixture(Telemetry::noop());
        let (claim, event) = staged(&fx).await;
        fx.router
            .route(claim, event, DlqReason::UnknownHandler)
            .await
            .unwrap();

        let original = EventId::new("evt-1").unwrap();
        fx.router.delete(&original).await.unwrap();
        assert!(fx.staging.is_empty());
        assert_eq!(fx.router.stats().await.unwrap().total, 0);
        assert!(fx.router.delete(&original).await.is_err());
    }
}
